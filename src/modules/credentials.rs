use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::constants;
use crate::error::{KeychainHint, MigrationHint, ProxyError, ProxyResult};

// Bundles carry their own 16-byte IV, so the cipher is instantiated with a
// 16-byte nonce instead of the usual 12.
type BundleCipher = AesGcm<Aes256, U16>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

// Seed of the oldest key generation, kept only so bundles written by early
// builds can still be opened and migrated forward.
const EMBEDDED_LEGACY_SEED: &[u8] = b"trestle-legacy-credential-seed-v1";

/// Result of a decrypt that may have gone through a legacy key. When
/// `reencrypted` is set the caller must rewrite storage with the new
/// bundle; the old one stays readable only as long as the legacy source
/// survives.
#[derive(Debug, Clone)]
pub struct DecryptOutcome {
    pub plaintext: String,
    pub used_fallback: bool,
    pub reencrypted: Option<String>,
}

/// Encrypts credential bundles at rest as `iv:tag:ct` (all hex) under
/// AES-256-GCM. The primary key is derived from the machine identity;
/// legacy sources are tried on decrypt and migrated away from.
pub struct CredentialStore {
    primary: OnceLock<Result<[u8; 32], (KeychainHint, String)>>,
    primary_override: Option<[u8; 32]>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            primary: OnceLock::new(),
            primary_override: None,
        }
    }

    #[cfg(test)]
    pub fn with_primary_key(key: [u8; 32]) -> Self {
        Self {
            primary: OnceLock::new(),
            primary_override: Some(key),
        }
    }

    fn primary_key(&self) -> ProxyResult<[u8; 32]> {
        if let Some(key) = self.primary_override {
            return Ok(key);
        }
        let cached = self.primary.get_or_init(obtain_primary_key);
        match cached {
            Ok(key) => Ok(*key),
            Err((hint, detail)) => Err(ProxyError::KeychainUnavailable {
                hint: *hint,
                detail: detail.clone(),
            }),
        }
    }

    fn legacy_keys(&self) -> Vec<[u8; 32]> {
        let mut keys = Vec::new();
        if let Ok(raw) = std::env::var(constants::ENV_LEGACY_KEY) {
            if let Ok(bytes) = hex::decode(raw.trim()) {
                if bytes.len() == 32 {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&bytes);
                    keys.push(key);
                }
            }
        }
        keys.push(derive_key(EMBEDDED_LEGACY_SEED));
        keys
    }

    pub fn encrypt(&self, plaintext: &str) -> ProxyResult<String> {
        let key = self.primary_key()?;
        encrypt_with_key(&key, plaintext)
            .map_err(|e| ProxyError::Internal(format!("encrypt failed: {}", e)))
    }

    /// Attempts the primary key first, then each legacy source in order. A
    /// successful fallback decrypt re-encrypts under the primary key before
    /// returning so the caller can rewrite storage.
    pub fn decrypt_with_migration(&self, bundle: &str) -> ProxyResult<DecryptOutcome> {
        let (iv, tag, ct) = parse_bundle(bundle)?;
        let primary = self.primary_key()?;

        if let Some(plaintext) = try_decrypt(&primary, &iv, &ct, &tag) {
            return Ok(DecryptOutcome {
                plaintext,
                used_fallback: false,
                reencrypted: None,
            });
        }

        for key in self.legacy_keys() {
            if let Some(plaintext) = try_decrypt(&key, &iv, &ct, &tag) {
                tracing::info!("[Credentials] Legacy bundle opened, re-encrypting under primary key");
                let reencrypted = self.encrypt(&plaintext)?;
                return Ok(DecryptOutcome {
                    plaintext,
                    used_fallback: true,
                    reencrypted: Some(reencrypted),
                });
            }
        }

        Err(ProxyError::DataMigrationFailed {
            hint: MigrationHint::Relogin,
            detail: "bundle does not decrypt under any known key".to_string(),
        })
    }

    /// Startup preflight: true when the bundle opens under some known key,
    /// without performing migration.
    pub fn verify_decryptable(&self, bundle: &str) -> ProxyResult<()> {
        self.decrypt_with_migration(bundle).map(|_| ())
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

fn derive_key(material: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    key.copy_from_slice(&Sha256::digest(material));
    key
}

fn obtain_primary_key() -> Result<[u8; 32], (KeychainHint, String)> {
    match machine_uid::get() {
        Ok(uid) if !uid.trim().is_empty() => Ok(derive_key(uid.as_bytes())),
        Ok(_) => Err((
            KeychainHint::Unsigned,
            "machine identity is empty".to_string(),
        )),
        Err(e) => {
            let detail = e.to_string();
            let hint = classify_key_failure(&detail);
            Err((hint, format!("machine identity unavailable: {}", detail)))
        }
    }
}

fn classify_key_failure(detail: &str) -> KeychainHint {
    let translocated = std::env::current_exe()
        .ok()
        .map(|p| p.to_string_lossy().contains("/AppTranslocation/"))
        .unwrap_or(false);
    if translocated {
        return KeychainHint::Translocation;
    }
    let lower = detail.to_ascii_lowercase();
    if lower.contains("denied") || lower.contains("permission") {
        KeychainHint::Denied
    } else {
        KeychainHint::Unsigned
    }
}

fn encrypt_with_key(key: &[u8; 32], plaintext: &str) -> Result<String, String> {
    let cipher = BundleCipher::new(GenericArray::from_slice(key));
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let sealed = cipher
        .encrypt(GenericArray::from_slice(&iv), plaintext.as_bytes())
        .map_err(|e| e.to_string())?;
    // The AEAD output is ciphertext with the tag appended; the bundle
    // format keeps them as separate fields.
    let split = sealed.len() - TAG_LEN;
    let (ct, tag) = sealed.split_at(split);

    Ok(format!(
        "{}:{}:{}",
        hex::encode(iv),
        hex::encode(tag),
        hex::encode(ct)
    ))
}

fn try_decrypt(key: &[u8; 32], iv: &[u8], ct: &[u8], tag: &[u8]) -> Option<String> {
    let cipher = BundleCipher::new(GenericArray::from_slice(key));
    let mut sealed = Vec::with_capacity(ct.len() + tag.len());
    sealed.extend_from_slice(ct);
    sealed.extend_from_slice(tag);
    let plaintext = cipher
        .decrypt(GenericArray::from_slice(iv), sealed.as_slice())
        .ok()?;
    String::from_utf8(plaintext).ok()
}

fn parse_bundle(bundle: &str) -> ProxyResult<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let malformed = |detail: &str| ProxyError::DataMigrationFailed {
        hint: MigrationHint::ClearData,
        detail: detail.to_string(),
    };

    let parts: Vec<&str> = bundle.split(':').collect();
    if parts.len() != 3 {
        return Err(malformed("bundle is not iv:tag:ct"));
    }
    let iv = hex::decode(parts[0]).map_err(|_| malformed("iv is not hex"))?;
    let tag = hex::decode(parts[1]).map_err(|_| malformed("tag is not hex"))?;
    let ct = hex::decode(parts[2]).map_err(|_| malformed("ciphertext is not hex"))?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(malformed("iv or tag has wrong length"));
    }
    Ok((iv, tag, ct))
}

#[cfg(test)]
pub fn encrypt_under_key_for_tests(key: &[u8; 32], plaintext: &str) -> String {
    encrypt_with_key(key, plaintext).expect("test encrypt")
}
