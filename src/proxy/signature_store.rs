use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::constants::{MIN_SIGNATURE_LENGTH, SIGNATURE_STORE_CAPACITY};

#[derive(Clone, Debug)]
struct StoredSignature {
    signature: String,
    #[allow(dead_code)]
    created_at: SystemTime,
}

struct Inner {
    entries: HashMap<String, StoredSignature>,
    // Recency order, least recent at the front.
    order: VecDeque<String>,
}

/// Process-wide cache of opaque thought signatures keyed by conversation
/// turn fingerprint. Bounded by LRU; entries live until evicted or the
/// process exits, with no TTL and no persistence. Owned by the
/// application object and threaded through the transformer so tests stay
/// hermetic.
pub struct SignatureStore {
    inner: Mutex<Inner>,
    capacity: usize,
}

/// Blobs shorter than this are indistinguishable from noise and are never
/// stored.
pub fn is_valid_signature(signature: &str) -> bool {
    signature.len() >= MIN_SIGNATURE_LENGTH
}

/// Stable fingerprint of a conversation turn, derived from its text.
pub fn turn_fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

impl SignatureStore {
    pub fn new() -> Self {
        Self::with_capacity(SIGNATURE_STORE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn store(&self, fingerprint: &str, signature: &str) {
        if !is_valid_signature(signature) {
            tracing::debug!(
                "[SignatureStore] Rejecting signature below minimum length ({} chars)",
                signature.len()
            );
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.entries.contains_key(fingerprint) {
            inner.order.retain(|k| k != fingerprint);
        }
        inner.entries.insert(
            fingerprint.to_string(),
            StoredSignature {
                signature: signature.to_string(),
                created_at: SystemTime::now(),
            },
        );
        inner.order.push_back(fingerprint.to_string());

        while inner.entries.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
                tracing::debug!("[SignatureStore] Evicted oldest entry at capacity {}", self.capacity);
            } else {
                break;
            }
        }
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<String> {
        let mut inner = self.inner.lock().ok()?;
        if !inner.entries.contains_key(fingerprint) {
            return None;
        }
        inner.order.retain(|k| k != fingerprint);
        inner.order.push_back(fingerprint.to_string());
        inner.entries.get(fingerprint).map(|e| e.signature.clone())
    }

    /// True when any stored signature passes the validity rule.
    pub fn has_valid(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.entries.values().any(|e| is_valid_signature(&e.signature)))
            .unwrap_or(false)
    }

    /// True when this exact signature blob is present under any key.
    pub fn has(&self, signature: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.entries.values().any(|e| e.signature == signature))
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.order.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SignatureStore {
    fn default() -> Self {
        Self::new()
    }
}
