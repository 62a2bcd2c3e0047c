use std::fs;
use std::path::PathBuf;

use crate::constants;
use crate::models::{Account, AppConfig};

const DATA_DIR: &str = ".trestle";
const ACCOUNTS_DIR: &str = "accounts";
const SETTINGS_FILE: &str = "settings.json";

pub fn get_data_dir() -> Result<PathBuf, String> {
    fn ensure_dir(path: &PathBuf) -> Result<(), String> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
        }
        Ok(())
    }

    if let Ok(env_path) = std::env::var(constants::ENV_DATA_DIR) {
        if !env_path.trim().is_empty() {
            let data_dir = PathBuf::from(env_path);
            ensure_dir(&data_dir)?;
            return Ok(data_dir);
        }
    }
    if cfg!(test) {
        let data_dir = std::env::temp_dir().join(format!(".trestle-test-{}", std::process::id()));
        ensure_dir(&data_dir)?;
        return Ok(data_dir);
    }

    if let Some(home) = dirs::home_dir() {
        let data_dir = home.join(DATA_DIR);
        if ensure_dir(&data_dir).is_ok() {
            return Ok(data_dir);
        }
    }
    let fallback = std::env::temp_dir().join(DATA_DIR);
    ensure_dir(&fallback)?;
    Ok(fallback)
}

pub fn get_accounts_dir() -> Result<PathBuf, String> {
    let dir = get_data_dir()?.join(ACCOUNTS_DIR);
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|e| format!("failed_to_create_accounts_dir: {}", e))?;
    }
    Ok(dir)
}

// Rename-on-write so a crash mid-write never leaves a truncated document.
fn write_atomic(path: &PathBuf, content: &str) -> Result<(), String> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).map_err(|e| format!("failed_to_write_temp_file: {}", e))?;
    fs::rename(&tmp, path).map_err(|e| format!("failed_to_replace_file: {}", e))
}

pub fn save_account(account: &Account) -> Result<(), String> {
    let path = get_accounts_dir()?.join(format!("{}.json", account.id));
    let content = serde_json::to_string_pretty(account)
        .map_err(|e| format!("failed_to_serialize_account: {}", e))?;
    write_atomic(&path, &content)
}

pub fn load_account(account_id: &str) -> Result<Account, String> {
    let path = get_accounts_dir()?.join(format!("{}.json", account_id));
    if !path.exists() {
        return Err(format!("account not found: {}", account_id));
    }
    let content =
        fs::read_to_string(&path).map_err(|e| format!("failed_to_read_account: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_account: {}", e))
}

/// Deleting the document also destroys its credential bundle; there is no
/// other copy of the ciphertext.
pub fn delete_account(account_id: &str) -> Result<(), String> {
    let path = get_accounts_dir()?.join(format!("{}.json", account_id));
    if path.exists() {
        fs::remove_file(&path).map_err(|e| format!("failed_to_delete_account: {}", e))?;
    }
    Ok(())
}

pub fn list_accounts() -> Result<Vec<Account>, String> {
    let dir = get_accounts_dir()?;
    let mut accounts = Vec::new();
    let entries = fs::read_dir(&dir).map_err(|e| format!("failed_to_read_accounts_dir: {}", e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Account>(&content) {
                Ok(account) => accounts.push(account),
                Err(e) => tracing::warn!("[Persistence] Skipping unparseable account {:?}: {}", path, e),
            },
            Err(e) => tracing::warn!("[Persistence] Skipping unreadable account {:?}: {}", path, e),
        }
    }
    accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(accounts)
}

pub fn load_settings() -> Result<AppConfig, String> {
    let path = get_data_dir()?.join(SETTINGS_FILE);
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let content =
        fs::read_to_string(&path).map_err(|e| format!("failed_to_read_settings: {}", e))?;
    if content.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_settings: {}", e))
}

pub fn save_settings(config: &AppConfig) -> Result<(), String> {
    let path = get_data_dir()?.join(SETTINGS_FILE);
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed_to_serialize_settings: {}", e))?;
    write_atomic(&path, &content)
}
