use crate::models::quota::QuotaData;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Idle,
    RateLimited,
    Error,
}

/// Decrypted credential material. Persisted only as a ciphertext bundle in
/// `Account::credentials`; the plaintext form never touches disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: String,
    /// Unix timestamp after which `access_token` must be refreshed.
    #[serde(default)]
    pub expiry_timestamp: i64,
}

impl TokenData {
    pub fn is_expired(&self) -> bool {
        // 60 s of skew so a token never dies mid-flight.
        self.expiry_timestamp <= chrono::Utc::now().timestamp() + 60
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub provider: String,
    pub status: AccountStatus,
    #[serde(default)]
    pub is_active: bool,
    pub created_at: i64,
    pub last_used: i64,
    /// `iv:tag:ct` hex bundle produced by the credential store.
    pub credentials: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaData>,
}

impl Account {
    pub fn new(email: String, credentials: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            name: None,
            avatar_url: None,
            provider: "antigravity".to_string(),
            status: AccountStatus::Idle,
            is_active: false,
            created_at: now,
            last_used: now,
            credentials,
            project_id: None,
            quota: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = chrono::Utc::now().timestamp();
    }

    /// Listing view with the credential bundle stripped.
    pub fn redacted(&self) -> AccountView {
        AccountView {
            id: self.id.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            provider: self.provider.clone(),
            status: self.status,
            is_active: self.is_active,
            created_at: self.created_at,
            last_used: self.last_used,
            quota: self.quota.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountView {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub provider: String,
    pub status: AccountStatus,
    pub is_active: bool,
    pub created_at: i64,
    pub last_used: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaData>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_account_starts_idle_and_inactive() {
        let account = Account::new("a@example.com".to_string(), "00:00:00".to_string());
        assert_eq!(account.status, AccountStatus::Idle);
        assert!(!account.is_active);
        assert_eq!(account.provider, "antigravity");
    }

    #[test]
    fn redacted_view_drops_credentials() {
        let account = Account::new("a@example.com".to_string(), "aa:bb:cc".to_string());
        let view = serde_json::to_value(account.redacted()).unwrap();
        assert!(view.get("credentials").is_none());
        assert_eq!(view["email"], "a@example.com");
    }

    #[test]
    fn token_expiry_uses_skew() {
        let token = TokenData {
            access_token: "t".to_string(),
            refresh_token: "r".to_string(),
            token_type: "Bearer".to_string(),
            expiry_timestamp: chrono::Utc::now().timestamp() + 30,
        };
        assert!(token.is_expired());

        let token = TokenData {
            expiry_timestamp: chrono::Utc::now().timestamp() + 3600,
            ..token
        };
        assert!(!token.is_expired());
    }
}
