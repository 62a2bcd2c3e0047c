use serde::Serialize;
use thiserror::Error;

/// Hint sub-codes attached to credential failures. The front end resolves
/// the combined `CODE|HINT` string to a localized message; unknown codes
/// pass through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeychainHint {
    Translocation,
    Denied,
    Unsigned,
}

impl KeychainHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeychainHint::Translocation => "HINT_KEYCHAIN_TRANSLOCATION",
            KeychainHint::Denied => "HINT_KEYCHAIN_DENIED",
            KeychainHint::Unsigned => "HINT_KEYCHAIN_UNSIGNED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationHint {
    Relogin,
    ClearData,
}

impl MigrationHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationHint::Relogin => "HINT_RELOGIN",
            MigrationHint::ClearData => "HINT_CLEAR_DATA",
        }
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no active account available")]
    NoAccount,

    #[error("upstream rejected credentials: {0}")]
    AuthRejected(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("all upstream endpoints failed: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("encryption key unavailable: {detail}")]
    KeychainUnavailable { hint: KeychainHint, detail: String },

    #[error("credential bundle unreadable: {detail}")]
    DataMigrationFailed { hint: MigrationHint, detail: String },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::NoAccount => "ERR_NO_ACCOUNT",
            ProxyError::AuthRejected(_) => "ERR_AUTH_REJECTED",
            ProxyError::RateLimited(_) => "ERR_RATE_LIMITED",
            ProxyError::UpstreamUnavailable(_) => "ERR_UPSTREAM_UNAVAILABLE",
            ProxyError::Upstream { .. } => "ERR_UPSTREAM",
            ProxyError::InvalidRequest(_) => "ERR_INVALID_REQUEST",
            ProxyError::KeychainUnavailable { .. } => "ERR_KEYCHAIN_UNAVAILABLE",
            ProxyError::DataMigrationFailed { .. } => "ERR_DATA_MIGRATION_FAILED",
            ProxyError::Invariant(_) => "ERR_INVARIANT",
            ProxyError::Network(_) => "ERR_NETWORK",
            ProxyError::Io(_) => "ERR_IO",
            ProxyError::Internal(_) => "ERR_INTERNAL",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ProxyError::KeychainUnavailable { hint, .. } => Some(hint.as_str()),
            ProxyError::DataMigrationFailed { hint, .. } => Some(hint.as_str()),
            _ => None,
        }
    }

    /// The `CODE|HINT` form that crosses the process boundary.
    pub fn wire_code(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}|{}", self.code(), hint),
            None => self.code().to_string(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ProxyError::NoAccount => 503,
            ProxyError::AuthRejected(_) => 502,
            ProxyError::RateLimited(_) => 429,
            ProxyError::UpstreamUnavailable(_) | ProxyError::Network(_) => 502,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::KeychainUnavailable { .. }
            | ProxyError::DataMigrationFailed { .. }
            | ProxyError::Invariant(_)
            | ProxyError::Io(_)
            | ProxyError::Internal(_) => 500,
        }
    }
}

impl Serialize for ProxyError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("{}: {}", self.wire_code(), self))
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
