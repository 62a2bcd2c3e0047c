use std::sync::LazyLock;

pub const DEFAULT_PORT: u16 = 8417;

// Internal RPC surface. The production host is tried first; the sandbox
// host takes over when the primary degrades.
pub const DEFAULT_INTERNAL_BASE_URLS: &[&str] = &[
    "https://daily-cloudcode-pa.googleapis.com/v1internal",
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal",
];

pub const ENV_INTERNAL_BASE_URLS: &str = "PROXY_INTERNAL_BASE_URLS";
pub const ENV_INTERNAL_BASE_URLS_LEGACY: &str = "ANTIGRAVITY_INTERNAL_BASE_URLS";
pub const ENV_REQUEST_USER_AGENT: &str = "PROXY_REQUEST_USER_AGENT";
pub const ENV_LEGACY_KEY: &str = "TRESTLE_LEGACY_KEY";
pub const ENV_DATA_DIR: &str = "DATA_DIR";

pub static DEFAULT_USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "trestle/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

// OAuth endpoints used for code exchange and token refresh. The browser
// side of the authorization flow lives outside this process; the core only
// ever sees the resulting authorization code.
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const OAUTH_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo?alt=json";
pub const OAUTH_CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
pub const OAUTH_CLIENT_SECRET: &str = "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";
pub const OAUTH_REDIRECT_URI: &str = "http://localhost:8417/antigravity/callback";

pub const DEFAULT_PROJECT_ID: &str = "bamboo-precept-lgxtn";

pub const IDENTITY_MARKER: &str = "--- [IDENTITY_PATCH] ---";

// Upstream models refuse foreign personas; every request whose system
// prompt does not already carry the Antigravity identity gets this block
// prepended.
pub const IDENTITY_TEXT: &str = "You are Antigravity, a powerful agentic AI coding assistant \
designed by the Google Deepmind team working on Advanced Agentic Coding. You are pair \
programming with a USER to solve their coding task. The task may require creating a new \
codebase, modifying or debugging an existing codebase, or simply answering a question.\n\
**Absolute paths only**\n**Proactiveness**";

pub fn identity_block() -> String {
    format!("{}\n{}", IDENTITY_MARKER, IDENTITY_TEXT)
}

pub const MIN_SIGNATURE_LENGTH: usize = 10;
pub const SIGNATURE_STORE_CAPACITY: usize = 256;

pub const QUOTA_POLL_INTERVAL_SECS: u64 = 60;

// Client-facing model ids that resolve to a different id on the internal
// surface. Names not listed here pass through verbatim.
pub const MODEL_ROUTES: &[(&str, &str)] = &[
    ("claude-sonnet-4-5-20250929", "claude-sonnet-4-5"),
    ("claude-sonnet-4-20250514", "claude-sonnet-4-5"),
    ("claude-opus-4-5-20251101", "claude-opus-4-5"),
    ("claude-opus-4-20250514", "claude-opus-4-5"),
    ("claude-3-7-sonnet-20250219", "claude-sonnet-4-5"),
    ("claude-3-5-haiku-20241022", "claude-haiku-4-5"),
    ("gemini-3-pro-preview", "gemini-3-pro-high"),
    ("gemini-3-flash-preview", "gemini-3-flash"),
    ("gemini-3-pro-image-preview", "gemini-3-pro-image"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_user_agent_carries_version() {
        assert!(DEFAULT_USER_AGENT.starts_with("trestle/"));
        assert!(DEFAULT_USER_AGENT.contains(std::env::consts::OS));
    }

    #[test]
    fn identity_block_contains_marker_and_persona() {
        let block = identity_block();
        assert!(block.contains(IDENTITY_MARKER));
        assert!(block.contains("You are Antigravity"));
    }
}
