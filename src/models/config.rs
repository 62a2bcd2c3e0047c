use crate::constants;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-model visibility for quota aggregation. Absent key = visible.
    #[serde(default)]
    pub model_visibility: HashMap<String, bool>,

    #[serde(default = "default_true")]
    pub provider_groupings_enabled: bool,

    #[serde(default = "default_true")]
    pub auto_switch_enabled: bool,

    /// Overall-percentage floor below which the active account is swapped
    /// out when auto-switch is enabled.
    #[serde(default = "default_auto_switch_threshold")]
    pub auto_switch_threshold: f64,

    #[serde(default)]
    pub upstream_proxy: UpstreamProxyConfig,

    /// Seconds per upstream attempt; values below 1 are clamped up.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Overrides the built-in internal base URL list when non-empty.
    #[serde(default)]
    pub internal_base_urls: Vec<String>,

    #[serde(default)]
    pub request_user_agent: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

fn default_port() -> u16 {
    constants::DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_auto_switch_threshold() -> f64 {
    25.0
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            model_visibility: HashMap::new(),
            provider_groupings_enabled: true,
            auto_switch_enabled: true,
            auto_switch_threshold: default_auto_switch_threshold(),
            upstream_proxy: UpstreamProxyConfig::default(),
            request_timeout: default_request_timeout(),
            internal_base_urls: Vec::new(),
            request_user_agent: String::new(),
        }
    }
}

impl AppConfig {
    pub fn effective_request_timeout(&self) -> u64 {
        self.request_timeout.max(1)
    }

    pub fn effective_user_agent(&self) -> String {
        if self.request_user_agent.trim().is_empty() {
            constants::DEFAULT_USER_AGENT.clone()
        } else {
            self.request_user_agent.clone()
        }
    }

    /// Base URLs in resolution order: config override if non-empty, else
    /// the built-in list. Trailing slashes stripped either way.
    pub fn effective_base_urls(&self) -> Vec<String> {
        let source: Vec<String> = if self.internal_base_urls.is_empty() {
            constants::DEFAULT_INTERNAL_BASE_URLS
                .iter()
                .map(|u| (*u).to_string())
                .collect()
        } else {
            self.internal_base_urls.clone()
        };
        source
            .into_iter()
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .collect()
    }

    /// Environment overrides recognized at startup. The legacy base-URL
    /// variable is honored as an alias when the new name is unset.
    pub fn apply_env_overrides(&mut self) {
        let urls = std::env::var(constants::ENV_INTERNAL_BASE_URLS)
            .or_else(|_| std::env::var(constants::ENV_INTERNAL_BASE_URLS_LEGACY));
        if let Ok(raw) = urls {
            let parsed: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                tracing::info!("Using {} internal base URL(s) from environment", parsed.len());
                self.internal_base_urls = parsed;
            }
        }

        if let Ok(ua) = std::env::var(constants::ENV_REQUEST_USER_AGENT) {
            if !ua.trim().is_empty() {
                tracing::info!("Using request User-Agent from environment");
                self.request_user_agent = ua.trim().to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{env_lock, ScopedEnvVar};

    #[test]
    fn request_timeout_is_clamped_to_one() {
        let config = AppConfig {
            request_timeout: 0,
            ..AppConfig::default()
        };
        assert_eq!(config.effective_request_timeout(), 1);
    }

    #[test]
    fn base_urls_default_and_strip_trailing_slash() {
        let config = AppConfig::default();
        let urls = config.effective_base_urls();
        assert_eq!(urls.len(), 2);
        assert!(urls.iter().all(|u| !u.ends_with('/')));

        let config = AppConfig {
            internal_base_urls: vec!["https://example.test/v1internal/".to_string()],
            ..AppConfig::default()
        };
        assert_eq!(
            config.effective_base_urls(),
            vec!["https://example.test/v1internal".to_string()]
        );
    }

    #[test]
    fn legacy_env_name_is_honored_as_alias() {
        let _guard = env_lock();
        let _new = ScopedEnvVar::unset(crate::constants::ENV_INTERNAL_BASE_URLS);
        let _legacy = ScopedEnvVar::set(
            crate::constants::ENV_INTERNAL_BASE_URLS_LEGACY,
            "https://a.test/v1internal, https://b.test/v1internal/",
        );

        let mut config = AppConfig::default();
        config.apply_env_overrides();
        assert_eq!(
            config.internal_base_urls,
            vec![
                "https://a.test/v1internal".to_string(),
                "https://b.test/v1internal".to_string()
            ]
        );
    }

    #[test]
    fn user_agent_env_override() {
        let _guard = env_lock();
        let _ua = ScopedEnvVar::set(crate::constants::ENV_REQUEST_USER_AGENT, "probe/1.0");

        let mut config = AppConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.effective_user_agent(), "probe/1.0");
    }
}
