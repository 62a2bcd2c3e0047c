use std::sync::{Arc, RwLock};

use crate::models::AppConfig;
use crate::modules::credentials::CredentialStore;
use crate::proxy::pool::{poller::QuotaPoller, AccountPool};
use crate::proxy::signature_store::SignatureStore;
use crate::proxy::upstream::UpstreamDispatcher;

/// Everything the request handlers need. The signature store, the pool and
/// the credential store are process-wide singletons owned here rather than
/// as globals, so tests can build isolated instances.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<AccountPool>,
    pub signatures: Arc<SignatureStore>,
    pub upstream: Arc<UpstreamDispatcher>,
    pub poller: Arc<QuotaPoller>,
    pub credentials: Arc<CredentialStore>,
    pub config: Arc<RwLock<AppConfig>>,
    pub http: reqwest::Client,
}

impl AppState {
    /// Builds the application object around the process-wide credential
    /// store handle.
    pub fn build(config: AppConfig, credentials: Arc<CredentialStore>) -> Self {
        let config = Arc::new(RwLock::new(config));
        let pool = AccountPool::new(credentials.clone(), config.clone());
        let upstream = Arc::new(UpstreamDispatcher::new(
            &config.read().expect("config lock"),
        ));
        let poller = QuotaPoller::new(pool.clone(), upstream.clone());

        Self {
            pool,
            signatures: Arc::new(SignatureStore::new()),
            upstream,
            poller,
            credentials,
            config,
            http: reqwest::Client::new(),
        }
    }
}
