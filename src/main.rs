use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trestle::modules::{credentials::CredentialStore, persistence};
use trestle::proxy::{server, state::AppState};

/// Before serving, make sure every persisted credential bundle still opens
/// under some known key. An unobtainable primary key means encrypted
/// operations would fail at runtime, so refuse to start; a single
/// unreadable bundle only quarantines that account later.
fn startup_preflight(credentials: &CredentialStore) -> Result<(), String> {
    let accounts = persistence::list_accounts()?;
    for account in &accounts {
        match credentials.verify_decryptable(&account.credentials) {
            Ok(()) => {}
            Err(e @ trestle::error::ProxyError::KeychainUnavailable { .. }) => {
                return Err(format!(
                    "startup_encryption_preflight_failed: {} Remediation: ensure the machine \
                     identity is readable, or set {} and re-authorize accounts.",
                    e,
                    trestle::constants::ENV_LEGACY_KEY
                ));
            }
            Err(e) => {
                warn!(
                    "[Preflight] Account {} ({}) has an unreadable bundle: {}",
                    account.email, account.id, e
                );
            }
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let credentials = std::sync::Arc::new(CredentialStore::new());
    if let Err(e) = startup_preflight(&credentials) {
        error!("[E-CRYPTO-KEY-UNAVAILABLE] {}", e);
        std::process::exit(1);
    }

    let mut config = match persistence::load_settings() {
        Ok(c) => c,
        Err(e) => {
            error!("[E-CONFIG-LOAD] failed_to_load_settings: {}", e);
            std::process::exit(1);
        }
    };
    config.apply_env_overrides();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let state = AppState::build(config, credentials);

        match state.pool.load_from_disk() {
            Ok(count) => info!("Loaded {} account(s)", count),
            Err(e) => warn!("[W-POOL-LOAD] failed_to_load_accounts: {}", e),
        }

        state.poller.spawn();

        if let Err(e) = server::serve(state).await {
            error!("[E-RUNTIME] {}", e);
            std::process::exit(1);
        }
    });
}
