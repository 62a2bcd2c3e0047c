pub mod poller;

use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

use crate::constants;
use crate::error::{ProxyError, ProxyResult};
use crate::models::{Account, AccountStatus, AccountView, AppConfig, QuotaData, TokenData};
use crate::modules::{auth, credentials::CredentialStore, persistence};

#[derive(Debug, Clone)]
pub enum PoolEvent {
    QuotaUpdated {
        id: String,
    },
    StatusChanged {
        id: String,
        from: AccountStatus,
        to: AccountStatus,
    },
    /// The active account crossed below the auto-switch threshold; the
    /// pool decides whether a switch actually happens.
    AutoSwitchCandidate {
        id: String,
    },
    ActiveChanged {
        from: Option<String>,
        to: String,
    },
    NoCapacity,
}

/// Ordered set of accounts with selection policy. All mutations go through
/// one short-held lock; network I/O never happens under it. At most one
/// account is active at any time.
pub struct AccountPool {
    accounts: Mutex<Vec<Account>>,
    events: broadcast::Sender<PoolEvent>,
    credentials: Arc<CredentialStore>,
    config: Arc<RwLock<AppConfig>>,
}

impl AccountPool {
    pub fn new(credentials: Arc<CredentialStore>, config: Arc<RwLock<AppConfig>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            accounts: Mutex::new(Vec::new()),
            events,
            credentials,
            config,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    fn persist(account: &Account) {
        if let Err(e) = persistence::save_account(account) {
            tracing::warn!("[Pool] Failed to persist account {}: {}", account.id, e);
        }
    }

    /// Populates the pool from disk. More than one persisted active
    /// account is a selection inconsistency: the first wins, the rest are
    /// demoted and logged.
    pub fn load_from_disk(&self) -> ProxyResult<usize> {
        let mut loaded =
            persistence::list_accounts().map_err(ProxyError::Internal)?;
        let mut seen_active = false;
        for account in loaded.iter_mut() {
            if account.is_active {
                if seen_active {
                    tracing::error!(
                        "[Pool] Selection inconsistency: demoting extra active account {}",
                        account.id
                    );
                    account.is_active = false;
                    account.status = AccountStatus::Idle;
                    Self::persist(account);
                } else {
                    seen_active = true;
                }
            }
        }
        let count = loaded.len();
        *self.accounts.lock().expect("pool lock") = loaded;
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.accounts.lock().expect("pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<AccountView> {
        self.accounts
            .lock()
            .expect("pool lock")
            .iter()
            .map(Account::redacted)
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Account> {
        self.accounts
            .lock()
            .expect("pool lock")
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    pub fn get_active(&self) -> Option<Account> {
        self.accounts
            .lock()
            .expect("pool lock")
            .iter()
            .find(|a| a.is_active)
            .cloned()
    }

    pub fn quota_snapshots(&self) -> Vec<QuotaData> {
        self.accounts
            .lock()
            .expect("pool lock")
            .iter()
            .filter_map(|a| a.quota.clone())
            .collect()
    }

    /// Inserts a fully built account. Duplicate emails are rejected unless
    /// the caller opted into replacement, in which case the old account's
    /// document (and credential bundle) is destroyed.
    pub fn insert_account(&self, account: Account, replace: bool) -> ProxyResult<AccountView> {
        let mut accounts = self.accounts.lock().expect("pool lock");
        if let Some(pos) = accounts.iter().position(|a| a.email == account.email) {
            if !replace {
                return Err(ProxyError::InvalidRequest(format!(
                    "account for {} already exists",
                    account.email
                )));
            }
            let old = accounts.remove(pos);
            if let Err(e) = persistence::delete_account(&old.id) {
                tracing::warn!("[Pool] Failed to purge replaced account {}: {}", old.id, e);
            }
        }
        let view = account.redacted();
        Self::persist(&account);
        accounts.push(account);
        tracing::info!("[Pool] Added account {} ({})", view.email, view.id);
        Ok(view)
    }

    /// Exchanges an authorization code, resolves the user's identity, and
    /// adds the account with its credentials encrypted at rest.
    pub async fn add(
        &self,
        client: &reqwest::Client,
        auth_code: &str,
        replace: bool,
    ) -> ProxyResult<AccountView> {
        let token_response = auth::exchange_auth_code(
            client,
            auth_code,
            constants::OAUTH_REDIRECT_URI,
            None,
        )
        .await?;
        let user = auth::fetch_user_info(client, &token_response.access_token)
            .await
            .unwrap_or(auth::UserInfo {
                email: None,
                name: None,
                picture: None,
            });

        let token = token_response.into_token_data(None);
        let bundle = self.credentials.encrypt(
            &serde_json::to_string(&token)
                .map_err(|e| ProxyError::Internal(format!("token serialize failed: {}", e)))?,
        )?;

        let email = user
            .email
            .unwrap_or_else(|| format!("unknown-{}", uuid::Uuid::new_v4().simple()));
        let mut account = Account::new(email, bundle);
        account.name = user.name;
        account.avatar_url = user.picture;
        self.insert_account(account, replace)
    }

    /// Imports an IDE-managed account: the caller supplies the refresh
    /// token it found locally, the pool encrypts and owns it from then on.
    pub fn import_local(
        &self,
        email: &str,
        refresh_token: &str,
        project_id: Option<String>,
    ) -> ProxyResult<AccountView> {
        let token = TokenData {
            access_token: String::new(),
            refresh_token: refresh_token.to_string(),
            token_type: "Bearer".to_string(),
            expiry_timestamp: 0,
        };
        let bundle = self.credentials.encrypt(
            &serde_json::to_string(&token)
                .map_err(|e| ProxyError::Internal(format!("token serialize failed: {}", e)))?,
        )?;
        let mut account = Account::new(email.to_string(), bundle);
        account.project_id = project_id;
        self.insert_account(account, true)
    }

    pub fn delete(&self, id: &str) -> ProxyResult<()> {
        let mut accounts = self.accounts.lock().expect("pool lock");
        let Some(pos) = accounts.iter().position(|a| a.id == id) else {
            return Err(ProxyError::InvalidRequest(format!("no such account: {}", id)));
        };
        let removed = accounts.remove(pos);
        drop(accounts);
        // The document holds the only ciphertext copy; deleting it purges
        // the credential bundle.
        persistence::delete_account(&removed.id).map_err(ProxyError::Internal)?;
        tracing::info!("[Pool] Deleted account {} ({})", removed.email, removed.id);
        Ok(())
    }

    /// Transactional selection: the target becomes the single active
    /// account, everything else is demoted, and all touched documents are
    /// persisted before the lock is released.
    pub fn switch_to(&self, id: &str) -> ProxyResult<()> {
        let mut accounts = self.accounts.lock().expect("pool lock");
        if !accounts.iter().any(|a| a.id == id) {
            return Err(ProxyError::InvalidRequest(format!("no such account: {}", id)));
        }
        let previous = accounts.iter().find(|a| a.is_active).map(|a| a.id.clone());
        let mut events = Vec::new();

        for account in accounts.iter_mut() {
            let should_be_active = account.id == id;
            if account.is_active == should_be_active
                && (!should_be_active || account.status == AccountStatus::Active)
            {
                continue;
            }
            let from = account.status;
            account.is_active = should_be_active;
            account.status = if should_be_active {
                AccountStatus::Active
            } else if from == AccountStatus::Active {
                AccountStatus::Idle
            } else {
                from
            };
            if from != account.status {
                events.push(PoolEvent::StatusChanged {
                    id: account.id.clone(),
                    from,
                    to: account.status,
                });
            }
            Self::persist(account);
        }
        drop(accounts);

        for event in events {
            self.emit(event);
        }
        self.emit(PoolEvent::ActiveChanged {
            from: previous,
            to: id.to_string(),
        });
        Ok(())
    }

    pub fn touch(&self, id: &str) {
        let mut accounts = self.accounts.lock().expect("pool lock");
        if let Some(account) = accounts.iter_mut().find(|a| a.id == id) {
            account.touch();
            Self::persist(account);
        }
    }

    fn set_status_locked(
        account: &mut Account,
        to: AccountStatus,
        events: &mut Vec<PoolEvent>,
    ) {
        if account.status == to {
            return;
        }
        let from = account.status;
        account.status = to;
        events.push(PoolEvent::StatusChanged {
            id: account.id.clone(),
            from,
            to,
        });
        Self::persist(account);
    }

    pub fn mark_rate_limited(&self, id: &str) {
        let mut events = Vec::new();
        {
            let mut accounts = self.accounts.lock().expect("pool lock");
            if let Some(account) = accounts.iter_mut().find(|a| a.id == id) {
                Self::set_status_locked(account, AccountStatus::RateLimited, &mut events);
            }
            self.auto_switch_locked(&mut accounts, &mut events);
        }
        for event in events {
            self.emit(event);
        }
    }

    /// Authentication failures quarantine the account: the poller skips
    /// it and selection never picks it, but it stays in the pool until the
    /// user deletes or re-authorizes it.
    pub fn mark_error(&self, id: &str) {
        let mut events = Vec::new();
        {
            let mut accounts = self.accounts.lock().expect("pool lock");
            if let Some(account) = accounts.iter_mut().find(|a| a.id == id) {
                Self::set_status_locked(account, AccountStatus::Error, &mut events);
            }
            self.auto_switch_locked(&mut accounts, &mut events);
        }
        for event in events {
            self.emit(event);
        }
    }

    /// Applies a freshly polled snapshot atomically and derives status
    /// transitions from it: exhaustion marks the account rate-limited, a
    /// recovered snapshot (reset boundary crossed) lifts it back.
    pub fn apply_quota(&self, id: &str, quota: QuotaData) {
        let (visibility, threshold) = {
            let config = self.config.read().expect("config lock");
            (
                config.model_visibility.clone(),
                config.auto_switch_threshold,
            )
        };
        let mut events = Vec::new();
        {
            let mut accounts = self.accounts.lock().expect("pool lock");
            let Some(account) = accounts.iter_mut().find(|a| a.id == id) else {
                return;
            };
            let overall = quota.overall_percentage(&visibility);
            let exhausted = quota.all_exhausted(&visibility);
            account.quota = Some(quota);
            Self::persist(account);
            events.push(PoolEvent::QuotaUpdated {
                id: account.id.clone(),
            });

            match account.status {
                AccountStatus::Active | AccountStatus::Idle if exhausted => {
                    Self::set_status_locked(account, AccountStatus::RateLimited, &mut events);
                }
                AccountStatus::RateLimited if !exhausted => {
                    let to = if account.is_active {
                        AccountStatus::Active
                    } else {
                        AccountStatus::Idle
                    };
                    Self::set_status_locked(account, to, &mut events);
                }
                _ => {}
            }

            if account.is_active
                && (overall < threshold || account.status == AccountStatus::RateLimited)
            {
                events.push(PoolEvent::AutoSwitchCandidate {
                    id: account.id.clone(),
                });
            }
            self.auto_switch_locked(&mut accounts, &mut events);
        }
        for event in events {
            self.emit(event);
        }
    }

    pub fn update_credentials(&self, id: &str, bundle: String) {
        let mut accounts = self.accounts.lock().expect("pool lock");
        if let Some(account) = accounts.iter_mut().find(|a| a.id == id) {
            account.credentials = bundle;
            Self::persist(account);
        }
    }

    pub fn set_project_id(&self, id: &str, project_id: String) {
        let mut accounts = self.accounts.lock().expect("pool lock");
        if let Some(account) = accounts.iter_mut().find(|a| a.id == id) {
            if account.project_id.as_deref() != Some(project_id.as_str()) {
                account.project_id = Some(project_id);
                Self::persist(account);
            }
        }
    }

    /// Swaps the active account when it can no longer serve: picks the
    /// non-rate-limited candidate with the highest overall percentage,
    /// ties broken by most recent use. With no qualifying candidate the
    /// current selection stays and `NoCapacity` is emitted.
    fn auto_switch_locked(&self, accounts: &mut [Account], events: &mut Vec<PoolEvent>) {
        let (enabled, visibility, threshold) = {
            let config = self.config.read().expect("config lock");
            (
                config.auto_switch_enabled,
                config.model_visibility.clone(),
                config.auto_switch_threshold,
            )
        };
        if !enabled {
            return;
        }
        let Some(active_pos) = accounts.iter().position(|a| a.is_active) else {
            return;
        };

        let overall = |a: &Account| -> f64 {
            a.quota
                .as_ref()
                .map(|q| q.overall_percentage(&visibility))
                .unwrap_or(100.0)
        };
        let active = &accounts[active_pos];
        let needs_switch =
            active.status == AccountStatus::RateLimited || overall(active) < threshold;
        if !needs_switch {
            return;
        }
        let active_id = active.id.clone();

        let candidate = accounts
            .iter()
            .filter(|a| {
                a.id != active_id
                    && a.status != AccountStatus::RateLimited
                    && a.status != AccountStatus::Error
            })
            .max_by(|a, b| {
                overall(a)
                    .partial_cmp(&overall(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.last_used.cmp(&b.last_used))
            })
            .map(|a| a.id.clone());

        let Some(target_id) = candidate else {
            tracing::warn!("[Pool] Auto-switch wanted but no account has capacity");
            events.push(PoolEvent::NoCapacity);
            return;
        };

        tracing::info!(
            "[Pool] Auto-switching active account {} -> {}",
            active_id,
            target_id
        );
        for account in accounts.iter_mut() {
            let should_be_active = account.id == target_id;
            if account.is_active == should_be_active {
                if should_be_active && account.status != AccountStatus::Active {
                    Self::set_status_locked(account, AccountStatus::Active, events);
                }
                continue;
            }
            account.is_active = should_be_active;
            if should_be_active {
                Self::set_status_locked(account, AccountStatus::Active, events);
            } else if account.status == AccountStatus::Active {
                Self::set_status_locked(account, AccountStatus::Idle, events);
            }
            Self::persist(account);
        }
        events.push(PoolEvent::ActiveChanged {
            from: Some(active_id),
            to: target_id,
        });
    }

    /// Decrypts (migrating if needed) and refreshes the account's bearer
    /// token. Rotated credentials are re-encrypted and persisted before the
    /// token is handed out.
    pub async fn bearer_token_for(
        &self,
        client: &reqwest::Client,
        id: &str,
    ) -> ProxyResult<String> {
        let account = self
            .get(id)
            .ok_or_else(|| ProxyError::InvalidRequest(format!("no such account: {}", id)))?;

        let outcome = self.credentials.decrypt_with_migration(&account.credentials)?;
        if let Some(reencrypted) = &outcome.reencrypted {
            self.update_credentials(id, reencrypted.clone());
        }
        let mut token: TokenData = serde_json::from_str(&outcome.plaintext).map_err(|e| {
            ProxyError::DataMigrationFailed {
                hint: crate::error::MigrationHint::ClearData,
                detail: format!("credential payload is not token data: {}", e),
            }
        })?;

        if token.is_expired() {
            if token.refresh_token.is_empty() {
                self.mark_error(id);
                return Err(ProxyError::AuthRejected(
                    "access token expired and no refresh token is stored".to_string(),
                ));
            }
            let refreshed = match auth::refresh_access_token(client, &token.refresh_token).await {
                Ok(r) => r,
                Err(e) => {
                    self.mark_error(id);
                    return Err(e);
                }
            };
            token = refreshed.into_token_data(Some(token.refresh_token));
            let bundle = self.credentials.encrypt(
                &serde_json::to_string(&token)
                    .map_err(|e| ProxyError::Internal(format!("token serialize failed: {}", e)))?,
            )?;
            self.update_credentials(id, bundle);
            tracing::debug!("[Pool] Refreshed bearer token for account {}", id);
        }

        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::quota::QuotaData;

    fn test_pool() -> (Arc<AccountPool>, Arc<RwLock<AppConfig>>) {
        let credentials = Arc::new(CredentialStore::with_primary_key([42u8; 32]));
        let config = Arc::new(RwLock::new(AppConfig::default()));
        (AccountPool::new(credentials, config.clone()), config)
    }

    fn seed(pool: &AccountPool, email: &str) -> String {
        let account = Account::new(email.to_string(), "aa:bb:cc".to_string());
        pool.insert_account(account, false).unwrap().id
    }

    fn quota_with(pct: f64) -> QuotaData {
        let mut q = QuotaData::new();
        q.add_model("claude-sonnet-4-5", pct, None);
        q
    }

    fn drain(rx: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn switch_to_keeps_exactly_one_active() {
        let (pool, _) = test_pool();
        let a = seed(&pool, "a@example.com");
        let b = seed(&pool, "b@example.com");
        let c = seed(&pool, "c@example.com");

        for target in [&a, &b, &c, &b] {
            pool.switch_to(target).unwrap();
            let actives: Vec<_> = pool
                .list()
                .into_iter()
                .filter(|v| v.is_active)
                .collect();
            assert_eq!(actives.len(), 1);
            assert_eq!(actives[0].id.as_str(), target.as_str());
            assert_eq!(actives[0].status, AccountStatus::Active);
        }
        let _ = (pool.delete(&a), pool.delete(&b), pool.delete(&c));
    }

    #[test]
    fn duplicate_email_rejected_unless_replacing() {
        let (pool, _) = test_pool();
        let first = seed(&pool, "dup@example.com");

        let again = Account::new("dup@example.com".to_string(), "dd:ee:ff".to_string());
        assert!(pool.insert_account(again.clone(), false).is_err());

        let replaced = pool.insert_account(again, true).unwrap();
        assert_ne!(replaced.id, first);
        assert_eq!(pool.len(), 1);
        let _ = pool.delete(&replaced.id);
    }

    #[test]
    fn rate_limit_triggers_auto_switch_to_best_candidate() {
        let (pool, _) = test_pool();
        let a = seed(&pool, "as-a@example.com");
        let b = seed(&pool, "as-b@example.com");
        let c = seed(&pool, "as-c@example.com");
        pool.switch_to(&a).unwrap();
        pool.apply_quota(&b, quota_with(80.0));
        pool.apply_quota(&c, quota_with(40.0));

        let mut rx = pool.subscribe();
        pool.mark_rate_limited(&a);

        let active = pool.get_active().unwrap();
        assert_eq!(active.id, b, "highest overall percentage wins");
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            PoolEvent::ActiveChanged { to, .. } if *to == b
        )));
        let _ = (pool.delete(&a), pool.delete(&b), pool.delete(&c));
    }

    #[test]
    fn auto_switch_tie_breaks_by_most_recent_use() {
        let (pool, _) = test_pool();
        let a = seed(&pool, "tie-a@example.com");
        let b = seed(&pool, "tie-b@example.com");
        let c = seed(&pool, "tie-c@example.com");
        pool.switch_to(&a).unwrap();
        pool.apply_quota(&b, quota_with(60.0));
        pool.apply_quota(&c, quota_with(60.0));

        {
            let mut accounts = pool.accounts.lock().unwrap();
            for account in accounts.iter_mut() {
                if account.id == c {
                    account.last_used += 1000;
                }
            }
        }

        pool.mark_rate_limited(&a);
        assert_eq!(pool.get_active().unwrap().id, c);
        let _ = (pool.delete(&a), pool.delete(&b), pool.delete(&c));
    }

    #[test]
    fn no_candidate_keeps_active_and_emits_no_capacity() {
        let (pool, _) = test_pool();
        let a = seed(&pool, "nc-a@example.com");
        let b = seed(&pool, "nc-b@example.com");
        pool.switch_to(&a).unwrap();
        pool.mark_rate_limited(&b);

        let mut rx = pool.subscribe();
        pool.mark_rate_limited(&a);

        let active = pool.get_active().unwrap();
        assert_eq!(active.id, a);
        assert_eq!(active.status, AccountStatus::RateLimited);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, PoolEvent::NoCapacity)));
        let _ = (pool.delete(&a), pool.delete(&b));
    }

    #[test]
    fn auto_switch_can_be_disabled() {
        let (pool, config) = test_pool();
        config.write().unwrap().auto_switch_enabled = false;
        let a = seed(&pool, "off-a@example.com");
        let b = seed(&pool, "off-b@example.com");
        pool.switch_to(&a).unwrap();
        pool.apply_quota(&b, quota_with(90.0));

        pool.mark_rate_limited(&a);
        assert_eq!(pool.get_active().unwrap().id, a);
        let _ = (pool.delete(&a), pool.delete(&b));
    }

    #[test]
    fn exhausted_quota_marks_rate_limited_and_recovery_lifts_it() {
        let (pool, config) = test_pool();
        config.write().unwrap().auto_switch_enabled = false;
        let a = seed(&pool, "q-a@example.com");

        let mut rx = pool.subscribe();
        pool.apply_quota(&a, quota_with(0.0));
        assert_eq!(pool.get(&a).unwrap().status, AccountStatus::RateLimited);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::StatusChanged { to: AccountStatus::RateLimited, .. }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, PoolEvent::QuotaUpdated { .. })));

        // Next poll after the reset boundary shows capacity again.
        pool.apply_quota(&a, quota_with(100.0));
        assert_eq!(pool.get(&a).unwrap().status, AccountStatus::Idle);
        let _ = pool.delete(&a);
    }

    #[test]
    fn active_below_threshold_emits_candidate_and_switches() {
        let (pool, _) = test_pool();
        let a = seed(&pool, "thr-a@example.com");
        let b = seed(&pool, "thr-b@example.com");
        pool.switch_to(&a).unwrap();
        pool.apply_quota(&b, quota_with(90.0));

        let mut rx = pool.subscribe();
        pool.apply_quota(&a, quota_with(12.0));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::AutoSwitchCandidate { id } if *id == a
        )));
        assert_eq!(pool.get_active().unwrap().id, b);
        let _ = (pool.delete(&a), pool.delete(&b));
    }

    #[test]
    fn errored_accounts_are_never_selected() {
        let (pool, _) = test_pool();
        let a = seed(&pool, "err-a@example.com");
        let b = seed(&pool, "err-b@example.com");
        pool.switch_to(&a).unwrap();
        pool.mark_error(&b);
        pool.apply_quota(&b, quota_with(100.0));

        let mut rx = pool.subscribe();
        pool.mark_rate_limited(&a);
        assert_eq!(pool.get_active().unwrap().id, a);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, PoolEvent::NoCapacity)));
        let _ = (pool.delete(&a), pool.delete(&b));
    }

    #[test]
    fn delete_purges_the_persisted_document() {
        let (pool, _) = test_pool();
        let a = seed(&pool, "purge@example.com");
        assert!(persistence::load_account(&a).is_ok());
        pool.delete(&a).unwrap();
        assert!(persistence::load_account(&a).is_err());
        assert!(pool.get(&a).is_none());
    }

    #[test]
    fn touch_advances_last_used() {
        let (pool, _) = test_pool();
        let a = seed(&pool, "touch@example.com");
        let before = pool.get(&a).unwrap().last_used;
        {
            let mut accounts = pool.accounts.lock().unwrap();
            accounts.iter_mut().find(|x| x.id == a).unwrap().last_used -= 100;
        }
        pool.touch(&a);
        assert!(pool.get(&a).unwrap().last_used >= before);
        let _ = pool.delete(&a);
    }
}
