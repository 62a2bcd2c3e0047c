use chrono::DateTime;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Duration;

use crate::constants;
use crate::error::ProxyError;
use crate::models::{AccountStatus, QuotaData};
use crate::proxy::pool::AccountPool;
use crate::proxy::upstream::{unwrap_response_envelope, UpstreamDispatcher};

#[derive(Debug, Clone, Default)]
pub struct PollStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
struct QuotaResponse {
    #[serde(default)]
    models: HashMap<String, ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    #[serde(rename = "quotaInfo")]
    quota_info: Option<QuotaInfo>,
}

#[derive(Debug, Deserialize)]
struct QuotaInfo {
    #[serde(rename = "remainingFraction")]
    remaining_fraction: Option<f64>,
    #[serde(rename = "resetTime")]
    reset_time: Option<String>,
}

/// Background quota refresh: one loop per process, one authenticated
/// metadata call per non-quarantined account per tick. Ticks are jittered
/// ±10% so a fleet of installs does not stampede the metadata endpoint.
pub struct QuotaPoller {
    pool: Arc<AccountPool>,
    upstream: Arc<UpstreamDispatcher>,
    client: reqwest::Client,
    tick_lock: tokio::sync::Mutex<()>,
    last_stats: std::sync::Mutex<PollStats>,
    interval: Duration,
}

impl QuotaPoller {
    pub fn new(pool: Arc<AccountPool>, upstream: Arc<UpstreamDispatcher>) -> Arc<Self> {
        Self::with_interval(
            pool,
            upstream,
            Duration::from_secs(constants::QUOTA_POLL_INTERVAL_SECS),
        )
    }

    pub fn with_interval(
        pool: Arc<AccountPool>,
        upstream: Arc<UpstreamDispatcher>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            upstream,
            client: reqwest::Client::new(),
            tick_lock: tokio::sync::Mutex::new(()),
            last_stats: std::sync::Mutex::new(PollStats::default()),
            interval,
        })
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                "[Poller] Quota refresh loop started ({}s base interval)",
                poller.interval.as_secs()
            );
            loop {
                let factor = rand::thread_rng().gen_range(0.9..1.1);
                tokio::time::sleep(poller.interval.mul_f64(factor)).await;

                // A stuck tick is cancelled at twice the interval and
                // reported; in-flight client requests are unaffected.
                match tokio::time::timeout(poller.interval * 2, poller.force_poll()).await {
                    Ok(stats) => {
                        if stats.total > 0 {
                            tracing::info!(
                                "[Poller] Quota refresh completed: total={}, success={}, failed={}",
                                stats.total,
                                stats.success,
                                stats.failed
                            );
                        }
                    }
                    Err(_) => {
                        tracing::warn!("[Poller] Poll tick exceeded watchdog, cancelled");
                    }
                }
            }
        })
    }

    /// Runs a tick now, coalescing with any tick already in flight: the
    /// waiter gets the in-flight tick's result instead of starting another.
    pub async fn force_poll(&self) -> PollStats {
        match self.tick_lock.try_lock() {
            Ok(_guard) => {
                let stats = self.run_tick().await;
                *self.last_stats.lock().expect("stats lock") = stats.clone();
                stats
            }
            Err(_) => {
                let _guard = self.tick_lock.lock().await;
                self.last_stats.lock().expect("stats lock").clone()
            }
        }
    }

    async fn run_tick(&self) -> PollStats {
        let mut stats = PollStats::default();
        for view in self.pool.list() {
            if view.status == AccountStatus::Error {
                continue;
            }
            stats.total += 1;
            match tokio::time::timeout(self.interval, self.poll_account(&view.id)).await {
                Ok(Ok(())) => stats.success += 1,
                Ok(Err(e)) => {
                    stats.failed += 1;
                    tracing::warn!("[Poller] Quota poll failed for {}: {}", view.email, e);
                }
                Err(_) => {
                    stats.failed += 1;
                    tracing::warn!("[Poller] Quota poll timed out for {}", view.email);
                }
            }
        }
        stats
    }

    /// Polls one account and applies the snapshot. Auth rejections from
    /// the metadata surface quarantine the account.
    pub async fn poll_account(&self, id: &str) -> Result<(), ProxyError> {
        let account = self
            .pool
            .get(id)
            .ok_or_else(|| ProxyError::InvalidRequest(format!("no such account: {}", id)))?;
        let token = self.pool.bearer_token_for(&self.client, id).await?;
        let project = account
            .project_id
            .clone()
            .unwrap_or_else(|| constants::DEFAULT_PROJECT_ID.to_string());

        let response = self
            .upstream
            .call(
                "fetchAvailableModels",
                &token,
                &json!({"project": project}),
                None,
                &HashMap::new(),
            )
            .await;
        let response = match response {
            Ok(r) => r,
            Err(ProxyError::AuthRejected(detail)) => {
                self.pool.mark_error(id);
                return Err(ProxyError::AuthRejected(detail));
            }
            Err(e) => return Err(e),
        };

        let decoded: serde_json::Value = response.json().await?;
        let parsed: QuotaResponse = serde_json::from_value(unwrap_response_envelope(decoded))
            .map_err(|e| ProxyError::Internal(format!("quota payload unparseable: {}", e)))?;

        self.pool.apply_quota(id, build_snapshot(parsed));
        Ok(())
    }
}

fn build_snapshot(parsed: QuotaResponse) -> QuotaData {
    let mut quota = QuotaData::new();
    for (name, entry) in parsed.models {
        let Some(info) = entry.quota_info else {
            continue;
        };
        if !name.contains("gemini") && !name.contains("claude") {
            continue;
        }
        let percentage = info.remaining_fraction.map(|f| f * 100.0).unwrap_or(0.0);
        let reset_time = info
            .reset_time
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        quota.add_model(name, percentage, reset_time);
    }
    quota
}
