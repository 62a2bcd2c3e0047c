use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Last polled usage for a single model. `percentage` is the remaining
/// quota in `[0, 100]`; zero means the model is hard rate-limited. A
/// missing reset time means the upstream did not report one; never assume
/// "now".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelQuota {
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
}

impl ModelQuota {
    pub fn is_exhausted(&self) -> bool {
        self.percentage <= 0.0
    }
}

/// One account's usage snapshot across all models it can reach. Snapshots
/// are replaced whole by the poller; readers never see a half-applied diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaData {
    pub models: BTreeMap<String, ModelQuota>,
    #[serde(default)]
    pub fetched_at: i64,
}

impl QuotaData {
    pub fn new() -> Self {
        Self {
            models: BTreeMap::new(),
            fetched_at: Utc::now().timestamp(),
        }
    }

    pub fn add_model(
        &mut self,
        name: impl Into<String>,
        percentage: f64,
        reset_time: Option<DateTime<Utc>>,
    ) {
        self.models.insert(
            name.into(),
            ModelQuota {
                percentage: percentage.clamp(0.0, 100.0),
                reset_time,
            },
        );
    }

    pub fn is_visible(visibility: &HashMap<String, bool>, model: &str) -> bool {
        visibility.get(model).copied().unwrap_or(true)
    }

    /// Mean remaining percentage over visible models, one decimal. An empty
    /// visible set yields 0.
    pub fn overall_percentage(&self, visibility: &HashMap<String, bool>) -> f64 {
        let visible: Vec<f64> = self
            .models
            .iter()
            .filter(|(name, _)| Self::is_visible(visibility, name))
            .map(|(_, q)| q.percentage)
            .collect();
        if visible.is_empty() {
            return 0.0;
        }
        round_one_decimal(visible.iter().sum::<f64>() / visible.len() as f64)
    }

    /// True once every visible model either reports zero or has passed its
    /// reset boundary; the poller uses this to lift a rate-limited status.
    pub fn all_exhausted(&self, visibility: &HashMap<String, bool>) -> bool {
        let mut saw_any = false;
        for (name, q) in &self.models {
            if !Self::is_visible(visibility, name) {
                continue;
            }
            saw_any = true;
            if !q.is_exhausted() {
                return false;
            }
        }
        saw_any
    }

    pub fn earliest_reset(&self) -> Option<DateTime<Utc>> {
        self.models.values().filter_map(|q| q.reset_time).min()
    }
}

/// Pool-wide remaining percentage: the flat mean over every visible model
/// of every account, not a mean of per-account means.
pub fn global_quota<'a>(
    snapshots: impl IntoIterator<Item = &'a QuotaData>,
    visibility: &HashMap<String, bool>,
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for snapshot in snapshots {
        for (name, q) in &snapshot.models {
            if QuotaData::is_visible(visibility, name) {
                sum += q.percentage;
                count += 1;
            }
        }
    }
    if count == 0 {
        return 0.0;
    }
    round_one_decimal(sum / count as f64)
}

pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
