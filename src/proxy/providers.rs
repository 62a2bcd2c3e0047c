use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::models::quota::{round_one_decimal, ModelQuota, QuotaData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub name: &'static str,
    pub company: &'static str,
    pub color: &'static str,
}

pub const OTHERS_KEY: &str = "others";

const OTHERS_INFO: ProviderInfo = ProviderInfo {
    name: "Others",
    company: "",
    color: "#9aa0a6",
};

// Declaration order is display order; first matching prefix wins. New
// providers are added by extending this table.
const PROVIDER_REGISTRY: &[(&str, ProviderInfo)] = &[
    (
        "claude-",
        ProviderInfo {
            name: "Claude",
            company: "Anthropic",
            color: "#d97757",
        },
    ),
    (
        "gemini-",
        ProviderInfo {
            name: "Gemini",
            company: "Google",
            color: "#4285f4",
        },
    ),
];

/// Total over all model names: a registered prefix of the model, or
/// `others`.
pub fn detect_provider(model: &str) -> &'static str {
    for (prefix, _) in PROVIDER_REGISTRY {
        if model.starts_with(prefix) {
            return prefix;
        }
    }
    OTHERS_KEY
}

pub fn provider_info(model: &str) -> &'static ProviderInfo {
    for (prefix, info) in PROVIDER_REGISTRY {
        if model.starts_with(prefix) {
            return info;
        }
    }
    &OTHERS_INFO
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Limited,
    Critical,
}

impl HealthStatus {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 50.0 {
            HealthStatus::Healthy
        } else if percentage >= 25.0 {
            HealthStatus::Degraded
        } else if percentage >= 10.0 {
            HealthStatus::Limited
        } else {
            HealthStatus::Critical
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderGroup {
    pub key: String,
    pub info: ProviderInfo,
    pub models: Vec<(String, ModelQuota)>,
    pub avg_percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest_reset: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountStats {
    pub groups: Vec<ProviderGroup>,
    pub overall_percentage: f64,
    pub health_status: HealthStatus,
}

/// Groups one snapshot's visible models into provider buckets, registry
/// order first and `others` last. Group sorting is stable: models keep
/// their snapshot order inside each group.
pub fn group_models_by_provider(
    quota: &QuotaData,
    visibility: &HashMap<String, bool>,
) -> AccountStats {
    let mut buckets: Vec<(String, Vec<(String, ModelQuota)>)> = PROVIDER_REGISTRY
        .iter()
        .map(|(prefix, _)| ((*prefix).to_string(), Vec::new()))
        .collect();
    let mut others: Vec<(String, ModelQuota)> = Vec::new();

    for (name, model_quota) in &quota.models {
        if !QuotaData::is_visible(visibility, name) {
            continue;
        }
        let key = detect_provider(name);
        let entry = (name.clone(), model_quota.clone());
        if key == OTHERS_KEY {
            others.push(entry);
        } else if let Some((_, bucket)) = buckets.iter_mut().find(|(k, _)| k == key) {
            bucket.push(entry);
        }
    }
    buckets.push((OTHERS_KEY.to_string(), others));

    let mut groups = Vec::new();
    let mut all_percentages = Vec::new();
    for (key, models) in buckets {
        if models.is_empty() {
            continue;
        }
        let sum: f64 = models.iter().map(|(_, q)| q.percentage).sum();
        let avg = round_one_decimal(sum / models.len() as f64);
        let earliest_reset = models.iter().filter_map(|(_, q)| q.reset_time).min();
        all_percentages.extend(models.iter().map(|(_, q)| q.percentage));

        let info = if key == OTHERS_KEY {
            OTHERS_INFO
        } else {
            *provider_info(&key)
        };
        groups.push(ProviderGroup {
            key,
            info,
            models,
            avg_percentage: avg,
            earliest_reset,
        });
    }

    let overall_percentage = if all_percentages.is_empty() {
        0.0
    } else {
        round_one_decimal(all_percentages.iter().sum::<f64>() / all_percentages.len() as f64)
    };

    AccountStats {
        groups,
        overall_percentage,
        health_status: HealthStatus::from_percentage(overall_percentage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(&str, f64)]) -> QuotaData {
        let mut q = QuotaData::new();
        for (name, pct) in entries {
            q.add_model(*name, *pct, None);
        }
        q
    }

    #[test]
    fn detect_provider_is_total_and_prefix_consistent() {
        for model in [
            "claude-sonnet-4-5",
            "gemini-3-flash",
            "gpt-4",
            "",
            "mistral-large",
        ] {
            let key = detect_provider(model);
            if key != OTHERS_KEY {
                assert!(model.starts_with(key));
            }
        }
        assert_eq!(detect_provider("claude-sonnet-4-5"), "claude-");
        assert_eq!(detect_provider("gemini-3-pro-high"), "gemini-");
        assert_eq!(detect_provider("gpt-4"), OTHERS_KEY);
    }

    #[test]
    fn grouping_orders_registry_first_then_others() {
        let q = snapshot(&[
            ("gpt-4", 50.0),
            ("gemini-2.0-flash", 60.0),
            ("claude-3-7-sonnet", 70.0),
        ]);
        let stats = group_models_by_provider(&q, &HashMap::new());

        let keys: Vec<&str> = stats.groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["claude-", "gemini-", "others"]);
        assert_eq!(stats.overall_percentage, 60.0);
        assert_eq!(stats.health_status, HealthStatus::Healthy);
    }

    #[test]
    fn group_averages_round_to_one_decimal() {
        let q = snapshot(&[("claude-a", 33.0), ("claude-b", 33.5)]);
        let stats = group_models_by_provider(&q, &HashMap::new());
        assert_eq!(stats.groups[0].avg_percentage, 33.3);
    }

    #[test]
    fn hidden_models_are_excluded() {
        let q = snapshot(&[("claude-a", 100.0), ("gemini-b", 0.0)]);
        let mut visibility = HashMap::new();
        visibility.insert("gemini-b".to_string(), false);

        let stats = group_models_by_provider(&q, &visibility);
        assert_eq!(stats.groups.len(), 1);
        assert_eq!(stats.overall_percentage, 100.0);
    }

    #[test]
    fn empty_visible_set_is_critical_zero() {
        let stats = group_models_by_provider(&QuotaData::new(), &HashMap::new());
        assert!(stats.groups.is_empty());
        assert_eq!(stats.overall_percentage, 0.0);
        assert_eq!(stats.health_status, HealthStatus::Critical);
    }

    #[test]
    fn health_thresholds() {
        assert_eq!(HealthStatus::from_percentage(50.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_percentage(49.9), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_percentage(25.0), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_percentage(24.9), HealthStatus::Limited);
        assert_eq!(HealthStatus::from_percentage(10.0), HealthStatus::Limited);
        assert_eq!(HealthStatus::from_percentage(9.9), HealthStatus::Critical);
    }

    #[test]
    fn earliest_reset_per_group() {
        let mut q = QuotaData::new();
        let early = Utc::now();
        let late = early + chrono::Duration::hours(2);
        q.add_model("claude-a", 40.0, Some(late));
        q.add_model("claude-b", 40.0, Some(early));
        q.add_model("claude-c", 40.0, None);

        let stats = group_models_by_provider(&q, &HashMap::new());
        assert_eq!(stats.groups[0].earliest_reset, Some(early));
    }
}
