//! # Staleness Tracker
//!
//! Derives, per metric, whether the latest accepted reading is too old to
//! trust. Staleness is computed on demand from `latest.observed_at` and is
//! never stored as its own flag, so it cannot drift from the data.
//!
//! Thresholds differ by metric: the solar satellite's battery reports
//! every 15 minutes on a good day, while the wired interior sensors report
//! every 30 seconds, so each gets its own budget with a global default.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::config::StalenessConfig;

/// Returns true when the reading is older than the threshold.
///
/// A metric with no reading at all is always stale. A reading whose age
/// equals the threshold exactly is still fresh; staleness requires the age
/// to be strictly greater.
#[must_use]
pub fn is_stale(
    observed_at: Option<DateTime<Utc>>,
    threshold: Duration,
    now: DateTime<Utc>,
) -> bool {
    match observed_at {
        None => true,
        Some(ts) => now - ts > threshold,
    }
}

/// Per-metric staleness thresholds with a global default.
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
    default_threshold: Duration,
    per_metric: HashMap<String, Duration>,
}

impl StalenessPolicy {
    /// Builds the policy from configuration (thresholds in minutes).
    #[must_use]
    pub fn from_config(cfg: &StalenessConfig) -> Self {
        Self {
            default_threshold: Duration::minutes(cfg.default_minutes as i64),
            per_metric: cfg
                .per_metric
                .iter()
                .map(|(key, minutes)| (key.clone(), Duration::minutes(*minutes as i64)))
                .collect(),
        }
    }

    /// Threshold for one metric.
    #[must_use]
    pub fn threshold_for(&self, metric_key: &str) -> Duration {
        self.per_metric
            .get(metric_key)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    /// Staleness verdict for one metric.
    #[must_use]
    pub fn is_stale(
        &self,
        metric_key: &str,
        observed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        is_stale(observed_at, self.threshold_for(metric_key), now)
    }
}
