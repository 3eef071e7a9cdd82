//! # Recovery Loader
//!
//! Rebuilds in-memory rolling history from the recovery cache, once, at
//! process start, before the bus subscription begins. Without it a restart
//! would open a 24-hour hole in the statistics.
//!
//! A missing cache is normal (first boot, or the operator wiped the data
//! directory). A malformed cache is logged and discarded; the atomic-replace
//! write discipline makes a truncated file from a crash impossible, so a
//! parse failure means a genuinely corrupt file, which is safe to start
//! empty from.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::aggregator::TelemetryStore;
use crate::persist::RecoveryCache;

/// Restores metric history from the cache file into the store.
///
/// Returns the number of metrics restored. Never fails: a missing or
/// corrupt cache leaves the store empty.
pub fn load(cache_path: &Path, store: &mut TelemetryStore, now: DateTime<Utc>) -> usize {
    let contents = match fs::read_to_string(cache_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(
                path = %cache_path.display(),
                "no recovery cache found, starting with empty history"
            );
            return 0;
        }
        Err(e) => {
            warn!(
                path = %cache_path.display(),
                "failed to read recovery cache, starting with empty history: {e}"
            );
            return 0;
        }
    };

    let cache: RecoveryCache = match serde_json::from_str(&contents) {
        Ok(cache) => cache,
        Err(e) => {
            warn!(
                path = %cache_path.display(),
                "recovery cache is malformed, starting with empty history: {e}"
            );
            return 0;
        }
    };

    let mut restored = 0;
    for (metric_key, readings) in cache.metrics {
        let entries = readings.len();
        store.restore_metric(metric_key.clone(), readings, now);
        info!(metric = %metric_key, entries, "restored metric history");
        restored += 1;
    }
    restored
}
