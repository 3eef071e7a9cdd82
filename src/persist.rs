//! # Persistence Layer
//!
//! Durably writes the daemon's output files on a timer tick, off the
//! message-delivery path.
//!
//! This module handles:
//! - The live snapshot (`status.json`) read by the web API and the email
//!   builder
//! - The trailing 24h statistics (`stats_24h.json`)
//! - The monthly append-only sensor log (`sensor_log/YYYY-MM.jsonl`)
//! - The recovery cache (`history_cache.json`), on a slower cadence
//!
//! The snapshot files are written with atomic-replace semantics: content
//! goes to a sibling `.tmp` file, is forced to stable storage, and is then
//! renamed over the target. A reader polling these files never observes a
//! torn write, and a crash mid-write leaves the previous valid file in
//! place. The monthly log is append-only and uses append + forced flush
//! instead.
//!
//! Write failures are logged and retried on the next tick; in-memory state
//! remains authoritative until the disk recovers. Nothing here is fatal
//! after startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::aggregator::{lock_store, SharedStore};
use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::reading::Reading;
use crate::staleness::StalenessPolicy;

/// One metric's entry in the live snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    pub stale: bool,
}

/// The live snapshot file: a flat object of metric entries plus the write
/// timestamp. Owned by this layer; read-only to everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub sensors: BTreeMap<String, SnapshotEntry>,
}

/// One metric's trailing-24h statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: u64,
}

/// The 24h statistics file: metric key to stats.
pub type StatsSnapshot = BTreeMap<String, MetricStats>;

/// Serialized history buffers, internal to daemon restarts.
///
/// Not a public contract; the schema only has to agree with the recovery
/// loader in the same build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryCache {
    pub metrics: BTreeMap<String, Vec<Reading>>,
}

/// Writes JSON to `path` with atomic-replace semantics.
///
/// Content is written to a sibling `.tmp` file in the same directory,
/// flushed and synced to stable storage, then renamed over the target, so
/// a reader sees either the old file or the new one and never a partial
/// write.
///
/// # Errors
///
/// Returns error on any I/O or serialization failure; the `.tmp` file may
/// remain but the target is untouched.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Everything one pass writes, cloned out of the store under the lock.
struct PassData {
    live: LiveSnapshot,
    stats: StatsSnapshot,
    log_entries: Vec<Reading>,
    cache: Option<RecoveryCache>,
}

/// Timer-driven writer for all output files.
pub struct Persistence {
    status_path: PathBuf,
    stats_path: PathBuf,
    cache_path: PathBuf,
    log_dir: PathBuf,
    recovery_cache_ticks: u32,
    ticks: u32,
}

impl Persistence {
    /// Creates the layer from configuration.
    #[must_use]
    pub fn new(cfg: &PersistenceConfig) -> Self {
        Self {
            status_path: PathBuf::from(&cfg.status_path),
            stats_path: PathBuf::from(&cfg.stats_path),
            cache_path: PathBuf::from(&cfg.history_cache_path),
            log_dir: PathBuf::from(&cfg.sensor_log_dir),
            recovery_cache_ticks: cfg.recovery_cache_ticks,
            ticks: 0,
        }
    }

    /// Path of the recovery cache, for the startup loader.
    #[must_use]
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Creates all output directories.
    ///
    /// Called once at startup and treated as fatal on failure: running
    /// without a writable data directory would silently serve stale data
    /// to every consumer.
    ///
    /// # Errors
    ///
    /// Returns error when a directory cannot be created.
    pub fn ensure_directories(&self) -> Result<()> {
        for file_path in [&self.status_path, &self.stats_path, &self.cache_path] {
            if let Some(parent) = file_path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }
        fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }

    /// One timer tick: snapshot state and write the output files.
    ///
    /// The recovery cache is included every Nth tick. Failures are logged
    /// and retried on the next tick, never propagated.
    pub fn tick(&mut self, store: &SharedStore, policy: &StalenessPolicy, now: DateTime<Utc>) {
        self.ticks = self.ticks.wrapping_add(1);
        let include_cache = self.ticks % self.recovery_cache_ticks == 0;
        self.run_pass(store, policy, now, include_cache);
    }

    /// Final pass on graceful shutdown; always writes the recovery cache.
    pub fn shutdown_flush(
        &mut self,
        store: &SharedStore,
        policy: &StalenessPolicy,
        now: DateTime<Utc>,
    ) {
        self.run_pass(store, policy, now, true);
    }

    fn run_pass(
        &self,
        store: &SharedStore,
        policy: &StalenessPolicy,
        now: DateTime<Utc>,
        include_cache: bool,
    ) {
        let data = Self::collect(store, policy, now, include_cache);

        match atomic_write_json(&self.status_path, &data.live) {
            Ok(()) => debug!(
                metrics = data.live.sensors.len(),
                path = %self.status_path.display(),
                "wrote live snapshot"
            ),
            Err(e) => warn!(
                path = %self.status_path.display(),
                "failed to write live snapshot, retrying next tick: {e}"
            ),
        }

        match atomic_write_json(&self.stats_path, &data.stats) {
            Ok(()) => debug!(
                metrics = data.stats.len(),
                path = %self.stats_path.display(),
                "wrote 24h stats"
            ),
            Err(e) => warn!(
                path = %self.stats_path.display(),
                "failed to write 24h stats, retrying next tick: {e}"
            ),
        }

        if !data.log_entries.is_empty() {
            let count = data.log_entries.len();
            if let Err(e) = self.append_log(&data.log_entries) {
                warn!(
                    entries = count,
                    "failed to append sensor log, re-queuing for next tick: {e}"
                );
                lock_store(store).requeue_pending_log(data.log_entries);
            } else {
                debug!(entries = count, "appended sensor log");
            }
        }

        if let Some(cache) = &data.cache {
            match atomic_write_json(&self.cache_path, cache) {
                Ok(()) => debug!(metrics = cache.metrics.len(), "wrote recovery cache"),
                Err(e) => warn!("failed to write recovery cache, retrying later: {e}"),
            }
        }

        let counters = lock_store(store).counters();
        info!(
            accepted = counters.accepted,
            rejected = counters.rejected,
            malformed = counters.malformed,
            "persistence pass complete"
        );
    }

    /// Clones everything a pass needs while holding the lock, so disk
    /// latency never blocks ingestion.
    fn collect(
        store: &SharedStore,
        policy: &StalenessPolicy,
        now: DateTime<Utc>,
        include_cache: bool,
    ) -> PassData {
        let mut guard = lock_store(store);
        guard.refresh_windows(now);

        let mut sensors = BTreeMap::new();
        let mut stats = StatsSnapshot::new();
        let mut cache = include_cache.then(RecoveryCache::default);

        for (metric_key, state) in guard.iter_metrics() {
            if let Some(latest) = state.latest() {
                sensors.insert(
                    metric_key.clone(),
                    SnapshotEntry {
                        value: latest.value,
                        observed_at: latest.observed_at,
                        stale: policy.is_stale(metric_key, Some(latest.observed_at), now),
                    },
                );
            }

            if let (Some(min), Some(max), Some(avg)) =
                (state.daily_min(), state.daily_max(), state.daily_avg())
            {
                stats.insert(
                    metric_key.clone(),
                    MetricStats {
                        min,
                        max,
                        avg,
                        count: state.daily_count(),
                    },
                );
            }

            if let Some(cache) = cache.as_mut() {
                cache
                    .metrics
                    .insert(metric_key.clone(), state.history().iter().cloned().collect());
            }
        }

        let log_entries = guard.take_pending_log();

        PassData {
            live: LiveSnapshot {
                updated_at: now,
                sensors,
            },
            stats,
            log_entries,
            cache,
        }
    }

    /// Appends entries to the month-partitioned log files.
    ///
    /// Entries are grouped by the calendar month of their own timestamp,
    /// so a buffer flushed just after midnight on the 1st still lands in
    /// the right file.
    fn append_log(&self, entries: &[Reading]) -> Result<()> {
        let mut by_month: BTreeMap<String, String> = BTreeMap::new();
        for entry in entries {
            let month = entry.observed_at.format("%Y-%m").to_string();
            let line = serde_json::to_string(entry)?;
            let buf = by_month.entry(month).or_default();
            buf.push_str(&line);
            buf.push('\n');
        }

        for (month, buf) in by_month {
            let path = self.log_dir.join(format!("{month}.jsonl"));
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(buf.as_bytes())?;
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }
}
