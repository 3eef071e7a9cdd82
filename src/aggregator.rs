//! # Aggregator
//!
//! Owns all per-metric live state: latest value, rolling 24-hour history,
//! and derived daily statistics.
//!
//! This module handles:
//! - Accepting validated readings ([`TelemetryStore::accept`] is the only
//!   mutator of metric state)
//! - Evicting history entries older than the rolling window
//! - Bounding history length with a hard cap, independent of time, so a
//!   misbehaving device flooding the bus cannot grow memory
//! - Maintaining daily min/max/sum/count for the 24h statistics
//! - Buffering accepted readings for the long-term log, with a bounded
//!   buffer that drops the oldest unflushed entries on overflow
//!
//! Readings are processed strictly in delivery order. The bus may
//! redeliver or reorder; a duplicate or out-of-order message is treated as
//! a new, later observation regardless of its timestamp ("most recent
//! message wins"), which is what a live dashboard wants.
//!
//! The store is shared between the ingestion path and the persistence
//! timer behind one mutex. Critical sections only touch memory; all disk
//! I/O happens after the lock is released.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

use crate::reading::Reading;

/// The rolling statistics window: trailing 24 hours.
#[must_use]
pub fn rolling_window() -> Duration {
    Duration::hours(24)
}

/// Live state for one logical metric.
///
/// Created lazily on the first accepted reading. Never deleted, only
/// emptied, so staleness stays reportable for a metric that has gone
/// silent.
#[derive(Debug, Clone, Default)]
pub struct MetricState {
    latest: Option<Reading>,
    history: VecDeque<Reading>,
    daily_min: Option<f64>,
    daily_max: Option<f64>,
    daily_sum: f64,
    daily_count: u64,
}

impl MetricState {
    fn new() -> Self {
        Self::default()
    }

    /// Most recently accepted reading, by arrival order.
    #[must_use]
    pub fn latest(&self) -> Option<&Reading> {
        self.latest.as_ref()
    }

    /// Retained history, oldest arrival first.
    #[must_use]
    pub fn history(&self) -> &VecDeque<Reading> {
        &self.history
    }

    /// Minimum over the retained window.
    #[must_use]
    pub fn daily_min(&self) -> Option<f64> {
        self.daily_min
    }

    /// Maximum over the retained window.
    #[must_use]
    pub fn daily_max(&self) -> Option<f64> {
        self.daily_max
    }

    /// Number of readings in the retained window.
    #[must_use]
    pub fn daily_count(&self) -> u64 {
        self.daily_count
    }

    /// Mean over the retained window, maintained incrementally.
    #[must_use]
    pub fn daily_avg(&self) -> Option<f64> {
        if self.daily_count == 0 {
            None
        } else {
            Some(self.daily_sum / self.daily_count as f64)
        }
    }

    fn accept(&mut self, reading: Reading, hard_cap: usize) {
        let now = reading.observed_at;
        self.daily_sum += reading.value;
        self.daily_count += 1;
        self.latest = Some(reading.clone());
        self.history.push_back(reading);
        self.refresh(now, hard_cap);
    }

    /// Evicts expired and over-cap entries, then recomputes extremes.
    ///
    /// The sum and count are adjusted entry by entry as the window slides,
    /// so the running average never needs a full rescan; min and max are
    /// recomputed over the retained window, which is small at this reading
    /// rate.
    fn refresh(&mut self, now: DateTime<Utc>, hard_cap: usize) {
        let cutoff = now - rolling_window();
        while let Some(front) = self.history.front() {
            if front.observed_at >= cutoff {
                break;
            }
            self.evict_front();
        }
        while self.history.len() > hard_cap {
            self.evict_front();
        }
        self.recompute_extremes();
    }

    fn evict_front(&mut self) {
        if let Some(evicted) = self.history.pop_front() {
            self.daily_sum -= evicted.value;
            self.daily_count -= 1;
        }
        if self.daily_count == 0 {
            self.daily_sum = 0.0;
        }
    }

    fn recompute_extremes(&mut self) {
        self.daily_min = self
            .history
            .iter()
            .map(|r| r.value)
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.min(v))));
        self.daily_max = self
            .history
            .iter()
            .map(|r| r.value)
            .fold(None, |acc, v| Some(acc.map_or(v, |m: f64| m.max(v))));
    }
}

/// Running totals for operator diagnosis, logged on each persistence tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestCounters {
    /// Readings accepted into metric state
    pub accepted: u64,
    /// Readings rejected by the validator
    pub rejected: u64,
    /// Messages dropped at parse time (bad topic or payload)
    pub malformed: u64,
    /// Long-term log entries dropped to buffer overflow
    pub log_dropped: u64,
}

/// All mutable daemon state, shared between ingestion and persistence.
#[derive(Debug)]
pub struct TelemetryStore {
    metrics: HashMap<String, MetricState>,
    pending_log: VecDeque<Reading>,
    history_hard_cap: usize,
    log_buffer_cap: usize,
    counters: IngestCounters,
}

/// Handle passed to the bus callback and the persistence timer.
pub type SharedStore = Arc<Mutex<TelemetryStore>>;

/// Locks the store, recovering from a poisoned mutex.
///
/// A poisoned lock means a panic unwound mid-mutation on the other path;
/// the daemon's contract is logged-and-continue, so the state is reused
/// as-is rather than taking the whole process down.
pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, TelemetryStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TelemetryStore {
    /// Creates an empty store.
    ///
    /// # Arguments
    ///
    /// * `history_hard_cap` - Per-metric history length bound
    /// * `log_buffer_cap` - Bound on buffered long-term log entries
    #[must_use]
    pub fn new(history_hard_cap: usize, log_buffer_cap: usize) -> Self {
        Self {
            metrics: HashMap::new(),
            pending_log: VecDeque::new(),
            history_hard_cap,
            log_buffer_cap,
            counters: IngestCounters::default(),
        }
    }

    /// Accepts a validated reading. The only mutator of metric state.
    pub fn accept(&mut self, reading: Reading) {
        if self.pending_log.len() >= self.log_buffer_cap {
            self.pending_log.pop_front();
            self.counters.log_dropped += 1;
            warn!(
                cap = self.log_buffer_cap,
                "long-term log buffer full; dropped oldest unflushed entry"
            );
        }
        self.pending_log.push_back(reading.clone());

        let state = self
            .metrics
            .entry(reading.metric_key.clone())
            .or_insert_with(MetricState::new);
        state.accept(reading, self.history_hard_cap);
        self.counters.accepted += 1;
    }

    /// State for one metric, if it has ever been seen.
    #[must_use]
    pub fn metric(&self, metric_key: &str) -> Option<&MetricState> {
        self.metrics.get(metric_key)
    }

    /// Last accepted reading for a metric, used for the spike check.
    #[must_use]
    pub fn last_accepted(&self, metric_key: &str) -> Option<&Reading> {
        self.metrics.get(metric_key).and_then(MetricState::latest)
    }

    /// Iterates all known metrics.
    pub fn iter_metrics(&self) -> impl Iterator<Item = (&String, &MetricState)> {
        self.metrics.iter()
    }

    /// Number of metrics ever seen.
    #[must_use]
    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    /// Slides every metric's window forward to `now`.
    ///
    /// Called by the persistence tick so statistics stay current for
    /// metrics that have gone silent.
    pub fn refresh_windows(&mut self, now: DateTime<Utc>) {
        for state in self.metrics.values_mut() {
            state.refresh(now, self.history_hard_cap);
        }
    }

    /// Takes all buffered long-term log entries for flushing.
    #[must_use]
    pub fn take_pending_log(&mut self) -> Vec<Reading> {
        self.pending_log.drain(..).collect()
    }

    /// Returns unflushed entries to the front of the buffer after a
    /// failed append, preserving order and re-applying the cap.
    pub fn requeue_pending_log(&mut self, entries: Vec<Reading>) {
        for entry in entries.into_iter().rev() {
            self.pending_log.push_front(entry);
        }
        while self.pending_log.len() > self.log_buffer_cap {
            self.pending_log.pop_front();
            self.counters.log_dropped += 1;
        }
    }

    /// Number of buffered long-term log entries.
    #[must_use]
    pub fn pending_log_len(&self) -> usize {
        self.pending_log.len()
    }

    /// Rebuilds one metric from a recovered history buffer.
    ///
    /// Used by the recovery loader before the bus subscription starts;
    /// entries beyond the window or cap are evicted immediately.
    pub fn restore_metric(
        &mut self,
        metric_key: String,
        readings: Vec<Reading>,
        now: DateTime<Utc>,
    ) {
        let mut state = MetricState::new();
        for reading in readings {
            state.daily_sum += reading.value;
            state.daily_count += 1;
            state.latest = Some(reading.clone());
            state.history.push_back(reading);
        }
        state.refresh(now, self.history_hard_cap);
        self.metrics.insert(metric_key, state);
    }

    /// Records a validator rejection.
    pub fn record_rejected(&mut self) {
        self.counters.rejected += 1;
    }

    /// Records a message dropped at parse time.
    pub fn record_malformed(&mut self) {
        self.counters.malformed += 1;
    }

    /// Running ingest totals.
    #[must_use]
    pub fn counters(&self) -> IngestCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const CAP: usize = 4096;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn temp(value: f64, at: DateTime<Utc>) -> Reading {
        Reading::new("greenhouse-pi", "interior_temp", value, at)
    }

    fn store() -> TelemetryStore {
        TelemetryStore::new(CAP, 10_000)
    }

    #[test]
    fn test_metric_state_created_lazily() {
        let mut store = store();
        assert_eq!(store.metric_count(), 0);

        store.accept(temp(68.0, t0()));
        assert_eq!(store.metric_count(), 1);

        let state = store.metric("interior_temp").unwrap();
        assert_eq!(state.latest().unwrap().value, 68.0);
        assert_eq!(state.daily_count(), 1);
    }

    #[test]
    fn test_latest_follows_delivery_order() {
        let mut store = store();
        store.accept(temp(68.0, t0()));
        store.accept(temp(71.0, t0() + Duration::minutes(2)));

        let state = store.metric("interior_temp").unwrap();
        assert_eq!(state.latest().unwrap().value, 71.0);
        assert!(state.daily_max().unwrap() >= 71.0);
    }

    #[test]
    fn test_out_of_order_delivery_wins_anyway() {
        // The bus may reorder; the later delivery wins even with an
        // earlier timestamp.
        let mut store = store();
        store.accept(temp(71.0, t0() + Duration::minutes(2)));
        store.accept(temp(68.0, t0()));

        let state = store.metric("interior_temp").unwrap();
        assert_eq!(state.latest().unwrap().value, 68.0);
        assert_eq!(state.daily_count(), 2);
    }

    #[test]
    fn test_duplicate_delivery_is_harmless() {
        let mut store = store();
        let reading = temp(68.0, t0());
        store.accept(reading.clone());
        store.accept(reading);

        let state = store.metric("interior_temp").unwrap();
        assert_eq!(state.latest().unwrap().value, 68.0);
        assert_eq!(state.daily_min(), Some(68.0));
        assert_eq!(state.daily_max(), Some(68.0));
        assert_eq!(state.daily_avg(), Some(68.0));
    }

    #[test]
    fn test_entries_older_than_window_are_evicted() {
        let mut store = store();
        store.accept(temp(50.0, t0()));
        store.accept(temp(60.0, t0() + Duration::hours(12)));
        // This accept slides the window past the first reading
        store.accept(temp(70.0, t0() + Duration::hours(25)));

        let state = store.metric("interior_temp").unwrap();
        assert_eq!(state.history().len(), 2);
        assert_eq!(state.daily_min(), Some(60.0));
        assert_eq!(state.daily_count(), 2);
        assert_eq!(state.daily_avg(), Some(65.0));
    }

    #[test]
    fn test_entry_exactly_at_window_edge_is_retained() {
        let mut store = store();
        store.accept(temp(50.0, t0()));
        store.accept(temp(70.0, t0() + Duration::hours(24)));

        let state = store.metric("interior_temp").unwrap();
        assert_eq!(state.history().len(), 2);
        assert_eq!(state.daily_min(), Some(50.0));
    }

    #[test]
    fn test_hard_cap_bounds_history_under_flood() {
        let mut store = TelemetryStore::new(100, 10_000);
        // A misbehaving device floods well past the cap within the window
        for i in 0..1000 {
            store.accept(temp(60.0 + (i % 10) as f64, t0() + Duration::seconds(i)));
        }

        let state = store.metric("interior_temp").unwrap();
        assert_eq!(state.history().len(), 100);
        assert_eq!(state.daily_count(), 100);
    }

    #[test]
    fn test_incremental_average_matches_recomputation() {
        // Deterministic pseudo-random accept/evict cycles, then compare
        // the running sum against a from-scratch rescan.
        let mut store = TelemetryStore::new(50, 10_000);
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for i in 0..500i64 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let value = 40.0 + (seed >> 33) as f64 % 60.0;
            let step = Duration::minutes(7 * i + (seed % 90) as i64);
            store.accept(temp(value, t0() + step));
        }

        let state = store.metric("interior_temp").unwrap();
        let values: Vec<f64> = state.history().iter().map(|r| r.value).collect();
        assert!(!values.is_empty());

        let scratch_avg = values.iter().sum::<f64>() / values.len() as f64;
        let scratch_min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let scratch_max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        assert!((state.daily_avg().unwrap() - scratch_avg).abs() < 1e-9);
        assert_eq!(state.daily_min(), Some(scratch_min));
        assert_eq!(state.daily_max(), Some(scratch_max));
        assert_eq!(state.daily_count() as usize, values.len());
    }

    #[test]
    fn test_metric_is_emptied_but_never_deleted() {
        let mut store = store();
        store.accept(temp(68.0, t0()));
        store.refresh_windows(t0() + Duration::hours(48));

        let state = store.metric("interior_temp").unwrap();
        assert!(state.history().is_empty());
        assert_eq!(state.daily_count(), 0);
        assert_eq!(state.daily_min(), None);
        assert_eq!(state.daily_avg(), None);
        // Latest survives eviction so staleness stays reportable
        assert_eq!(state.latest().unwrap().value, 68.0);
    }

    #[test]
    fn test_pending_log_overflow_drops_oldest_and_warns_in_counter() {
        let mut store = TelemetryStore::new(CAP, 3);
        for i in 0..5 {
            store.accept(temp(60.0 + i as f64, t0() + Duration::seconds(i)));
        }

        assert_eq!(store.pending_log_len(), 3);
        assert_eq!(store.counters().log_dropped, 2);

        let drained = store.take_pending_log();
        let values: Vec<f64> = drained.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![62.0, 63.0, 64.0]);
    }

    #[test]
    fn test_requeue_after_failed_flush_preserves_order() {
        let mut store = store();
        store.accept(temp(60.0, t0()));
        store.accept(temp(61.0, t0() + Duration::seconds(1)));
        let drained = store.take_pending_log();
        assert_eq!(store.pending_log_len(), 0);

        store.accept(temp(62.0, t0() + Duration::seconds(2)));
        store.requeue_pending_log(drained);

        let values: Vec<f64> = store
            .take_pending_log()
            .iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(values, vec![60.0, 61.0, 62.0]);
    }

    #[test]
    fn test_restore_metric_rebuilds_statistics() {
        let mut store = store();
        let readings = vec![
            temp(50.0, t0()),
            temp(70.0, t0() + Duration::hours(1)),
            temp(60.0, t0() + Duration::hours(2)),
        ];
        store.restore_metric("interior_temp".to_string(), readings, t0() + Duration::hours(2));

        let state = store.metric("interior_temp").unwrap();
        assert_eq!(state.latest().unwrap().value, 60.0);
        assert_eq!(state.daily_min(), Some(50.0));
        assert_eq!(state.daily_max(), Some(70.0));
        assert_eq!(state.daily_avg(), Some(60.0));
    }

    #[test]
    fn test_restore_metric_evicts_expired_entries() {
        let mut store = store();
        let readings = vec![temp(50.0, t0()), temp(70.0, t0() + Duration::hours(30))];
        store.restore_metric(
            "interior_temp".to_string(),
            readings,
            t0() + Duration::hours(30),
        );

        let state = store.metric("interior_temp").unwrap();
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.daily_min(), Some(70.0));
    }

    #[test]
    fn test_counters_track_rejections_and_malformed() {
        let mut store = store();
        store.accept(temp(68.0, t0()));
        store.record_rejected();
        store.record_rejected();
        store.record_malformed();

        let counters = store.counters();
        assert_eq!(counters.accepted, 1);
        assert_eq!(counters.rejected, 2);
        assert_eq!(counters.malformed, 1);
    }

    #[test]
    fn test_lock_store_round_trip() {
        let shared: SharedStore = Arc::new(Mutex::new(store()));
        lock_store(&shared).accept(temp(68.0, t0()));
        assert_eq!(lock_store(&shared).metric_count(), 1);
    }
}
