//! # Greenhouse Telemetry Daemon
//!
//! Receives sensor readings from the greenhouse MQTT bus, validates and
//! aggregates them, and persists snapshots for every downstream consumer.
//!
//! The email builder, web API, and chart renderer never talk to this
//! process; they poll the files it writes.

use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use greenhouse_telemetryd::aggregator::{lock_store, SharedStore, TelemetryStore};
use greenhouse_telemetryd::bus::{self, Ingestor};
use greenhouse_telemetryd::config::Config;
use greenhouse_telemetryd::persist::Persistence;
use greenhouse_telemetryd::recovery;
use greenhouse_telemetryd::staleness::StalenessPolicy;
use greenhouse_telemetryd::topic::{RemapTable, TopicParser};
use greenhouse_telemetryd::validator::RuleSet;

/// Configuration path when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Main entry point for the telemetry daemon
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Set up logging with tracing subscriber
///    - Load configuration (first CLI argument, or the default path;
///      built-in defaults when the file does not exist)
///    - Create output directories (fatal on failure)
///    - Restore rolling history from the recovery cache
///
/// 2. **Main Loop**
///    - The MQTT event loop feeds parse -> validate -> aggregate
///    - An independent timer drives the persistence layer
///    - Handle Ctrl+C for graceful shutdown
///
/// 3. **Graceful Shutdown**
///    - Stop accepting bus messages
///    - Run one final persistence pass, including the recovery cache
///    - Log ingest totals and exit cleanly
///
/// # Errors
///
/// Returns error (non-zero exit) only on unrecoverable startup failure:
/// invalid configuration, output directories that cannot be created, or a
/// bus that refuses the very first connection. Transient parse, validation,
/// and write failures during normal operation are logged and survived.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let (stdout, _log_guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(stdout)
        .init();

    info!(
        "greenhouse-telemetryd v{} starting...",
        env!("CARGO_PKG_VERSION")
    );

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = if Path::new(&config_path).exists() {
        let config = Config::load(&config_path)?;
        info!(path = %config_path, "loaded configuration");
        config
    } else {
        warn!(path = %config_path, "configuration file not found, using built-in defaults");
        Config::default()
    };

    // A daemon without a writable data directory would silently serve
    // stale data to every consumer, so this failure is fatal at boot.
    let mut persistence = Persistence::new(&config.persistence);
    persistence.ensure_directories()?;

    let mut store = TelemetryStore::new(
        config.persistence.history_hard_cap,
        config.persistence.log_buffer_cap,
    );
    let restored = recovery::load(persistence.cache_path(), &mut store, Utc::now());
    info!(metrics = restored, "recovery complete");

    let store: SharedStore = Arc::new(Mutex::new(store));
    let policy = StalenessPolicy::from_config(&config.staleness);
    let rules = RuleSet::from_config(&config.validation);
    let parser = TopicParser::new(
        config.mqtt.topic_prefix.clone(),
        RemapTable::from_entries(&config.remap),
    );
    let ingestor = Ingestor::new(parser, rules, store.clone());

    // Persistence runs on its own timer task so disk latency never stalls
    // the delivery path.
    let timer = {
        let store = store.clone();
        let policy = policy.clone();
        let mut tick_persistence = Persistence::new(&config.persistence);
        let tick_secs = config.persistence.write_interval_secs;
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(tick_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the snapshot
            // reflects at least one interval of readings
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tick_persistence.tick(&store, &policy, Utc::now());
            }
        })
    };

    let result = tokio::select! {
        res = bus::run(&config.mqtt, ingestor) => res.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    };

    // Final synchronous pass: snapshot, stats, log, and recovery cache.
    // Wait for the timer task to wind down so no tick races the flush.
    timer.abort();
    let _ = timer.await;
    persistence.shutdown_flush(&store, &policy, Utc::now());

    let counters = lock_store(&store).counters();
    info!(
        accepted = counters.accepted,
        rejected = counters.rejected,
        malformed = counters.malformed,
        log_dropped = counters.log_dropped,
        "final ingest totals"
    );

    result
}
