//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every option is static at process start; there is no runtime
//! reconfiguration. Missing sections and fields fall back to defaults that
//! match the hardware currently on the bus, so an empty file is a valid
//! configuration.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, TelemetryError};
use crate::topic::RemapEntry;
use crate::validator::MetricClass;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub staleness: StalenessConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Extra remap rules merged over the built-in wiring table
    #[serde(default)]
    pub remap: Vec<RemapEntry>,
}

/// Message bus connection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// First topic segment; the subscription filter becomes
    /// `{topic_prefix}/+/sensor/+/state`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

/// Validation rule for one metric class
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RuleConfig {
    pub min_valid: f64,
    pub max_valid: f64,

    /// Largest accepted change across `delta_window_secs`
    pub max_delta: f64,
    pub delta_window_secs: u64,
}

/// Validation configuration: one rule per metric class plus the
/// suffix-to-class assignment table
#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    /// Metric key suffix (text after the last `_`) to metric class
    #[serde(default = "default_class_suffixes")]
    pub class_suffixes: HashMap<String, MetricClass>,

    #[serde(default = "default_temperature_rule")]
    pub temperature: RuleConfig,

    #[serde(default = "default_humidity_rule")]
    pub humidity: RuleConfig,

    #[serde(default = "default_pressure_rule")]
    pub pressure: RuleConfig,

    #[serde(default = "default_voltage_rule")]
    pub voltage: RuleConfig,
}

/// Staleness thresholds in minutes
#[derive(Debug, Deserialize, Clone)]
pub struct StalenessConfig {
    #[serde(default = "default_stale_minutes")]
    pub default_minutes: u64,

    /// Per-metric overrides (e.g. a battery sensor that reports rarely)
    #[serde(default = "default_stale_overrides")]
    pub per_metric: HashMap<String, u64>,
}

/// Persistence layer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    #[serde(default = "default_status_path")]
    pub status_path: String,

    #[serde(default = "default_stats_path")]
    pub stats_path: String,

    #[serde(default = "default_history_cache_path")]
    pub history_cache_path: String,

    #[serde(default = "default_sensor_log_dir")]
    pub sensor_log_dir: String,

    /// Seconds between persistence ticks
    #[serde(default = "default_write_interval_secs")]
    pub write_interval_secs: u64,

    /// Recovery cache is written every Nth tick (and on shutdown)
    #[serde(default = "default_recovery_cache_ticks")]
    pub recovery_cache_ticks: u32,

    /// Hard cap on per-metric history length, independent of the time window
    #[serde(default = "default_history_hard_cap")]
    pub history_hard_cap: usize,

    /// Cap on buffered-but-unflushed long-term log entries
    #[serde(default = "default_log_buffer_cap")]
    pub log_buffer_cap: usize,
}

// Default value functions
fn default_mqtt_host() -> String { "mosquitto".to_string() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_client_id() -> String { "greenhouse-telemetryd".to_string() }
fn default_topic_prefix() -> String { "greenhouse".to_string() }
fn default_keepalive_secs() -> u64 { 60 }

fn default_class_suffixes() -> HashMap<String, MetricClass> {
    HashMap::from([
        ("temp".to_string(), MetricClass::Temperature),
        ("temperature".to_string(), MetricClass::Temperature),
        ("humidity".to_string(), MetricClass::Humidity),
        ("pressure".to_string(), MetricClass::Pressure),
        ("battery".to_string(), MetricClass::Voltage),
    ])
}

// Ranges are Fahrenheit / %RH / hPa / battery percent, matching the units
// the remapper emits.
fn default_temperature_rule() -> RuleConfig {
    RuleConfig { min_valid: -40.0, max_valid: 130.0, max_delta: 20.0, delta_window_secs: 600 }
}
fn default_humidity_rule() -> RuleConfig {
    RuleConfig { min_valid: 0.0, max_valid: 100.0, max_delta: 30.0, delta_window_secs: 600 }
}
fn default_pressure_rule() -> RuleConfig {
    RuleConfig { min_valid: 870.0, max_valid: 1085.0, max_delta: 15.0, delta_window_secs: 600 }
}
fn default_voltage_rule() -> RuleConfig {
    RuleConfig { min_valid: 0.0, max_valid: 100.0, max_delta: 50.0, delta_window_secs: 600 }
}

fn default_stale_minutes() -> u64 { 60 }
fn default_stale_overrides() -> HashMap<String, u64> {
    HashMap::from([("satellite_battery".to_string(), 120)])
}

fn default_status_path() -> String { "./data/status.json".to_string() }
fn default_stats_path() -> String { "./data/stats_24h.json".to_string() }
fn default_history_cache_path() -> String { "./data/history_cache.json".to_string() }
fn default_sensor_log_dir() -> String { "./data/sensor_log".to_string() }
fn default_write_interval_secs() -> u64 { 60 }
fn default_recovery_cache_ticks() -> u32 { 5 }
fn default_history_hard_cap() -> usize { 4096 }
fn default_log_buffer_cap() -> usize { 10_000 }

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            topic_prefix: default_topic_prefix(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            class_suffixes: default_class_suffixes(),
            temperature: default_temperature_rule(),
            humidity: default_humidity_rule(),
            pressure: default_pressure_rule(),
            voltage: default_voltage_rule(),
        }
    }
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            default_minutes: default_stale_minutes(),
            per_metric: default_stale_overrides(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            status_path: default_status_path(),
            stats_path: default_stats_path(),
            history_cache_path: default_history_cache_path(),
            sensor_log_dir: default_sensor_log_dir(),
            write_interval_secs: default_write_interval_secs(),
            recovery_cache_ticks: default_recovery_cache_ticks(),
            history_hard_cap: default_history_hard_cap(),
            log_buffer_cap: default_log_buffer_cap(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, TOML parsing fails, or
    /// validation fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            return Err(TelemetryError::ConfigInvalid(
                "mqtt host cannot be empty".to_string(),
            ));
        }

        if self.mqtt.client_id.is_empty() {
            return Err(TelemetryError::ConfigInvalid(
                "mqtt client_id cannot be empty".to_string(),
            ));
        }

        if self.mqtt.topic_prefix.is_empty()
            || self.mqtt.topic_prefix.contains(['/', '+', '#'])
        {
            return Err(TelemetryError::ConfigInvalid(
                "topic_prefix must be a single non-empty topic segment".to_string(),
            ));
        }

        if self.mqtt.keepalive_secs == 0 || self.mqtt.keepalive_secs > 3600 {
            return Err(TelemetryError::ConfigInvalid(
                "keepalive_secs must be between 1 and 3600".to_string(),
            ));
        }

        for (name, rule) in [
            ("temperature", &self.validation.temperature),
            ("humidity", &self.validation.humidity),
            ("pressure", &self.validation.pressure),
            ("voltage", &self.validation.voltage),
        ] {
            if rule.min_valid >= rule.max_valid {
                return Err(TelemetryError::ConfigInvalid(format!(
                    "{} rule: min_valid must be less than max_valid",
                    name
                )));
            }
            if rule.max_delta <= 0.0 {
                return Err(TelemetryError::ConfigInvalid(format!(
                    "{} rule: max_delta must be greater than 0",
                    name
                )));
            }
            if rule.delta_window_secs == 0 || rule.delta_window_secs > 86_400 {
                return Err(TelemetryError::ConfigInvalid(format!(
                    "{} rule: delta_window_secs must be between 1 and 86400",
                    name
                )));
            }
        }

        if self.staleness.default_minutes == 0 {
            return Err(TelemetryError::ConfigInvalid(
                "staleness default_minutes must be greater than 0".to_string(),
            ));
        }

        for (metric, minutes) in &self.staleness.per_metric {
            if *minutes == 0 {
                return Err(TelemetryError::ConfigInvalid(format!(
                    "staleness override for '{}' must be greater than 0",
                    metric
                )));
            }
        }

        if self.persistence.write_interval_secs == 0
            || self.persistence.write_interval_secs > 3600
        {
            return Err(TelemetryError::ConfigInvalid(
                "write_interval_secs must be between 1 and 3600".to_string(),
            ));
        }

        if self.persistence.recovery_cache_ticks == 0 {
            return Err(TelemetryError::ConfigInvalid(
                "recovery_cache_ticks must be greater than 0".to_string(),
            ));
        }

        if self.persistence.history_hard_cap == 0 {
            return Err(TelemetryError::ConfigInvalid(
                "history_hard_cap must be greater than 0".to_string(),
            ));
        }

        if self.persistence.log_buffer_cap == 0 {
            return Err(TelemetryError::ConfigInvalid(
                "log_buffer_cap must be greater than 0".to_string(),
            ));
        }

        for path in [
            &self.persistence.status_path,
            &self.persistence.stats_path,
            &self.persistence.history_cache_path,
            &self.persistence.sensor_log_dir,
        ] {
            if path.is_empty() {
                return Err(TelemetryError::ConfigInvalid(
                    "persistence paths cannot be empty".to_string(),
                ));
            }
        }

        for entry in &self.remap {
            if entry.raw_device.is_empty()
                || entry.raw_metric.is_empty()
                || entry.device_key.is_empty()
                || entry.metric_key.is_empty()
            {
                return Err(TelemetryError::ConfigInvalid(
                    "remap entries must have non-empty keys".to_string(),
                ));
            }
        }

        Ok(())
    }
}
