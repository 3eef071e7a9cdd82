//! # Topic Parser & Key Remapper
//!
//! Turns a raw MQTT topic and payload into a typed [`Reading`].
//!
//! This module handles:
//! - Parsing the fixed topic schema `prefix/{device}/sensor/{metric}/state`
//! - Parsing the payload as a decimal number
//! - Remapping raw hardware identifiers to logical sensor roles
//! - Unit conversion for device families that report in other units
//!
//! The remap table exists because the physical wiring history does not
//! match the logical naming: the probe once labeled `exterior` sits inside
//! the greenhouse, and the true exterior readings come from the solar
//! satellite node, which reports temperature in Celsius.
//!
//! Parsing is a pure transformation; the caller decides how to log drops.
//!
//! ## Usage
//!
//! ```
//! use chrono::Utc;
//! use greenhouse_telemetryd::topic::{RemapTable, TopicParser};
//!
//! let parser = TopicParser::new("greenhouse", RemapTable::with_defaults());
//! let reading = parser
//!     .parse("greenhouse/satellite-2/sensor/temperature/state", b"20.0", Utc::now())
//!     .unwrap();
//!
//! // Remapped to the logical key, converted C -> F
//! assert_eq!(reading.metric_key, "exterior_temp");
//! assert_eq!(reading.value, 68.0);
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

use chrono::{DateTime, Utc};

use crate::reading::Reading;

/// Unit conversion applied by a remap rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitConversion {
    /// `value * 9/5 + 32`
    CelsiusToFahrenheit,
}

impl UnitConversion {
    /// Applies the conversion to a raw value.
    #[must_use]
    pub fn apply(&self, value: f64) -> f64 {
        match self {
            UnitConversion::CelsiusToFahrenheit => value * 9.0 / 5.0 + 32.0,
        }
    }
}

/// One remap rule as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RemapEntry {
    /// Device segment as it appears on the wire
    pub raw_device: String,
    /// Metric segment as it appears on the wire
    pub raw_metric: String,
    /// Logical device identifier to emit
    pub device_key: String,
    /// Logical metric key to emit
    pub metric_key: String,
    #[serde(default)]
    pub convert: Option<UnitConversion>,
}

/// Resolved remap target: logical names plus an optional conversion.
#[derive(Debug, Clone)]
pub struct RemapRule {
    pub device_key: String,
    pub metric_key: String,
    pub convert: Option<UnitConversion>,
}

/// Static lookup table from `(raw_device, raw_metric)` to logical names.
///
/// Immutable after startup. Unmapped keys pass through unchanged so new
/// devices show up without a config change.
#[derive(Debug, Clone, Default)]
pub struct RemapTable {
    rules: HashMap<(String, String), RemapRule>,
}

impl RemapTable {
    /// Creates an empty table (every key passes through).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the built-in table for the current greenhouse wiring.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.insert("interior", "temp", "greenhouse-pi", "interior_temp", None);
        table.insert("interior", "humidity", "greenhouse-pi", "interior_humidity", None);
        table.insert("interior", "pressure", "greenhouse-pi", "interior_pressure", None);
        table.insert(
            "satellite-2",
            "temperature",
            "satellite-2",
            "exterior_temp",
            Some(UnitConversion::CelsiusToFahrenheit),
        );
        table.insert("satellite-2", "humidity", "satellite-2", "exterior_humidity", None);
        table.insert("satellite-2", "pressure", "satellite-2", "exterior_pressure", None);
        table.insert("satellite-2", "battery", "satellite-2", "satellite_battery", None);
        table
    }

    /// Creates the built-in table with configured entries merged over it.
    ///
    /// A configured entry for an existing `(raw_device, raw_metric)` pair
    /// replaces the built-in rule.
    #[must_use]
    pub fn from_entries(entries: &[RemapEntry]) -> Self {
        let mut table = Self::with_defaults();
        for entry in entries {
            table.insert(
                &entry.raw_device,
                &entry.raw_metric,
                &entry.device_key,
                &entry.metric_key,
                entry.convert,
            );
        }
        table
    }

    fn insert(
        &mut self,
        raw_device: &str,
        raw_metric: &str,
        device_key: &str,
        metric_key: &str,
        convert: Option<UnitConversion>,
    ) {
        self.rules.insert(
            (raw_device.to_string(), raw_metric.to_string()),
            RemapRule {
                device_key: device_key.to_string(),
                metric_key: metric_key.to_string(),
                convert,
            },
        );
    }

    /// Looks up the rule for a raw `(device, metric)` pair.
    #[must_use]
    pub fn resolve(&self, raw_device: &str, raw_metric: &str) -> Option<&RemapRule> {
        self.rules
            .get(&(raw_device.to_string(), raw_metric.to_string()))
    }

    /// Number of rules in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True if the table has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Errors for messages this daemon drops without touching any state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Topic did not match `prefix/{device}/sensor/{metric}/state`
    #[error("malformed topic '{0}'")]
    MalformedTopic(String),

    /// Payload was not a UTF-8 decimal number
    #[error("malformed payload on topic '{0}'")]
    MalformedPayload(String),
}

/// Parses raw bus messages into typed readings.
#[derive(Debug, Clone)]
pub struct TopicParser {
    prefix: String,
    remap: RemapTable,
}

impl TopicParser {
    /// Creates a parser for the given topic prefix and remap table.
    #[must_use]
    pub fn new(prefix: impl Into<String>, remap: RemapTable) -> Self {
        Self {
            prefix: prefix.into(),
            remap,
        }
    }

    /// Parses one message into a [`Reading`].
    ///
    /// # Arguments
    ///
    /// * `topic` - Full topic string from the bus
    /// * `payload` - Raw payload bytes (expected UTF-8 decimal number)
    /// * `observed_at` - Receipt timestamp stamped by the caller
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] for a topic outside the schema or a payload
    /// that is not a finite decimal number. Both are drop-and-log cases,
    /// never fatal.
    pub fn parse(
        &self,
        topic: &str,
        payload: &[u8],
        observed_at: DateTime<Utc>,
    ) -> std::result::Result<Reading, ParseError> {
        let (raw_device, raw_metric) = self.split_topic(topic)?;

        let text = std::str::from_utf8(payload)
            .map_err(|_| ParseError::MalformedPayload(topic.to_string()))?;
        let raw_value: f64 = text
            .trim()
            .parse()
            .map_err(|_| ParseError::MalformedPayload(topic.to_string()))?;
        if !raw_value.is_finite() {
            return Err(ParseError::MalformedPayload(topic.to_string()));
        }

        let reading = match self.remap.resolve(raw_device, raw_metric) {
            Some(rule) => {
                let value = match rule.convert {
                    Some(conversion) => conversion.apply(raw_value),
                    None => raw_value,
                };
                Reading::new(rule.device_key.clone(), rule.metric_key.clone(), value, observed_at)
            }
            // Forward-compatible with devices the table does not know yet
            None => Reading::new(raw_device, raw_metric, raw_value, observed_at),
        };

        Ok(reading)
    }

    /// Splits a topic into `(device, metric)`, enforcing the fixed schema.
    fn split_topic<'t>(
        &self,
        topic: &'t str,
    ) -> std::result::Result<(&'t str, &'t str), ParseError> {
        let mut parts = topic.split('/');

        let prefix = parts.next();
        let device = parts.next();
        let sensor = parts.next();
        let metric = parts.next();
        let state = parts.next();
        let extra = parts.next();

        match (prefix, device, sensor, metric, state, extra) {
            (Some(p), Some(d), Some("sensor"), Some(m), Some("state"), None)
                if p == self.prefix && !d.is_empty() && !m.is_empty() =>
            {
                Ok((d, m))
            }
            _ => Err(ParseError::MalformedTopic(topic.to_string())),
        }
    }
}
