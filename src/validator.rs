//! # Validator
//!
//! Rejects out-of-range values and improbable jumps ("spike rejection").
//!
//! Rules are defined per metric class, not per metric: every temperature
//! sensor in the greenhouse shares one plausible range, and the class is
//! derived from the logical key's suffix (`interior_temp` -> temperature,
//! `satellite_battery` -> voltage). Metrics whose suffix maps to no class
//! are accepted unconditionally so unknown or experimental sensors remain
//! visible for diagnosis, just unvalidated.
//!
//! Rejections never touch aggregator state; the caller logs them with full
//! context and moves on.
//!
//! ## Usage
//!
//! ```
//! use chrono::{Duration, Utc};
//! use greenhouse_telemetryd::reading::Reading;
//! use greenhouse_telemetryd::validator::{validate, RejectReason, ValidationRule};
//!
//! let rule = ValidationRule {
//!     min_valid: -40.0,
//!     max_valid: 130.0,
//!     max_delta: 20.0,
//!     delta_window: Duration::minutes(10),
//! };
//!
//! let reading = Reading::new("greenhouse-pi", "interior_temp", 140.0, Utc::now());
//! assert_eq!(
//!     validate(&reading, Some(&rule), None),
//!     Err(RejectReason::OutOfRange)
//! );
//! ```

use chrono::Duration;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

use crate::config::{RuleConfig, ValidationConfig};
use crate::reading::Reading;

/// Metric classes sharing one validation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricClass {
    Temperature,
    Humidity,
    Pressure,
    /// Battery level / supply voltage sensors
    Voltage,
}

/// Validity bounds and spike thresholds for one metric class.
///
/// Immutable, loaded at startup, never mutated at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationRule {
    pub min_valid: f64,
    pub max_valid: f64,
    /// Largest accepted change across `delta_window`
    pub max_delta: f64,
    pub delta_window: Duration,
}

impl ValidationRule {
    fn from_config(cfg: &RuleConfig) -> Self {
        Self {
            min_valid: cfg.min_valid,
            max_valid: cfg.max_valid,
            max_delta: cfg.max_delta,
            delta_window: Duration::seconds(cfg.delta_window_secs as i64),
        }
    }
}

/// Why a reading was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Value outside the class's `[min_valid, max_valid]` range
    OutOfRange,
    /// Implausible change from the last accepted value within the window
    Spike,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::OutOfRange => write!(f, "out of range"),
            RejectReason::Spike => write!(f, "spike"),
        }
    }
}

/// Resolved rule set: suffix classifier plus one rule per class.
#[derive(Debug, Clone)]
pub struct RuleSet {
    suffixes: HashMap<String, MetricClass>,
    rules: HashMap<MetricClass, ValidationRule>,
}

impl RuleSet {
    /// Builds the rule set from configuration.
    #[must_use]
    pub fn from_config(cfg: &ValidationConfig) -> Self {
        let rules = HashMap::from([
            (MetricClass::Temperature, ValidationRule::from_config(&cfg.temperature)),
            (MetricClass::Humidity, ValidationRule::from_config(&cfg.humidity)),
            (MetricClass::Pressure, ValidationRule::from_config(&cfg.pressure)),
            (MetricClass::Voltage, ValidationRule::from_config(&cfg.voltage)),
        ]);
        Self {
            suffixes: cfg.class_suffixes.clone(),
            rules,
        }
    }

    /// Looks up the rule for a logical metric key, by suffix.
    ///
    /// Returns `None` for metrics with no configured class; those are
    /// accepted unconditionally.
    #[must_use]
    pub fn rule_for(&self, metric_key: &str) -> Option<&ValidationRule> {
        let suffix = metric_key.rsplit('_').next().unwrap_or(metric_key);
        self.suffixes.get(suffix).and_then(|class| self.rules.get(class))
    }
}

/// Validates a reading against its class rule and the last accepted value.
///
/// # Arguments
///
/// * `reading` - Candidate reading
/// * `rule` - Rule for the metric's class, if any
/// * `last_accepted` - Most recently accepted reading for the same metric
///
/// # Errors
///
/// Returns the [`RejectReason`] when the reading must be dropped. The spike
/// check only applies when the last accepted reading is within the rule's
/// `delta_window`; a slow drift over hours is not a spike.
pub fn validate(
    reading: &Reading,
    rule: Option<&ValidationRule>,
    last_accepted: Option<&Reading>,
) -> std::result::Result<(), RejectReason> {
    let Some(rule) = rule else {
        return Ok(());
    };

    if reading.value < rule.min_valid || reading.value > rule.max_valid {
        return Err(RejectReason::OutOfRange);
    }

    if let Some(last) = last_accepted {
        let elapsed = reading.observed_at - last.observed_at;
        if elapsed <= rule.delta_window && (reading.value - last.value).abs() > rule.max_delta {
            return Err(RejectReason::Spike);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn temp_rule() -> ValidationRule {
        ValidationRule {
            min_valid: -40.0,
            max_valid: 130.0,
            max_delta: 20.0,
            delta_window: Duration::minutes(10),
        }
    }

    fn reading_at(value: f64, minute: u32) -> Reading {
        Reading::new(
            "greenhouse-pi",
            "interior_temp",
            value,
            Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0).unwrap(),
        )
    }

    #[test]
    fn test_in_range_value_accepted() {
        let rule = temp_rule();
        assert!(validate(&reading_at(68.0, 0), Some(&rule), None).is_ok());
    }

    #[test]
    fn test_value_above_max_rejected() {
        let rule = temp_rule();
        assert_eq!(
            validate(&reading_at(140.0, 0), Some(&rule), None),
            Err(RejectReason::OutOfRange)
        );
    }

    #[test]
    fn test_value_below_min_rejected() {
        let rule = temp_rule();
        assert_eq!(
            validate(&reading_at(-41.0, 0), Some(&rule), None),
            Err(RejectReason::OutOfRange)
        );
    }

    #[test]
    fn test_boundary_values_accepted() {
        let rule = temp_rule();
        assert!(validate(&reading_at(-40.0, 0), Some(&rule), None).is_ok());
        assert!(validate(&reading_at(130.0, 0), Some(&rule), None).is_ok());
    }

    #[test]
    fn test_jump_within_window_rejected_as_spike() {
        let rule = temp_rule();
        let last = reading_at(68.0, 0);
        assert_eq!(
            validate(&reading_at(95.0, 2), Some(&rule), Some(&last)),
            Err(RejectReason::Spike)
        );
    }

    #[test]
    fn test_jump_at_exactly_max_delta_accepted() {
        let rule = temp_rule();
        let last = reading_at(68.0, 0);
        assert!(validate(&reading_at(88.0, 2), Some(&rule), Some(&last)).is_ok());
    }

    #[test]
    fn test_spike_check_skipped_outside_window() {
        // Same 27 degree jump, but 11 minutes apart: legitimate drift
        let rule = temp_rule();
        let last = reading_at(68.0, 0);
        assert!(validate(&reading_at(95.0, 11), Some(&rule), Some(&last)).is_ok());
    }

    #[test]
    fn test_spike_check_applies_at_exactly_the_window() {
        let rule = temp_rule();
        let last = reading_at(68.0, 0);
        assert_eq!(
            validate(&reading_at(95.0, 10), Some(&rule), Some(&last)),
            Err(RejectReason::Spike)
        );
    }

    #[test]
    fn test_downward_spike_rejected() {
        let rule = temp_rule();
        let last = reading_at(68.0, 0);
        assert_eq!(
            validate(&reading_at(40.0, 2), Some(&rule), Some(&last)),
            Err(RejectReason::Spike)
        );
    }

    #[test]
    fn test_no_rule_accepts_anything() {
        assert!(validate(&reading_at(9999.0, 0), None, None).is_ok());
    }

    #[test]
    fn test_range_check_runs_before_spike_check() {
        let rule = temp_rule();
        let last = reading_at(125.0, 0);
        // 140 is both out of range and a spike; range wins for diagnosis
        assert_eq!(
            validate(&reading_at(140.0, 1), Some(&rule), Some(&last)),
            Err(RejectReason::OutOfRange)
        );
    }

    #[test]
    fn test_rule_set_classifies_by_suffix() {
        let ruleset = RuleSet::from_config(&crate::config::ValidationConfig::default());

        let temp = ruleset.rule_for("interior_temp").unwrap();
        assert_eq!(temp.max_valid, 130.0);

        let exterior = ruleset.rule_for("exterior_temp").unwrap();
        assert_eq!(exterior.max_valid, temp.max_valid);

        let humidity = ruleset.rule_for("exterior_humidity").unwrap();
        assert_eq!(humidity.max_valid, 100.0);

        let battery = ruleset.rule_for("satellite_battery").unwrap();
        assert_eq!(battery.min_valid, 0.0);

        assert!(ruleset.rule_for("soil_moisture").is_none());
    }

    #[test]
    fn test_rule_set_handles_suffix_only_keys() {
        // A passthrough metric with no underscore classifies by the whole key
        let ruleset = RuleSet::from_config(&crate::config::ValidationConfig::default());
        assert!(ruleset.rule_for("temperature").is_some());
        assert!(ruleset.rule_for("co2").is_none());
    }

    #[test]
    fn test_reject_reason_display() {
        assert_eq!(RejectReason::OutOfRange.to_string(), "out of range");
        assert_eq!(RejectReason::Spike.to_string(), "spike");
    }

    #[test]
    fn test_concrete_scenario_from_the_greenhouse() {
        // 68 F at t0, 71 F two minutes later: both accepted
        let rule = temp_rule();
        let first = reading_at(68.0, 0);
        assert!(validate(&first, Some(&rule), None).is_ok());

        let second = reading_at(71.0, 2);
        assert!(validate(&second, Some(&rule), Some(&first)).is_ok());

        // 140 F a minute after that: out of range, latest stays 71
        let third = reading_at(140.0, 3);
        assert_eq!(
            validate(&third, Some(&rule), Some(&second)),
            Err(RejectReason::OutOfRange)
        );
    }
}
