//! # Reading Types
//!
//! The core observation type shared by every stage of the pipeline.
//!
//! A [`Reading`] is one accepted (or about-to-be-validated) observation:
//! a logical device, a logical metric, a numeric value, and the receipt
//! timestamp. The same shape is serialized verbatim as one line of the
//! monthly append-only log and inside the recovery cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sensor observation.
///
/// `observed_at` is the receipt time, used as a proxy for the sample time;
/// devices on this bus do not stamp their own readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Logical device identifier after remapping (e.g. `satellite-2`)
    pub device_key: String,
    /// Logical metric key after remapping (e.g. `interior_temp`)
    pub metric_key: String,
    /// Numeric value, already unit-converted
    pub value: f64,
    /// Receipt timestamp (UTC)
    pub observed_at: DateTime<Utc>,
}

impl Reading {
    /// Creates a new reading.
    #[must_use]
    pub fn new(
        device_key: impl Into<String>,
        metric_key: impl Into<String>,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_key: device_key.into(),
            metric_key: metric_key.into(),
            value,
            observed_at,
        }
    }
}
