//! # Error Types
//!
//! Custom error types for the telemetry daemon using `thiserror`.

use thiserror::Error;

/// Main error type for the telemetry daemon
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Configuration file parse errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Configuration values that parsed but failed validation
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MQTT connection failures surfaced before the first successful connect
    #[error("MQTT connection error: {0}")]
    MqttConnection(String),
}

/// Result type alias for the telemetry daemon
pub type Result<T> = std::result::Result<T, TelemetryError>;
