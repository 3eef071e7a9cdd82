//! # Bus Subscription
//!
//! Wires the MQTT event loop to the parse -> validate -> aggregate
//! pipeline.
//!
//! This module handles:
//! - Building client options from configuration
//! - Subscribing to `prefix/+/sensor/+/state` on every ConnAck, so the
//!   subscription survives broker reconnects
//! - Dispatching each publish through the ingestion pipeline
//! - Retrying lost connections with a fixed delay
//!
//! Message handling performs no disk or network I/O; it parses, validates,
//! and mutates the shared store under a short lock. A failure before the
//! first successful connect is a startup error and bubbles up; anything
//! after that is logged and retried forever.

use bytes::Bytes;
use chrono::Utc;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::aggregator::{lock_store, SharedStore};
use crate::config::MqttConfig;
use crate::error::{Result, TelemetryError};
use crate::topic::TopicParser;
use crate::validator::{validate, RuleSet};

/// Delay before re-polling after a lost connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Builds client options from the bus configuration.
#[must_use]
pub fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(cfg.client_id.as_str(), cfg.host.as_str(), cfg.port);
    options.set_keep_alive(Duration::from_secs(cfg.keepalive_secs));
    if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
        options.set_credentials(username.as_str(), password.as_str());
        info!(username = %username, "using MQTT authentication");
    }
    options
}

/// Subscription filter matching every sensor state topic under the prefix.
#[must_use]
pub fn subscription_filter(topic_prefix: &str) -> String {
    format!("{topic_prefix}/+/sensor/+/state")
}

/// The per-message ingestion pipeline: parse, validate, aggregate.
pub struct Ingestor {
    parser: TopicParser,
    rules: RuleSet,
    store: SharedStore,
}

impl Ingestor {
    /// Creates the pipeline over a shared store.
    #[must_use]
    pub fn new(parser: TopicParser, rules: RuleSet, store: SharedStore) -> Self {
        Self {
            parser,
            rules,
            store,
        }
    }

    /// Handles one publish from the bus.
    ///
    /// Malformed messages and validation rejections are logged and
    /// dropped; only accepted readings mutate the store.
    pub fn handle_publish(&self, topic: &str, payload: &Bytes) {
        let now = Utc::now();

        let reading = match self.parser.parse(topic, payload.as_ref(), now) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("dropping message: {e}");
                lock_store(&self.store).record_malformed();
                return;
            }
        };

        let rule = self.rules.rule_for(&reading.metric_key);
        let mut guard = lock_store(&self.store);
        let verdict = validate(&reading, rule, guard.last_accepted(&reading.metric_key));
        match verdict {
            Ok(()) => {
                debug!(
                    device = %reading.device_key,
                    metric = %reading.metric_key,
                    value = reading.value,
                    "accepted reading"
                );
                guard.accept(reading);
            }
            Err(reason) => {
                guard.record_rejected();
                warn!(
                    device = %reading.device_key,
                    metric = %reading.metric_key,
                    value = reading.value,
                    %reason,
                    "rejected reading"
                );
            }
        }
    }
}

/// Runs the MQTT event loop until the task is cancelled.
///
/// # Errors
///
/// Returns an error only when the very first connection attempt fails;
/// the daemon treats that as an unrecoverable startup failure. Once
/// connected, connection loss is retried with [`RECONNECT_DELAY`] forever.
pub async fn run(cfg: &MqttConfig, ingestor: Ingestor) -> Result<()> {
    let options = mqtt_options(cfg);
    let (client, mut eventloop) = AsyncClient::new(options, 64);
    let filter = subscription_filter(&cfg.topic_prefix);

    info!(host = %cfg.host, port = cfg.port, "connecting to MQTT broker");

    let mut connected_once = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    warn!(code = ?ack.code, "MQTT broker refused the connection");
                    continue;
                }
                connected_once = true;
                info!("connected to MQTT broker");
                match client.subscribe(filter.as_str(), QoS::AtLeastOnce).await {
                    Ok(()) => info!(filter = %filter, "subscribed to sensor state topics"),
                    Err(e) => warn!(filter = %filter, "subscribe request failed: {e}"),
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                ingestor.handle_publish(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) if !connected_once => {
                return Err(TelemetryError::MqttConnection(e.to_string()));
            }
            Err(e) => {
                warn!(
                    "MQTT connection lost, retrying in {}s: {e}",
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
