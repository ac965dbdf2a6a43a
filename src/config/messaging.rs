//! Broker connection configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Broker type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// In-process broker (no external dependency).
    #[default]
    Memory,
    /// AMQP/RabbitMQ broker.
    Amqp,
}

/// Broker configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker type discriminator.
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
    /// Idle lifetime of per-correlation response queues, in milliseconds.
    /// Zero disables expiry.
    pub response_queue_ttl_ms: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 10,
            response_queue_ttl_ms: 60_000,
        }
    }
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn response_queue_ttl(&self) -> Option<Duration> {
        (self.response_queue_ttl_ms > 0).then(|| Duration::from_millis(self.response_queue_ttl_ms))
    }
}
