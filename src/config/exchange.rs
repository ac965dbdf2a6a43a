//! Listener and request/response exchange tuning.

use std::time::Duration;

use serde::Deserialize;

/// How a listener draws messages from its queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Broker pushes the next message once the previous one is settled.
    #[default]
    Push,
    /// Listener fetches on a fixed interval, skipping empty ticks.
    Poll,
}

/// Listener and publisher settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Delivery discipline.
    pub mode: DeliveryMode,
    /// Fetch interval in poll mode, in milliseconds.
    pub poll_interval_ms: u64,
    /// Pause before returning a declined request to the queue, in milliseconds.
    pub requeue_delay_ms: u64,
    /// Extra attempts for a failed publish.
    pub publish_retries: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Push,
            poll_interval_ms: 100,
            requeue_delay_ms: 100,
            publish_retries: 3,
        }
    }
}

impl ListenerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

/// Timeouts and retry policy of the correlated exchanges.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Requester wait for a responder to claim a request, in milliseconds.
    pub ack_timeout_ms: u64,
    /// Requester wait for the final result, in milliseconds.
    pub result_timeout_ms: u64,
    /// Responder wait for the requester's confirmation, in milliseconds.
    pub confirm_timeout_ms: u64,
    /// Retries of a whole exchange after the first attempt.
    pub max_retries: u32,
    /// Smallest pause between attempts, in milliseconds.
    pub retry_min_delay_ms: u64,
    /// Largest pause between attempts, in milliseconds.
    pub retry_max_delay_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            result_timeout_ms: 5_000,
            confirm_timeout_ms: 1_000,
            max_retries: 10,
            retry_min_delay_ms: 100,
            retry_max_delay_ms: 2_000,
        }
    }
}

impl ExchangeConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn retry_min_delay(&self) -> Duration {
        Duration::from_millis(self.retry_min_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms.max(self.retry_min_delay_ms))
    }
}

/// Machine details the agent binary answers with.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub host: String,
    pub username: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            username: "root".to_string(),
        }
    }
}
