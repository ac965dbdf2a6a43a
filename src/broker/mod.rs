//! Broker collaborator.
//!
//! This module contains:
//! - `Broker` trait: opens short-lived channels on a shared connection
//! - `BrokerChannel` trait: the AMQP primitives the connector relies on
//!   (declare, bind, delete, publish, qos, consume, get, close)
//! - `Delivery`/`Acker`: a received message and its settlement handle
//! - Implementations: AMQP (RabbitMQ via lapin), in-process memory broker
//!
//! The connector depends only on at-least-once delivery, competing consumers
//! on a shared queue, fanout exchanges, and prefetch limits. Both
//! implementations provide exactly those semantics.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, BrokerType};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
#[cfg(feature = "memory")]
pub use memory::{MemoryBroker, MemoryStats};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Declare failed: {0}")]
    Declare(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledge failed: {0}")]
    Ack(String),

    #[error("Channel closed")]
    ChannelClosed,
}

/// Exchange types used by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route by exact routing key.
    Direct,
    /// Copy every message to every bound queue.
    Fanout,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives broker restarts.
    pub durable: bool,
    /// Private to the declaring channel's connection; deleted when it closes.
    pub exclusive: bool,
    /// Deleted by the broker after being unused for this long.
    pub expires: Option<Duration>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Default::default()
        }
    }

    pub fn transient(expires: Option<Duration>) -> Self {
        Self {
            expires,
            ..Default::default()
        }
    }
}

/// Settlement of a single delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Accept the message, removing it from its queue.
    async fn ack(&self) -> Result<()>;

    /// Refuse the message; `requeue` returns it to its queue for redelivery.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer, pending settlement.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, redelivered: bool, data: Vec<u8>, acker: Arc<dyn Acker>) -> Self {
        Self {
            delivery_tag,
            redelivered,
            data,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Push-based delivery stream returned by [`BrokerChannel::consume`].
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A broker channel. Owned by exactly one publisher or subscription.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue; idempotent for identical options. Returns its name.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    /// Declare an exchange; idempotent for an identical kind.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Bind a queue to an exchange.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Delete a queue and whatever it still holds. Deleting a missing queue
    /// is a no-op.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Publish a body. An empty `exchange` routes directly to the queue named
    /// by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<()>;

    /// Limit unacknowledged pushed deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Start a push consumer on a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Fetch one message without blocking.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Close the channel, returning unacknowledged deliveries to their queues.
    /// Closing twice is a no-op.
    async fn close(&self) -> Result<()>;
}

/// A connection to a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a fresh channel.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a broker based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - Memory: `--features memory` (included in default)
/// - AMQP: `--features amqp`
pub async fn init_broker(
    config: &BrokerConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.broker_type {
        BrokerType::Memory => {
            #[cfg(feature = "memory")]
            {
                info!(broker_type = "memory", "Broker initialized");
                Ok(Arc::new(MemoryBroker::new()))
            }

            #[cfg(not(feature = "memory"))]
            {
                Err("Memory broker requires the 'memory' feature. Rebuild with --features memory"
                    .into())
            }
        }
        BrokerType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::new(&config.amqp).await?;
                info!(broker_type = "amqp", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
    }
}

/// Close a channel from a cleanup path, logging instead of failing.
pub async fn close_quietly(channel: &dyn BrokerChannel) {
    match channel.close().await {
        Ok(()) => debug!("Channel closed"),
        Err(e) => warn!(error = %e, "Failed to close channel"),
    }
}
