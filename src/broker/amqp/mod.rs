//! AMQP (RabbitMQ) broker implementation.
//!
//! Connections come from a `deadpool-lapin` pool; every publisher and every
//! subscription opens its own short-lived channel on a pooled connection.
//! Channels run in publisher-confirm mode, so a publish returns only once
//! the broker has taken responsibility for the message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ConnectionProperties,
};
use tracing::{debug, info};

use super::{
    Acker, Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream, ExchangeKind,
    QueueOptions, Result,
};
use crate::config::AmqpConfig;
use crate::utils::bootstrap::connect_with_retry;

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// RabbitMQ broker backed by a connection pool.
pub struct AmqpBroker {
    pool: Pool,
}

impl AmqpBroker {
    /// Create the pool and verify the broker is reachable.
    pub async fn new(config: &AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        connect_with_retry("rabbitmq", &config.url, || async {
            pool.get()
                .await
                .map(|_| ())
                .map_err(|e: PoolError| BrokerError::Connection(e.to_string()))
        })
        .await?;

        info!(url = %config.url, "Connected to AMQP");

        Ok(Self { pool })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BrokerError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to enable confirms: {}", e)))?;

        Ok(Arc::new(AmqpChannel {
            channel,
            closed: AtomicBool::new(false),
        }))
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    channel: Channel,
    closed: AtomicBool,
}

fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(expires) = options.expires {
        let millis = u32::try_from(expires.as_millis()).unwrap_or(u32::MAX);
        arguments.insert("x-expires".into(), AMQPValue::LongUInt(millis));
    }
    arguments
}

/// Map a publisher confirmation onto the publish outcome.
fn check_confirmation(confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(BrokerError::Publish(
            "Broker refused the message".to_string(),
        )),
        Confirmation::NotRequested => Err(BrokerError::Publish(
            "Channel is not in confirm mode".to_string(),
        )),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                queue_arguments(&options),
            )
            .await
            .map_err(|e| BrokerError::Declare(format!("Failed to declare queue: {}", e)))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };

        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare(format!("Failed to declare exchange: {}", e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare(format!("Failed to bind queue: {}", e)))
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Declare(format!("Failed to delete queue: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(content_type.into())
            .with_delivery_mode(PERSISTENT);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;
        check_confirmation(confirmation)?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to set prefetch: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(into_delivery)
                    .map_err(|e| BrokerError::Consume(format!("Consumer delivery error: {}", e)))
            })
            .boxed())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to get message: {}", e)))?;

        Ok(message.map(|m| into_delivery(m.delivery)))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) || !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to close channel: {}", e)))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery::new(
        delivery.delivery_tag,
        delivery.redelivered,
        delivery.data,
        Arc::new(AmqpAcker(delivery.acker)),
    )
}

struct AmqpAcker(LapinAcker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(format!("Failed to ack message: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Ack(format!("Failed to nack message: {}", e)))
    }
}
