//! Messenger: publisher and listener factory for one peer.
//!
//! A `Messenger` is constructed once per process with a broker handle and
//! the peer's identity. Every publish and every subscription opens its own
//! short-lived channel, so unrelated operations never share one.

mod listener;

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::broker::{self, close_quietly, Broker, BrokerChannel, BrokerError};
use crate::config::{DeliveryMode, ListenerConfig};
use crate::envelope::{self, Checksum, Envelope, Headers, Payload, PeerId, CONTENT_TYPE};
use crate::error::Result;
use crate::topology::{response_queue_name, Destination, Topology};
use crate::utils::retry::publish_backoff;

pub use listener::{CancelHandle, Incoming, Subscription};

/// Publishes envelopes and opens listeners on behalf of one peer.
pub struct Messenger {
    broker: Arc<dyn Broker>,
    identity: PeerId,
    topology: Topology,
    listener: ListenerConfig,
}

impl Messenger {
    pub fn new(
        broker: Arc<dyn Broker>,
        identity: PeerId,
        listener: &ListenerConfig,
        topology: Topology,
    ) -> Self {
        debug!(identity = %identity, mode = ?listener.mode, "Messenger created");
        Self {
            broker,
            identity,
            topology,
            listener: listener.clone(),
        }
    }

    /// This peer's identity, stamped as `uuid` on every envelope it sends.
    pub fn identity(&self) -> &PeerId {
        &self.identity
    }

    pub fn listener_config(&self) -> &ListenerConfig {
        &self.listener
    }

    // ------------------------------------------------------------------
    // Publisher
    // ------------------------------------------------------------------

    /// Seal `payload` and publish it to `destination`.
    ///
    /// The checksum is computed once, locally, so retried publishes carry
    /// identical bytes. Consumers must tolerate the resulting duplicates.
    pub async fn publish(
        &self,
        destination: &Destination,
        headers: &Headers,
        payload: Payload,
    ) -> Result<Checksum> {
        let (checksum, body) = envelope::seal(&self.identity, headers, payload)?;
        self.publish_sealed(destination, &checksum, &body).await?;
        Ok(checksum)
    }

    /// Publish a received envelope again, unchanged, to the tail of
    /// `destination`.
    ///
    /// The canonical encoding reproduces the sender's checksum, so replies
    /// still correlate with the original.
    pub async fn republish(
        &self,
        destination: &Destination,
        envelope: &Envelope,
    ) -> Result<Checksum> {
        let (checksum, body) = envelope::encode(envelope.fields().clone())?;
        self.publish_sealed(destination, &checksum, &body).await?;
        Ok(checksum)
    }

    #[tracing::instrument(name = "messenger.publish", skip_all, fields(destination = %destination))]
    async fn publish_sealed(
        &self,
        destination: &Destination,
        checksum: &Checksum,
        body: &[u8],
    ) -> Result<()> {
        let retries = self.listener.publish_retries;
        let backoff = publish_backoff(retries).build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.publish_once(destination, body).await {
                Ok(()) => {
                    debug!(checksum = %checksum, "Published envelope");
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = retries,
                        error = %e,
                        "Failed to publish, retrying..."
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| BrokerError::Publish("publish not attempted".to_string()))
            .into())
    }

    /// One publish on a fresh channel, closed on every path.
    async fn publish_once(&self, destination: &Destination, body: &[u8]) -> broker::Result<()> {
        let channel = self.broker.open_channel().await?;
        let result = async {
            let binding = self.topology.ensure(channel.as_ref(), destination).await?;
            channel
                .publish(&binding.exchange, &binding.routing_key, body, CONTENT_TYPE)
                .await
        }
        .await;
        close_quietly(channel.as_ref()).await;
        result
    }

    /// Publish a command to the shared command queue.
    pub async fn publish_command(&self, command: &str, payload: Payload) -> Result<Checksum> {
        self.publish(&Destination::Command, &Headers::command(command), payload)
            .await
    }

    /// Publish a reply to `owner`'s response queue for `checksum`.
    ///
    /// The reply names the message it answers through `requested_checksum`.
    pub async fn publish_response(
        &self,
        owner: &PeerId,
        checksum: &Checksum,
        payload: Payload,
    ) -> Result<Checksum> {
        self.publish(
            &Destination::response(owner, checksum),
            &Headers::reply_to(checksum),
            payload,
        )
        .await
    }

    /// Broadcast statistics to every status listener.
    pub async fn publish_stats(&self, payload: Payload) -> Result<Checksum> {
        self.publish(&Destination::Status, &Headers::default(), payload)
            .await
    }

    /// Announce this peer on the status exchange with its host facts.
    pub async fn publish_online(&self) -> Result<Checksum> {
        let checksum = self.publish_stats(host_facts()).await?;
        info!(identity = %self.identity, "Announced online");
        Ok(checksum)
    }

    // ------------------------------------------------------------------
    // Listener
    // ------------------------------------------------------------------

    /// Open a subscription on `destination`.
    pub async fn subscribe(&self, destination: &Destination) -> Result<Subscription> {
        self.subscribe_with(destination, CancelHandle::new()).await
    }

    /// Open a subscription cancelled together with `scope`.
    pub async fn subscribe_within(
        &self,
        destination: &Destination,
        scope: &CancelHandle,
    ) -> Result<Subscription> {
        self.subscribe_with(destination, scope.child()).await
    }

    async fn subscribe_with(
        &self,
        destination: &Destination,
        cancel: CancelHandle,
    ) -> Result<Subscription> {
        let channel = self.broker.open_channel().await?;

        let (queue, inner) = match self.open(channel.as_ref(), destination, &cancel).await {
            Ok(opened) => opened,
            Err(e) => {
                close_quietly(channel.as_ref()).await;
                return Err(e.into());
            }
        };

        let inner = match inner {
            Some(deliveries) => listener::push(deliveries, queue.clone(), cancel.token()),
            None => listener::poll(
                Arc::clone(&channel),
                queue.clone(),
                self.listener.poll_interval(),
                cancel.token(),
            ),
        };

        debug!(queue = %queue, mode = ?self.listener.mode, "Listening");
        Ok(Subscription::new(
            queue,
            destination.clone(),
            channel,
            cancel,
            inner,
        ))
    }

    /// Declare the inbox, limit prefetch, and start a consumer in push mode.
    async fn open(
        &self,
        channel: &dyn BrokerChannel,
        destination: &Destination,
        cancel: &CancelHandle,
    ) -> broker::Result<(String, Option<broker::DeliveryStream>)> {
        if cancel.is_cancelled() {
            return Err(BrokerError::ChannelClosed);
        }

        let queue = self
            .topology
            .ensure_inbox(channel, destination, &self.identity)
            .await?;

        // One unsettled message at a time per consumer.
        channel.set_prefetch(1).await?;

        match self.listener.mode {
            DeliveryMode::Push => {
                let consumer_tag = format!("{}-{}", self.identity, uuid::Uuid::new_v4());
                let deliveries = channel.consume(&queue, &consumer_tag).await?;
                Ok((queue, Some(deliveries)))
            }
            DeliveryMode::Poll => Ok((queue, None)),
        }
    }

    /// Listen on the shared command queue.
    pub async fn get_command_listener(&self) -> Result<Subscription> {
        debug!("Listens to commands");
        self.subscribe(&Destination::Command).await
    }

    /// Listen for replies to `checksum` on this peer's response queue.
    pub async fn get_response_listener(&self, checksum: &Checksum) -> Result<Subscription> {
        debug!(checksum = %checksum, "Listens to responses");
        self.subscribe(&Destination::response(&self.identity, checksum))
            .await
    }

    /// Delete this peer's response queue for `checksum` once its exchange
    /// is over.
    pub async fn discard_response_queue(&self, checksum: &Checksum) -> Result<()> {
        let name = response_queue_name(&self.identity, checksum);
        let channel = self.broker.open_channel().await?;
        let result = channel.delete_queue(&name).await;
        close_quietly(channel.as_ref()).await;
        debug!(queue = %name, "Discarded response queue");
        Ok(result?)
    }

    /// Listen on this peer's private status inbox.
    pub async fn get_status_listener(&self) -> Result<Subscription> {
        debug!("Listens to status");
        self.subscribe(&Destination::Status).await
    }
}

/// Facts about this host announced by [`Messenger::publish_online`].
pub fn host_facts() -> Payload {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();

    let mut facts = Payload::new();
    facts.insert("os".to_string(), Value::from(std::env::consts::OS));
    facts.insert("arch".to_string(), Value::from(std::env::consts::ARCH));
    facts.insert("hostname".to_string(), Value::from(hostname));
    facts.insert("version".to_string(), Value::from(env!("CARGO_PKG_VERSION")));
    facts
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::topology::COMMAND_QUEUE;
    use futures::StreamExt;
    use serde_json::json;

    fn messenger(broker: &MemoryBroker, id: &str, mode: DeliveryMode) -> Messenger {
        let listener = ListenerConfig {
            mode,
            poll_interval_ms: 5,
            ..Default::default()
        };
        Messenger::new(
            Arc::new(broker.clone()),
            PeerId::new(id),
            &listener,
            Topology::default(),
        )
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_publish_command_is_received() {
        let broker = MemoryBroker::new();
        let agent = messenger(&broker, "agent", DeliveryMode::Push);
        let api = messenger(&broker, "api", DeliveryMode::Push);

        let mut commands = agent.get_command_listener().await.unwrap();
        let checksum = api
            .publish_command("machine-requested", payload(json!({ "name": "vm1" })))
            .await
            .unwrap();

        let incoming = commands.next().await.unwrap().unwrap();
        let envelope = incoming.ack().await.unwrap();
        assert_eq!(envelope.checksum(), checksum);
        assert_eq!(envelope.command(), Some("machine-requested"));
        assert_eq!(envelope.uuid(), PeerId::new("api"));
        assert_eq!(broker.queue_depth(COMMAND_QUEUE), Some(0));
    }

    #[tokio::test]
    async fn test_publish_closes_its_channel() {
        let broker = MemoryBroker::new();
        let api = messenger(&broker, "api", DeliveryMode::Push);

        api.publish_stats(payload(json!({ "load": 1 }))).await.unwrap();
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_response_reaches_owner_before_listening() {
        let broker = MemoryBroker::new();
        let api = messenger(&broker, "api", DeliveryMode::Poll);
        let agent = messenger(&broker, "agent", DeliveryMode::Poll);
        let request = Checksum::new("c0");

        // Publishing declares the queue, so the reply waits for its owner.
        agent
            .publish_response(api.identity(), &request, payload(json!({ "ok": true })))
            .await
            .unwrap();
        assert_eq!(
            broker.queue_depth(&response_queue_name(api.identity(), &request)),
            Some(1)
        );

        let mut responses = api.get_response_listener(&request).await.unwrap();
        let incoming = responses.next().await.unwrap().unwrap();
        assert_eq!(incoming.envelope().requested_checksum(), Some(request.clone()));
        incoming.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_response_queue() {
        let broker = MemoryBroker::new();
        let api = messenger(&broker, "api", DeliveryMode::Poll);
        let request = Checksum::new("c0");
        let queue = response_queue_name(api.identity(), &request);

        let responses = api.get_response_listener(&request).await.unwrap();
        responses.cancel();
        api.discard_response_queue(&request).await.unwrap();
        assert!(!broker.queue_exists(&queue));

        // Discarding twice is harmless.
        api.discard_response_queue(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reaches_every_listener() {
        let broker = MemoryBroker::new();
        let a = messenger(&broker, "a", DeliveryMode::Push);
        let b = messenger(&broker, "b", DeliveryMode::Push);

        let mut a_status = a.get_status_listener().await.unwrap();
        let mut b_status = b.get_status_listener().await.unwrap();
        let checksum = a.publish_online().await.unwrap();

        for status in [&mut a_status, &mut b_status] {
            let incoming = status.next().await.unwrap().unwrap();
            assert_eq!(incoming.envelope().checksum(), checksum);
            assert_eq!(
                incoming.envelope().get("os"),
                Some(&Value::from(std::env::consts::OS))
            );
            incoming.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancel_releases_channel() {
        let broker = MemoryBroker::new();
        let agent = messenger(&broker, "agent", DeliveryMode::Push);

        let mut status = agent.get_status_listener().await.unwrap();
        assert_eq!(broker.open_channel_count(), 1);

        status.cancel();
        status.cancel();
        assert!(status.next().await.is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.open_channel_count(), 0);
        assert!(!broker.queue_exists("clique-status-agent"));
    }

    #[tokio::test]
    async fn test_scoped_subscription_follows_scope() {
        let broker = MemoryBroker::new();
        let agent = messenger(&broker, "agent", DeliveryMode::Poll);
        let scope = CancelHandle::new();

        let mut commands = agent
            .subscribe_within(&Destination::Command, &scope)
            .await
            .unwrap();
        scope.cancel();
        assert!(commands.next().await.is_none());
        assert!(commands.is_cancelled());
    }

    #[tokio::test]
    async fn test_subscribe_within_cancelled_scope_fails() {
        let broker = MemoryBroker::new();
        let agent = messenger(&broker, "agent", DeliveryMode::Push);
        let scope = CancelHandle::new();
        scope.cancel();

        assert!(agent
            .subscribe_within(&Destination::Command, &scope)
            .await
            .is_err());
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[test]
    fn test_host_facts() {
        let facts = host_facts();
        for key in ["os", "arch", "hostname", "version"] {
            assert!(facts.contains_key(key), "missing {}", key);
        }
    }
}
