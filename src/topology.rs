//! Queue and exchange topology.
//!
//! Three destinations, each with a fixed naming rule:
//! - command queue: one durable, well-known queue shared by competing agents
//! - response queue: `clique-response-<owner>-<checksum>`, declared by
//!   whichever peer needs it first
//! - status exchange: one fanout exchange; every listener binds its own
//!   exclusive `clique-status-<peer>` inbox to it
//!
//! Declarations are idempotent broker operations, so `ensure` may be called
//! before every publish and subscription.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::broker::{BrokerChannel, ExchangeKind, QueueOptions, Result};
use crate::envelope::{Checksum, PeerId};

/// Queue name for commands.
pub const COMMAND_QUEUE: &str = "clique-command";
/// Exchange name for status broadcasts.
pub const STATUS_EXCHANGE: &str = "clique-status";

const RESPONSE_QUEUE_PREFIX: &str = "clique-response";
const STATUS_QUEUE_PREFIX: &str = "clique-status";

/// Where a message is published or consumed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Shared work queue; each message reaches one consumer.
    Command,
    /// Per-correlation reply queue owned by `owner`.
    Response { owner: PeerId, checksum: Checksum },
    /// Fanout exchange; each listener receives every message.
    Status,
}

impl Destination {
    pub fn response(owner: &PeerId, checksum: &Checksum) -> Self {
        Self::Response {
            owner: owner.clone(),
            checksum: checksum.clone(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => f.write_str(COMMAND_QUEUE),
            Self::Response { owner, checksum } => {
                f.write_str(&response_queue_name(owner, checksum))
            }
            Self::Status => f.write_str(STATUS_EXCHANGE),
        }
    }
}

/// Publish coordinates for a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Exchange to publish to; empty for the default exchange.
    pub exchange: String,
    /// Routing key; the queue name on the default exchange.
    pub routing_key: String,
}

/// Response queue name for an owner and correlation checksum.
pub fn response_queue_name(owner: &PeerId, checksum: &Checksum) -> String {
    format!("{}-{}-{}", RESPONSE_QUEUE_PREFIX, owner, checksum)
}

/// Private status inbox for a peer.
pub fn status_queue_name(peer: &PeerId) -> String {
    format!("{}-{}", STATUS_QUEUE_PREFIX, peer)
}

/// Declares destinations on a channel.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    response_expiry: Option<Duration>,
}

impl Topology {
    /// Response queues unused for `response_expiry` are removed by the broker.
    pub fn new(response_expiry: Option<Duration>) -> Self {
        Self { response_expiry }
    }

    /// Declare what publishing to `destination` needs.
    pub async fn ensure(
        &self,
        channel: &dyn BrokerChannel,
        destination: &Destination,
    ) -> Result<Binding> {
        match destination {
            Destination::Command => {
                channel
                    .declare_queue(COMMAND_QUEUE, QueueOptions::durable())
                    .await?;
                Ok(Binding {
                    exchange: String::new(),
                    routing_key: COMMAND_QUEUE.to_string(),
                })
            }
            Destination::Response { owner, checksum } => {
                let name = response_queue_name(owner, checksum);
                debug!(queue = %name, "Declaring response queue");
                channel
                    .declare_queue(&name, QueueOptions::transient(self.response_expiry))
                    .await?;
                Ok(Binding {
                    exchange: String::new(),
                    routing_key: name,
                })
            }
            Destination::Status => {
                debug!(exchange = %STATUS_EXCHANGE, "Declaring status exchange");
                channel
                    .declare_exchange(STATUS_EXCHANGE, ExchangeKind::Fanout)
                    .await?;
                Ok(Binding {
                    exchange: STATUS_EXCHANGE.to_string(),
                    routing_key: String::new(),
                })
            }
        }
    }

    /// Declare what listening on `destination` as `listener` needs and
    /// return the queue to consume from.
    pub async fn ensure_inbox(
        &self,
        channel: &dyn BrokerChannel,
        destination: &Destination,
        listener: &PeerId,
    ) -> Result<String> {
        let binding = self.ensure(channel, destination).await?;
        match destination {
            Destination::Status => {
                let name = status_queue_name(listener);
                debug!(queue = %name, "Declaring status queue");
                let queue = channel
                    .declare_queue(&name, QueueOptions::exclusive())
                    .await?;
                channel
                    .bind_queue(&queue, &binding.exchange, &binding.routing_key)
                    .await?;
                Ok(queue)
            }
            _ => Ok(binding.routing_key),
        }
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};

    #[test]
    fn test_response_queue_name() {
        let owner = PeerId::new("peer-1");
        let checksum = Checksum::new("abc123");
        assert_eq!(
            response_queue_name(&owner, &checksum),
            "clique-response-peer-1-abc123"
        );
        assert_eq!(
            Destination::response(&owner, &checksum).to_string(),
            "clique-response-peer-1-abc123"
        );
    }

    #[test]
    fn test_status_queue_name() {
        assert_eq!(
            status_queue_name(&PeerId::new("peer-1")),
            "clique-status-peer-1"
        );
    }

    #[tokio::test]
    async fn test_ensure_command_is_idempotent() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        let topology = Topology::default();

        let first = topology
            .ensure(channel.as_ref(), &Destination::Command)
            .await
            .unwrap();
        let second = topology
            .ensure(channel.as_ref(), &Destination::Command)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.exchange, "");
        assert_eq!(first.routing_key, COMMAND_QUEUE);
        assert!(broker.queue_exists(COMMAND_QUEUE));
    }

    #[tokio::test]
    async fn test_response_queue_declared_by_both_sides() {
        let broker = MemoryBroker::new();
        let requester = broker.open_channel().await.unwrap();
        let responder = broker.open_channel().await.unwrap();
        let topology = Topology::new(Some(Duration::from_secs(60)));
        let api = PeerId::new("api");
        let destination = Destination::response(&api, &Checksum::new("c0"));

        let (a, b) = tokio::join!(
            topology.ensure_inbox(requester.as_ref(), &destination, &api),
            topology.ensure(responder.as_ref(), &destination),
        );

        assert_eq!(a.unwrap(), b.unwrap().routing_key);
        assert!(broker.queue_exists("clique-response-api-c0"));
    }

    #[tokio::test]
    async fn test_status_inbox_binds_private_queue() {
        let broker = MemoryBroker::new();
        let listener = broker.open_channel().await.unwrap();
        let publisher = broker.open_channel().await.unwrap();
        let topology = Topology::default();

        let inbox = topology
            .ensure_inbox(listener.as_ref(), &Destination::Status, &PeerId::new("agent"))
            .await
            .unwrap();
        assert_eq!(inbox, "clique-status-agent");

        let binding = topology
            .ensure(publisher.as_ref(), &Destination::Status)
            .await
            .unwrap();
        assert_eq!(binding.exchange, STATUS_EXCHANGE);

        publisher
            .publish(&binding.exchange, &binding.routing_key, b"{}", "")
            .await
            .unwrap();
        assert_eq!(broker.queue_depth(&inbox), Some(1));
    }
}
