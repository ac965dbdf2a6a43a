//! Correlator: request/response exchanges over the messenger.
//!
//! Requester side (`request`, `create_machine`):
//!
//! ```text
//! Requesting ──publish c0──▶ AwaitingAck ──reply to c0 (c1)──▶ Confirming
//!     ▲                          │                                │ publish c2
//!     │ timeout / broker error   │                                ▼
//!     └──────────────────────────┴──────────────────────── AwaitingResult ──reply to c2──▶ Done
//! ```
//!
//! Responder side (`serve`, `wait_for_machines`): take a request from the
//! shared command queue, reply with a claim naming it, wait for the
//! requester's confirmation of that claim, run the handler, reply to the
//! confirmation with the result, and consume the request whatever happened.
//!
//! Every reply echoes the checksum of the message it answers in
//! `requested_checksum` and travels on the response queue keyed by the
//! recipient and that checksum.

mod machine;
mod requester;
mod responder;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tracing::debug;

use crate::broker::Broker;
use crate::config::{Config, ExchangeConfig};
use crate::envelope::{Checksum, Envelope, PeerId};
use crate::error::{Error, Result, Stage};
use crate::messenger::{Messenger, Subscription};
use crate::topology::Topology;

pub use machine::{Machine, MachineProvider, MachineRequest, MACHINE_REQUESTED};
pub use responder::{RequestHandler, ServeOutcome, Serving};

/// Boxed error returned by handlers and providers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Correlation state of one wait for a reply.
#[derive(Debug, Clone)]
pub struct PendingExchange {
    /// Checksum the awaited reply must echo.
    pub request: Checksum,
    /// When the wait gives up.
    pub deadline: Instant,
    /// Budget the deadline was derived from.
    pub timeout: Duration,
    /// Whole-exchange retries left after this attempt.
    pub retries_remaining: u32,
}

impl PendingExchange {
    pub fn new(request: Checksum, timeout: Duration, retries_remaining: u32) -> Self {
        Self {
            request,
            deadline: Instant::now() + timeout,
            timeout,
            retries_remaining,
        }
    }
}

/// Runs correlated exchanges for one peer.
///
/// Cheap to clone; clones share the messenger.
#[derive(Clone)]
pub struct Connector {
    messenger: Arc<Messenger>,
    exchange: ExchangeConfig,
}

impl Connector {
    pub fn new(messenger: Arc<Messenger>, exchange: &ExchangeConfig) -> Self {
        Self {
            messenger,
            exchange: exchange.clone(),
        }
    }

    /// Build the messenger and connector a process needs from configuration.
    pub fn from_config(broker: Arc<dyn Broker>, config: &Config) -> Self {
        let topology = Topology::new(config.broker.amqp.response_queue_ttl());
        let messenger = Messenger::new(broker, config.peer_id(), &config.listener, topology);
        Self::new(Arc::new(messenger), &config.exchange)
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn identity(&self) -> &PeerId {
        self.messenger.identity()
    }

    pub fn exchange_config(&self) -> &ExchangeConfig {
        &self.exchange
    }

    /// Wait on this peer's response queue for the reply to `pending.request`.
    ///
    /// The subscription is released on every exit path.
    async fn await_reply(&self, pending: &PendingExchange, stage: Stage) -> Result<Envelope> {
        let mut responses = self
            .messenger
            .get_response_listener(&pending.request)
            .await?;

        let reply =
            tokio::time::timeout_at(pending.deadline, next_reply(&mut responses, &pending.request))
                .await;
        responses.cancel();

        if let Err(e) = self
            .messenger
            .discard_response_queue(&pending.request)
            .await
        {
            debug!(checksum = %pending.request, error = %e, "Failed to discard response queue");
        }

        match reply {
            Ok(reply) => reply,
            Err(_) => Err(Error::Timeout {
                stage,
                after: pending.timeout,
            }),
        }
    }
}

/// First reply on `responses` that answers `expected`.
///
/// Replies to anything else are consumed and dropped.
async fn next_reply(responses: &mut Subscription, expected: &Checksum) -> Result<Envelope> {
    while let Some(incoming) = responses.next().await {
        let incoming = incoming?;
        if incoming.envelope().requested_checksum().as_ref() == Some(expected) {
            return incoming.ack().await;
        }
        debug!(
            expected = %expected,
            checksum = %incoming.envelope().checksum(),
            "Discarding unrelated reply"
        );
        incoming.ack().await?;
    }
    Err(Error::SubscriptionClosed)
}
