//! Responder side of the exchange.
//!
//! Competing responders share the command queue; the broker's prefetch of
//! one hands each request to a single responder, which is the only claim
//! arbitration there is. Requests a responder does not take are republished
//! to the tail of the queue, never requeued at its head.

use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tracing::{debug, error, info, warn};

use super::{BoxError, Connector, PendingExchange};
use crate::envelope::{Checksum, Envelope, Payload};
use crate::error::{Error, Result, Stage};
use crate::messenger::{CancelHandle, Incoming, Subscription};
use crate::topology::Destination;
use crate::utils::retry::reconnect_backoff;

/// Completed requests remembered for duplicate suppression.
const RECENT_REQUESTS: usize = 1024;

/// Application logic answering one command kind.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Whether this responder takes the request. A declined request goes back
    /// to the tail of the queue for another responder.
    async fn accept(&self, _request: &Payload) -> bool {
        true
    }

    /// Do the work and return the result payload.
    async fn handle(&self, request: Payload) -> std::result::Result<Payload, BoxError>;
}

/// What happened to one claimed request.
#[derive(Debug)]
pub enum ServeOutcome {
    /// The result was published to the requester.
    Completed { request: Checksum, result: Payload },
    /// The request was consumed without a published result, or the listener
    /// failed (`request` is `None`).
    Failed {
        request: Option<Checksum>,
        error: Error,
    },
}

/// A running responder.
///
/// Yields one outcome per claimed request until cancelled. Broker failures
/// are yielded as [`ServeOutcome::Failed`] and the listener is reopened with
/// backoff. Requests are only taken while the stream is polled. Dropping it
/// cancels.
pub struct Serving {
    cancel: CancelHandle,
    outcomes: BoxStream<'static, ServeOutcome>,
}

impl Serving {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Stream for Serving {
    type Item = ServeOutcome;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.outcomes.poll_next_unpin(cx)
    }
}

impl Drop for Serving {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Bounded memory of request checksums already handled.
struct RecentRequests {
    order: VecDeque<Checksum>,
    seen: HashSet<Checksum>,
    capacity: usize,
}

impl RecentRequests {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, checksum: &Checksum) -> bool {
        self.seen.contains(checksum)
    }

    fn insert(&mut self, checksum: Checksum) {
        if !self.seen.insert(checksum.clone()) {
            return;
        }
        self.order.push_back(checksum);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}

impl Connector {
    /// Answer `command` requests with `handler` until the returned
    /// [`Serving`] is cancelled or dropped.
    ///
    /// The command listener is open when this returns.
    pub async fn serve<H>(&self, command: &str, handler: Arc<H>) -> Result<Serving>
    where
        H: RequestHandler + ?Sized + 'static,
    {
        let scope = CancelHandle::new();
        let subscription = self
            .messenger
            .subscribe_within(&Destination::Command, &scope)
            .await?;
        info!(command = %command, queue = %subscription.queue(), "Serving requests");

        let state = ServeState {
            connector: self.clone(),
            command: command.to_string(),
            handler,
            subscription: Some(subscription),
            scope: scope.clone(),
            reconnect: reconnect_backoff().build(),
            recent: RecentRequests::new(RECENT_REQUESTS),
        };

        let outcomes = stream::unfold(state, |mut st| async move {
            let outcome = st.next_outcome().await?;
            Some((outcome, st))
        })
        .boxed();

        Ok(Serving {
            cancel: scope,
            outcomes,
        })
    }

    /// Claim, confirm, handle, and answer one request.
    async fn fulfil<H>(&self, request: &Envelope, payload: Payload, handler: &H) -> Result<Payload>
    where
        H: RequestHandler + ?Sized,
    {
        let ack = self
            .messenger
            .publish_response(&request.uuid(), &request.checksum(), Payload::new())
            .await?;
        debug!(request = %request.checksum(), ack = %ack, "Claimed request");

        let pending = PendingExchange::new(ack, self.exchange.confirm_timeout(), 0);
        let confirmation = self
            .await_reply(&pending, Stage::AwaitingConfirmation)
            .await?;
        debug!(request = %request.checksum(), "Claim confirmed");

        let result = handler
            .handle(payload)
            .await
            .map_err(|e| Error::Handler(e.to_string()))?;

        self.messenger
            .publish_response(
                &confirmation.uuid(),
                &confirmation.checksum(),
                result.clone(),
            )
            .await?;
        Ok(result)
    }
}

struct ServeState<H: ?Sized> {
    connector: Connector,
    command: String,
    handler: Arc<H>,
    subscription: Option<Subscription>,
    scope: CancelHandle,
    reconnect: ExponentialBackoff,
    recent: RecentRequests,
}

impl<H> ServeState<H>
where
    H: RequestHandler + ?Sized,
{
    async fn next_outcome(&mut self) -> Option<ServeOutcome> {
        loop {
            if self.scope.is_cancelled() {
                return None;
            }

            let Some(subscription) = self.subscription.as_mut() else {
                self.reopen().await;
                continue;
            };

            let next = tokio::select! {
                biased;
                _ = self.scope.cancelled() => return None,
                next = subscription.next() => next,
            };

            match next {
                Some(Ok(incoming)) => {
                    if let Some(outcome) = self.take(incoming).await {
                        return Some(outcome);
                    }
                }
                Some(Err(e)) => {
                    error!(command = %self.command, error = %e, "Command listener failed");
                    self.close_subscription();
                    return Some(ServeOutcome::Failed {
                        request: None,
                        error: e,
                    });
                }
                None => {
                    if !self.scope.is_cancelled() {
                        warn!(command = %self.command, "Command listener ended");
                    }
                    self.close_subscription();
                }
            }
        }
    }

    fn close_subscription(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }

    /// Reopen the command listener after a backoff delay.
    async fn reopen(&mut self) {
        let delay = self.reconnect.next().unwrap_or(Duration::from_secs(30));
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        match self
            .connector
            .messenger
            .subscribe_within(&Destination::Command, &self.scope)
            .await
        {
            Ok(subscription) => {
                info!(command = %self.command, "Command listener reopened");
                self.reconnect = reconnect_backoff().build();
                self.subscription = Some(subscription);
            }
            Err(e) => {
                error!(
                    error = %e,
                    backoff_ms = %delay.as_millis(),
                    command = %self.command,
                    "Failed to reopen command listener, retrying after backoff"
                );
            }
        }
    }

    /// Decide on one delivery. `None` when it was passed on or skipped.
    async fn take(&mut self, incoming: Incoming) -> Option<ServeOutcome> {
        let envelope = incoming.envelope().clone();
        let request = envelope.checksum();

        if envelope.command() != Some(self.command.as_str()) {
            debug!(
                checksum = %request,
                command = ?envelope.command(),
                "Passing on request for another command"
            );
            self.pass(incoming).await;
            return None;
        }

        if self.recent.contains(&request) {
            debug!(checksum = %request, "Dropping duplicate request");
            if let Err(e) = incoming.ack().await {
                error!(checksum = %request, error = %e, "Failed to acknowledge duplicate");
            }
            return None;
        }

        let payload = envelope.payload();
        if !self.handler.accept(&payload).await {
            debug!(checksum = %request, "Declined request");
            self.pass(incoming).await;
            return None;
        }

        let result = self
            .connector
            .fulfil(&envelope, payload, self.handler.as_ref())
            .await;

        // The request is consumed even on failure: it has been claimed.
        if let Err(e) = incoming.ack().await {
            error!(checksum = %request, error = %e, "Failed to acknowledge request");
        }
        self.recent.insert(request.clone());

        Some(match result {
            Ok(result) => {
                info!(command = %self.command, checksum = %request, "Request fulfilled");
                ServeOutcome::Completed { request, result }
            }
            Err(error) => {
                error!(
                    command = %self.command,
                    checksum = %request,
                    error = %error,
                    "Failed to fulfil request"
                );
                ServeOutcome::Failed {
                    request: Some(request),
                    error,
                }
            }
        })
    }

    /// Hand a request on to the other responders and pause before taking
    /// the next one.
    ///
    /// The request is republished to the tail of the command queue before
    /// its delivery is acknowledged, so requests queued behind it are not
    /// held up. When republishing fails it is requeued instead.
    async fn pass(&mut self, incoming: Incoming) {
        let messenger = &self.connector.messenger;
        let request = incoming.envelope().checksum();

        match messenger
            .republish(&Destination::Command, incoming.envelope())
            .await
        {
            Ok(_) => {
                if let Err(e) = incoming.ack().await {
                    error!(
                        checksum = %request,
                        error = %e,
                        "Failed to acknowledge passed request"
                    );
                }
            }
            Err(e) => {
                warn!(
                    checksum = %request,
                    error = %e,
                    "Failed to republish request, requeueing"
                );
                if let Err(e) = incoming.nack(true).await {
                    error!(checksum = %request, error = %e, "Failed to requeue request");
                }
            }
        }

        let delay = messenger.listener_config().requeue_delay();
        tokio::select! {
            _ = self.scope.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
