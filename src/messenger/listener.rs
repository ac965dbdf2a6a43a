//! Listener: cancellable envelope streams over a broker queue.
//!
//! A [`Subscription`] owns one broker channel and yields [`Incoming`]
//! envelopes until it is cancelled or the channel fails. Two delivery
//! disciplines share the same contract of at most one unsettled message:
//! - push: the broker delivers under a prefetch limit of one
//! - poll: a non-blocking fetch on every tick, holding further fetches
//!   until the previous message is settled

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::{close_quietly, BrokerChannel, Delivery, DeliveryStream};
use crate::envelope::{self, Envelope};
use crate::error::{Error, Result};
use crate::topology::Destination;

/// Cancels a subscription, or a tree of them.
///
/// Cloning yields another handle on the same cancellation. Cancelling is
/// idempotent and safe from any task, including inside a delivery handler.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A handle cancelled together with this one, but cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// A received envelope awaiting settlement.
///
/// Settle with [`Incoming::ack`] or [`Incoming::nack`]. An incoming dropped
/// unsettled is returned to its queue.
pub struct Incoming {
    envelope: Envelope,
    delivery: Option<Delivery>,
    settled: Option<oneshot::Sender<()>>,
}

impl Incoming {
    fn new(envelope: Envelope, delivery: Delivery) -> Self {
        Self {
            envelope,
            delivery: Some(delivery),
            settled: None,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.delivery.as_ref().is_some_and(|d| d.redelivered)
    }

    /// Accept the message, removing it from its queue.
    pub async fn ack(mut self) -> Result<Envelope> {
        let result = match self.delivery.take() {
            Some(delivery) => delivery.ack().await,
            None => Ok(()),
        };
        self.signal();
        result?;
        Ok(self.envelope.clone())
    }

    /// Refuse the message; with `requeue` it is redelivered later.
    pub async fn nack(mut self, requeue: bool) -> Result<()> {
        let result = match self.delivery.take() {
            Some(delivery) => delivery.nack(requeue).await,
            None => Ok(()),
        };
        self.signal();
        Ok(result?)
    }

    fn signal(&mut self) {
        if let Some(settled) = self.settled.take() {
            let _ = settled.send(());
        }
    }
}

impl Drop for Incoming {
    fn drop(&mut self) {
        if let Some(delivery) = self.delivery.take() {
            debug!(
                checksum = %self.envelope.checksum(),
                "Incoming dropped unsettled, requeueing"
            );
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = delivery.nack(true).await {
                        debug!(error = %e, "Requeue of dropped delivery failed");
                    }
                });
            }
        }
        self.signal();
    }
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming")
            .field("envelope", &self.envelope)
            .field("settled", &self.delivery.is_none())
            .finish()
    }
}

/// A live binding of a listener to a destination.
///
/// Yields envelopes in broker delivery order. The stream ends once
/// cancelled; a channel failure yields one error and then ends. Dropping
/// the subscription cancels it.
pub struct Subscription {
    queue: String,
    destination: Destination,
    cancel: CancelHandle,
    inner: BoxStream<'static, Result<Incoming>>,
}

impl Subscription {
    pub(crate) fn new(
        queue: String,
        destination: Destination,
        channel: Arc<dyn BrokerChannel>,
        cancel: CancelHandle,
        inner: BoxStream<'static, Result<Incoming>>,
    ) -> Self {
        // Release the channel once cancelled, whoever cancels.
        let token = cancel.token();
        let queue_name = queue.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            debug!(queue = %queue_name, "Subscription cancelled");
            close_quietly(channel.as_ref()).await;
        });

        Self {
            queue,
            destination,
            cancel,
            inner,
        }
    }

    /// Queue this subscription consumes from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Stop delivery and release the channel. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A handle that cancels this subscription from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl Stream for Subscription {
    type Item = Result<Incoming>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("destination", &self.destination)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Decode a delivery, rejecting it when malformed.
async fn admit(delivery: Delivery, queue: &str) -> Option<Incoming> {
    match envelope::decode(&delivery.data) {
        Ok(envelope) => Some(Incoming::new(envelope, delivery)),
        Err(e) => {
            warn!(queue = %queue, error = %e, "Rejecting malformed message");
            if let Err(e) = delivery.nack(false).await {
                error!(queue = %queue, error = %e, "Failed to reject malformed message");
            }
            None
        }
    }
}

struct PushState {
    deliveries: DeliveryStream,
    queue: String,
    token: CancellationToken,
    done: bool,
}

/// Envelopes pushed by a broker consumer.
pub(crate) fn push(
    deliveries: DeliveryStream,
    queue: String,
    token: CancellationToken,
) -> BoxStream<'static, Result<Incoming>> {
    let state = PushState {
        deliveries,
        queue,
        token,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            let next = tokio::select! {
                biased;
                _ = st.token.cancelled() => return None,
                next = st.deliveries.next() => next,
            };

            match next {
                None => return None,
                Some(Err(_)) if st.token.is_cancelled() => return None,
                Some(Err(e)) => {
                    error!(queue = %st.queue, error = %e, "Consumer failed");
                    st.done = true;
                    return Some((Err(Error::from(e)), st));
                }
                Some(Ok(delivery)) => {
                    if let Some(incoming) = admit(delivery, &st.queue).await {
                        return Some((Ok(incoming), st));
                    }
                }
            }
        }
    })
    .boxed()
}

struct PollState {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    token: CancellationToken,
    interval: tokio::time::Interval,
    settled: Option<oneshot::Receiver<()>>,
    done: bool,
}

/// Envelopes fetched on a fixed interval.
pub(crate) fn poll(
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    period: Duration,
    token: CancellationToken,
) -> BoxStream<'static, Result<Incoming>> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = PollState {
        channel,
        queue,
        token,
        interval,
        settled: None,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }

        // Hold the next fetch until the previous message is settled.
        if let Some(settled) = st.settled.take() {
            tokio::select! {
                biased;
                _ = st.token.cancelled() => return None,
                _ = settled => {}
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = st.token.cancelled() => return None,
                _ = st.interval.tick() => {}
            }

            match st.channel.get(&st.queue).await {
                Ok(None) => continue,
                Err(_) if st.token.is_cancelled() => return None,
                Err(e) => {
                    error!(queue = %st.queue, error = %e, "Fetch failed");
                    st.done = true;
                    return Some((Err(Error::from(e)), st));
                }
                Ok(Some(delivery)) => {
                    if let Some(mut incoming) = admit(delivery, &st.queue).await {
                        let (tx, rx) = oneshot::channel();
                        incoming.settled = Some(tx);
                        st.settled = Some(rx);
                        return Some((Ok(incoming), st));
                    }
                }
            }
        }
    })
    .boxed()
}
