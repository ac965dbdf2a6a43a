//! In-process broker for standalone mode and tests.
//!
//! Reproduces the RabbitMQ semantics the connector depends on:
//! - the default exchange routes to the queue named by the routing key
//! - fanout exchanges copy every message to every bound queue
//! - competing consumers on one queue each receive distinct messages
//! - a channel's prefetch limit caps its unacknowledged pushed deliveries
//! - nack with requeue returns a message to the head of its queue
//! - closing a channel requeues its unacknowledged deliveries and deletes
//!   the exclusive queues it declared
//! - a queue declared with an expiry is deleted once it has gone unused (no
//!   consumer, no declare, no get) for that long

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    Acker, Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream, ExchangeKind,
    QueueOptions, Result,
};

/// Counters for messages moving through the broker.
#[derive(Debug, Default)]
pub struct MemoryStats {
    /// Messages accepted for routing.
    pub published: AtomicU64,
    /// Messages published to no queue.
    pub unroutable: AtomicU64,
    /// Deliveries acknowledged.
    pub acked: AtomicU64,
    /// Deliveries returned to their queue.
    pub requeued: AtomicU64,
    /// Deliveries refused without requeue.
    pub rejected: AtomicU64,
}

impl MemoryStats {
    /// Snapshot as (published, acked, requeued, rejected).
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.published.load(Ordering::Relaxed),
            self.acked.load(Ordering::Relaxed),
            self.requeued.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

#[derive(Clone)]
struct Stored {
    data: Vec<u8>,
    redelivered: bool,
}

struct Queue {
    options: QueueOptions,
    owner: Option<u64>,
    messages: VecDeque<Stored>,
    /// Channels consuming from this queue.
    consumers: Vec<u64>,
    last_used: Instant,
}

impl Queue {
    fn new(options: QueueOptions, owner: Option<u64>) -> Self {
        Self {
            options,
            owner,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            last_used: Instant::now(),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.consumers.is_empty()
            && self
                .options
                .expires
                .is_some_and(|ttl| now.saturating_duration_since(self.last_used) >= ttl)
    }
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct ChannelState {
    prefetch: u16,
    pushed: usize,
    unacked: BTreeMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    message: Stored,
    pushed: bool,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    exchanges: HashMap<String, Exchange>,
    channels: HashMap<u64, ChannelState>,
    next_channel: u64,
    next_tag: u64,
}

impl State {
    /// Remove a queue and its bindings.
    fn remove_queue(&mut self, name: &str) -> bool {
        let removed = self.queues.remove(name).is_some();
        for ex in self.exchanges.values_mut() {
            ex.bindings.retain(|(queue, _)| queue != name);
        }
        removed
    }

    fn expire_queues(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.is_expired(now))
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            self.remove_queue(&name);
            debug!(queue = %name, "Memory queue expired");
        }
    }
}

struct Shared {
    state: Mutex<State>,
    changed: watch::Sender<u64>,
    stats: MemoryStats,
}

impl Shared {
    /// Lock the state, first dropping queues that have expired.
    fn lock(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.expire_queues(Instant::now());
        state
    }

    /// Wake every consumer waiting for queue or channel changes.
    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Take the next message from `queue` for `channel`.
    ///
    /// Pushed deliveries respect the channel prefetch; `get` does not,
    /// matching AMQP's basic.get.
    fn take(self: &Arc<Self>, channel: u64, queue: &str, push: bool) -> Result<Option<Delivery>> {
        let mut state = self.lock();

        let ch = state
            .channels
            .get(&channel)
            .ok_or(BrokerError::ChannelClosed)?;
        if push && ch.prefetch > 0 && ch.pushed >= usize::from(ch.prefetch) {
            return Ok(None);
        }

        let message = {
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::Consume(format!("no queue '{}'", queue)))?;
            q.last_used = Instant::now();
            match q.messages.pop_front() {
                Some(m) => m,
                None => return Ok(None),
            }
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        if let Some(ch) = state.channels.get_mut(&channel) {
            if push {
                ch.pushed += 1;
            }
            ch.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_string(),
                    message: message.clone(),
                    pushed: push,
                },
            );
        }

        let acker = Arc::new(MemoryAcker {
            shared: Arc::clone(self),
            channel,
            tag,
        });
        Ok(Some(Delivery::new(
            tag,
            message.redelivered,
            message.data,
            acker,
        )))
    }

    fn settle(&self, channel: u64, tag: u64, outcome: Settle) -> Result<()> {
        {
            let mut state = self.lock();
            let ch = state
                .channels
                .get_mut(&channel)
                .ok_or(BrokerError::ChannelClosed)?;
            let entry = ch
                .unacked
                .remove(&tag)
                .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {}", tag)))?;
            if entry.pushed {
                ch.pushed = ch.pushed.saturating_sub(1);
            }

            match outcome {
                Settle::Ack => {
                    self.stats.acked.fetch_add(1, Ordering::Relaxed);
                }
                Settle::Requeue => {
                    if let Some(q) = state.queues.get_mut(&entry.queue) {
                        q.messages.push_front(Stored {
                            data: entry.message.data,
                            redelivered: true,
                        });
                    }
                    self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                }
                Settle::Reject => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.notify();
        Ok(())
    }
}

enum Settle {
    Ack,
    Requeue,
    Reject,
}

struct MemoryAcker {
    shared: Arc<Shared>,
    channel: u64,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.shared.settle(self.channel, self.tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let outcome = if requeue {
            Settle::Requeue
        } else {
            Settle::Reject
        };
        self.shared.settle(self.channel, self.tag, outcome)
    }
}

/// In-process broker shared by every peer of a test or standalone process.
///
/// Cloning yields another handle on the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        info!("Memory broker initialized");
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed,
                stats: MemoryStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.shared.stats
    }

    /// Number of ready (undelivered) messages in a queue.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    /// Names of every declared queue, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Deliveries handed out and not yet settled, across all channels.
    pub fn unacked_count(&self) -> usize {
        self.shared
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn open_channel_count(&self) -> usize {
        self.shared.lock().channels.len()
    }

    /// Publish raw bytes straight into a queue, bypassing the codec.
    pub fn inject(&self, queue: &str, data: Vec<u8>) -> bool {
        let injected = {
            let mut state = self.shared.lock();
            match state.queues.get_mut(queue) {
                Some(q) => {
                    q.messages.push_back(Stored {
                        data,
                        redelivered: false,
                    });
                    true
                }
                None => false,
            }
        };
        self.shared.notify();
        injected
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let id = {
            let mut state = self.shared.lock();
            state.next_channel += 1;
            let id = state.next_channel;
            state.channels.insert(id, ChannelState::default());
            id
        };
        debug!(channel = id, "Opened memory channel");
        Ok(Arc::new(MemoryChannel {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// A channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u64,
    shared: Arc<Shared>,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<()> {
        if state.channels.contains_key(&self.id) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4())
        } else {
            name.to_string()
        };

        match state.queues.get(&name) {
            Some(existing) => {
                if existing.options.durable != options.durable
                    || existing.options.exclusive != options.exclusive
                {
                    return Err(BrokerError::Declare(format!(
                        "queue '{}' already declared with different options",
                        name
                    )));
                }
                if let Some(owner) = existing.owner {
                    if owner != self.id {
                        return Err(BrokerError::Declare(format!(
                            "queue '{}' is exclusive to another channel",
                            name
                        )));
                    }
                }
                if let Some(existing) = state.queues.get_mut(&name) {
                    existing.last_used = Instant::now();
                }
            }
            None => {
                state.queues.insert(
                    name.clone(),
                    Queue::new(options, options.exclusive.then_some(self.id)),
                );
                debug!(queue = %name, "Declared memory queue");
            }
        }

        Ok(name)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::Declare(format!(
                "exchange '{}' already declared as {:?}",
                name, existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Declare(format!("no queue '{}'", queue)));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::Declare(format!("no exchange '{}'", exchange)))?;

        let binding = (queue.to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let removed = {
            let mut state = self.shared.lock();
            self.ensure_open(&state)?;
            state.remove_queue(name)
        };
        if removed {
            debug!(queue = %name, "Deleted memory queue");
            self.shared.notify();
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        _content_type: &str,
    ) -> Result<()> {
        {
            let mut state = self.shared.lock();
            self.ensure_open(&state)?;

            let targets: Vec<String> = if exchange.is_empty() {
                vec![routing_key.to_string()]
            } else {
                let ex = state
                    .exchanges
                    .get(exchange)
                    .ok_or_else(|| BrokerError::Publish(format!("no exchange '{}'", exchange)))?;
                ex.bindings
                    .iter()
                    .filter(|(_, key)| ex.kind == ExchangeKind::Fanout || key == routing_key)
                    .map(|(queue, _)| queue.clone())
                    .collect()
            };

            let mut routed = 0;
            for target in &targets {
                if let Some(q) = state.queues.get_mut(target) {
                    q.messages.push_back(Stored {
                        data: body.to_vec(),
                        redelivered: false,
                    });
                    routed += 1;
                }
            }

            self.shared.stats.published.fetch_add(1, Ordering::Relaxed);
            if routed == 0 {
                self.shared.stats.unroutable.fetch_add(1, Ordering::Relaxed);
                debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable");
            }
        }
        self.shared.notify();
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.shared.lock();
        let ch = state
            .channels
            .get_mut(&self.id)
            .ok_or(BrokerError::ChannelClosed)?;
        ch.prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        {
            let mut state = self.shared.lock();
            self.ensure_open(&state)?;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::Consume(format!("no queue '{}'", queue)))?;
            q.consumers.push(self.id);
            q.last_used = Instant::now();
        }
        debug!(queue = %queue, consumer_tag = %consumer_tag, "Memory consumer started");

        let consumer = Consumer {
            shared: Arc::clone(&self.shared),
            changes: self.shared.changed.subscribe(),
            channel: self.id,
            queue: queue.to_string(),
            failed: false,
        };

        Ok(Box::pin(stream::unfold(consumer, |mut consumer| async move {
            if consumer.failed {
                return None;
            }
            loop {
                consumer.changes.borrow_and_update();
                match consumer
                    .shared
                    .take(consumer.channel, &consumer.queue, true)
                {
                    Ok(Some(delivery)) => return Some((Ok(delivery), consumer)),
                    Ok(None) => {}
                    Err(BrokerError::ChannelClosed) => return None,
                    Err(e) => {
                        consumer.failed = true;
                        return Some((Err(e), consumer));
                    }
                }
                if consumer.changes.changed().await.is_err() {
                    return None;
                }
            }
        })))
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        self.shared.take(self.id, queue, false)
    }

    async fn close(&self) -> Result<()> {
        let closed = {
            let mut state = self.shared.lock();
            match state.channels.remove(&self.id) {
                None => false,
                Some(ch) => {
                    // Requeue in reverse so the original order is restored at the head.
                    for (_, entry) in ch.unacked.into_iter().rev() {
                        if let Some(q) = state.queues.get_mut(&entry.queue) {
                            q.messages.push_front(Stored {
                                data: entry.message.data,
                                redelivered: true,
                            });
                            self.shared.stats.requeued.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    let now = Instant::now();
                    for q in state.queues.values_mut() {
                        if q.consumers.contains(&self.id) {
                            q.consumers.retain(|c| *c != self.id);
                            q.last_used = now;
                        }
                    }

                    let owned: Vec<String> = state
                        .queues
                        .iter()
                        .filter(|(_, q)| q.owner == Some(self.id))
                        .map(|(name, _)| name.clone())
                        .collect();
                    for name in owned {
                        state.remove_queue(&name);
                    }
                    true
                }
            }
        };

        if closed {
            debug!(channel = self.id, "Closed memory channel");
            self.shared.notify();
        }
        Ok(())
    }
}

struct Consumer {
    shared: Arc<Shared>,
    changes: watch::Receiver<u64>,
    channel: u64,
    queue: String,
    failed: bool,
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(q) = state.queues.get_mut(&self.queue) {
            if q.consumers.contains(&self.channel) {
                q.consumers.retain(|c| *c != self.channel);
                q.last_used = Instant::now();
            }
        }
    }
}
