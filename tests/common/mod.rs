//! Shared utilities for integration tests.
//!
//! Builds connectors on a shared in-process broker with short timeouts and
//! drives responders in the background.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use clique_connector::broker::MemoryBroker;
use clique_connector::config::{DeliveryMode, ExchangeConfig, ListenerConfig};
use clique_connector::correlator::BoxError;
use clique_connector::topology::Topology;
use clique_connector::{
    CancelHandle, Connector, Machine, MachineProvider, MachineRequest, Messenger, Payload, PeerId,
    ServeOutcome, Serving,
};

/// Timeouts short enough for tests, long enough for an in-process round trip.
pub fn fast_exchange() -> ExchangeConfig {
    ExchangeConfig {
        ack_timeout_ms: 500,
        result_timeout_ms: 500,
        confirm_timeout_ms: 500,
        max_retries: 3,
        retry_min_delay_ms: 10,
        retry_max_delay_ms: 50,
    }
}

pub fn listener(mode: DeliveryMode) -> ListenerConfig {
    ListenerConfig {
        mode,
        poll_interval_ms: 5,
        requeue_delay_ms: 20,
        publish_retries: 1,
    }
}

/// A connector for peer `id` on `broker`.
pub fn connector(
    broker: &MemoryBroker,
    id: &str,
    mode: DeliveryMode,
    exchange: &ExchangeConfig,
) -> Connector {
    let messenger = Messenger::new(
        Arc::new(broker.clone()),
        PeerId::new(id),
        &listener(mode),
        Topology::default(),
    );
    Connector::new(Arc::new(messenger), exchange)
}

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be an object")
}

pub fn machine(host: &str) -> Machine {
    Machine {
        host: host.to_string(),
        username: "root".to_string(),
    }
}

/// Poll `serving` in the background, forwarding every outcome.
pub fn drive(mut serving: Serving) -> (mpsc::UnboundedReceiver<ServeOutcome>, CancelHandle) {
    let cancel = serving.cancel_handle();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(outcome) = serving.next().await {
            if tx.send(outcome).is_err() {
                break;
            }
        }
    });
    (rx, cancel)
}

/// Provider that records calls and fails the first `failures` of them.
pub struct CountingProvider {
    pub answer: Machine,
    pub accept: bool,
    pub failures: usize,
    pub confirms: AtomicUsize,
    pub calls: AtomicUsize,
    pub requests: std::sync::Mutex<Vec<MachineRequest>>,
}

impl CountingProvider {
    fn build(host: &str, accept: bool, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            answer: machine(host),
            accept,
            failures,
            confirms: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            requests: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn new(host: &str) -> Arc<Self> {
        Self::build(host, true, 0)
    }

    pub fn failing(host: &str, failures: usize) -> Arc<Self> {
        Self::build(host, true, failures)
    }

    pub fn declining(host: &str) -> Arc<Self> {
        Self::build(host, false, 0)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn confirms(&self) -> usize {
        self.confirms.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MachineProvider for CountingProvider {
    async fn confirm(&self, _request: &MachineRequest) -> bool {
        self.confirms.fetch_add(1, Ordering::SeqCst);
        self.accept
    }

    async fn create(&self, request: MachineRequest) -> Result<Machine, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if call < self.failures {
            return Err(format!("hypervisor unavailable (call {})", call + 1).into());
        }
        Ok(self.answer.clone())
    }
}
