//! AMQP/RabbitMQ broker integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use clique_connector::broker::{AmqpBroker, Broker, QueueOptions};
use clique_connector::config::{AmqpConfig, DeliveryMode, ExchangeConfig, ListenerConfig};
use clique_connector::correlator::BoxError;
use clique_connector::topology::{Topology, COMMAND_QUEUE};
use clique_connector::{
    Connector, Machine, MachineProvider, MachineRequest, Messenger, PeerId, ServeOutcome,
};

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

async fn connector(broker: &Arc<AmqpBroker>, id: &str, mode: DeliveryMode) -> Connector {
    let listener = ListenerConfig {
        mode,
        poll_interval_ms: 20,
        ..Default::default()
    };
    let exchange = ExchangeConfig {
        ack_timeout_ms: 3_000,
        result_timeout_ms: 3_000,
        confirm_timeout_ms: 3_000,
        max_retries: 2,
        ..Default::default()
    };
    let messenger = Messenger::new(
        Arc::clone(broker) as Arc<dyn Broker>,
        PeerId::new(format!("{}-{}", id, uuid::Uuid::new_v4())),
        &listener,
        Topology::new(Some(Duration::from_secs(60))),
    );
    Connector::new(Arc::new(messenger), &exchange)
}

/// Provider that counts created machines.
struct CountingProvider {
    host: String,
    count: AtomicUsize,
}

impl CountingProvider {
    fn new(host: &str) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            count: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MachineProvider for CountingProvider {
    async fn create(&self, _request: MachineRequest) -> Result<Machine, BoxError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(Machine {
            host: self.host.clone(),
            username: "root".to_string(),
        })
    }
}

/// Drain a responder in the background.
fn spawn_serving(mut serving: clique_connector::Serving) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut completed = 0;
        while let Some(outcome) = serving.next().await {
            match outcome {
                ServeOutcome::Completed { .. } => completed += 1,
                ServeOutcome::Failed { error, .. } => println!("Serve failure: {}", error),
            }
        }
        completed
    })
}

#[tokio::test]
async fn test_create_machine_round_trip() {
    println!("=== AMQP Create Machine Test ===");
    println!("Starting RabbitMQ container...");

    let (_container, url) = start_rabbitmq().await;
    let broker = Arc::new(
        AmqpBroker::new(&AmqpConfig::new(&url))
            .await
            .expect("Failed to connect"),
    );

    for mode in [DeliveryMode::Push, DeliveryMode::Poll] {
        let api = connector(&broker, "api", mode).await;
        let agent = connector(&broker, "agent", mode).await;

        let provider = CountingProvider::new("10.0.0.5");
        let serving = agent.wait_for_machines(provider.clone()).await.unwrap();
        let cancel = serving.cancel_handle();
        let served = spawn_serving(serving);

        let machine = tokio::time::timeout(
            Duration::from_secs(20),
            api.create_machine(&MachineRequest::new("vm1", 1, 512)),
        )
        .await
        .expect("Timed out waiting for machine")
        .expect("Request failed");

        assert_eq!(machine.host, "10.0.0.5");
        assert_eq!(machine.username, "root");

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        assert_eq!(served.await.unwrap(), 1);
        assert_eq!(provider.count.load(Ordering::SeqCst), 1);
    }

    println!("=== AMQP Create Machine Test PASSED ===");
}

#[tokio::test]
async fn test_competing_agents_claim_once() {
    println!("=== AMQP Competing Agents Test ===");
    println!("Starting RabbitMQ container...");

    let (_container, url) = start_rabbitmq().await;
    let broker = Arc::new(AmqpBroker::new(&AmqpConfig::new(&url)).await.unwrap());

    let api = connector(&broker, "api", DeliveryMode::Push).await;
    let first = CountingProvider::new("10.0.0.1");
    let second = CountingProvider::new("10.0.0.2");

    let agent_a = connector(&broker, "agent-a", DeliveryMode::Push).await;
    let agent_b = connector(&broker, "agent-b", DeliveryMode::Push).await;
    let serving_a = agent_a.wait_for_machines(first.clone()).await.unwrap();
    let serving_b = agent_b.wait_for_machines(second.clone()).await.unwrap();
    let (cancel_a, cancel_b) = (serving_a.cancel_handle(), serving_b.cancel_handle());
    let served_a = spawn_serving(serving_a);
    let served_b = spawn_serving(serving_b);

    for i in 0..3 {
        api.create_machine(&MachineRequest::new(format!("vm{}", i), 1, 512))
            .await
            .expect("Request failed");
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel_a.cancel();
    cancel_b.cancel();
    let completed = served_a.await.unwrap() + served_b.await.unwrap();

    assert_eq!(completed, 3);
    assert_eq!(
        first.count.load(Ordering::SeqCst) + second.count.load(Ordering::SeqCst),
        3
    );

    println!("=== AMQP Competing Agents Test PASSED ===");
}

#[tokio::test]
async fn test_status_fanout_and_malformed_messages() {
    println!("=== AMQP Status and Malformed Messages Test ===");
    println!("Starting RabbitMQ container...");

    let (_container, url) = start_rabbitmq().await;
    let broker = Arc::new(AmqpBroker::new(&AmqpConfig::new(&url)).await.unwrap());

    let a = connector(&broker, "a", DeliveryMode::Push).await;
    let b = connector(&broker, "b", DeliveryMode::Poll).await;
    let mut a_status = a.messenger().get_status_listener().await.unwrap();
    let mut b_status = b.messenger().get_status_listener().await.unwrap();

    let announced = a.messenger().publish_online().await.unwrap();
    for status in [&mut a_status, &mut b_status] {
        let incoming = tokio::time::timeout(Duration::from_secs(5), status.next())
            .await
            .expect("Timed out")
            .expect("Stream ended")
            .expect("Listener failed");
        assert_eq!(incoming.ack().await.unwrap().checksum(), announced);
    }

    // Garbage on the command queue is rejected; the next valid message arrives.
    let mut commands = b.messenger().get_command_listener().await.unwrap();
    let raw = broker.open_channel().await.unwrap();
    raw.declare_queue(COMMAND_QUEUE, QueueOptions::durable())
        .await
        .unwrap();
    raw.publish("", COMMAND_QUEUE, b"{ not json", "application/json")
        .await
        .unwrap();
    raw.close().await.unwrap();

    let sent = a
        .messenger()
        .publish_command("noop", json!({ "n": 1 }).as_object().cloned().unwrap())
        .await
        .unwrap();
    let incoming = tokio::time::timeout(Duration::from_secs(5), commands.next())
        .await
        .expect("Timed out")
        .expect("Stream ended")
        .expect("Listener failed");
    assert_eq!(incoming.ack().await.unwrap().checksum(), sent);

    commands.cancel();
    commands.cancel();

    println!("=== AMQP Status and Malformed Messages Test PASSED ===");
}
