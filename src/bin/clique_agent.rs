//! clique-agent: machine responder
//!
//! Announces itself on the status exchange, then competes with other agents
//! for `machine-requested` commands and answers each claimed request with
//! the configured machine details.
//!
//! ## Configuration
//! - `clique.yaml`, `--config <path>`, or CLIQUE_CONFIG: configuration file
//! - CLIQUE__BROKER__TYPE: memory or amqp
//! - CLIQUE__BROKER__AMQP__URL: RabbitMQ URL
//! - CLIQUE__AGENT__HOST / CLIQUE__AGENT__USERNAME: answered machine details
//! - CLIQUE_LOG: log filter (default info)

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use futures::StreamExt;
use tracing::{error, info};

use clique_connector::broker::init_broker;
use clique_connector::config::{AgentConfig, Config};
use clique_connector::correlator::BoxError;
use clique_connector::utils::bootstrap::init_tracing;
use clique_connector::{Connector, Machine, MachineProvider, MachineRequest, ServeOutcome};

#[derive(Debug, Parser)]
#[command(name = "clique-agent", version, about = "Answer machine requests")]
struct Args {
    /// Configuration file.
    #[arg(long, env = "CLIQUE_CONFIG")]
    config: Option<String>,
}

/// Answers every request with the same machine.
struct StaticProvider {
    agent: AgentConfig,
}

#[async_trait]
impl MachineProvider for StaticProvider {
    async fn create(&self, request: MachineRequest) -> Result<Machine, BoxError> {
        info!(
            name = %request.name,
            cpu = request.cpu,
            mem = request.mem,
            "Creating machine"
        );
        Ok(Machine {
            host: self.agent.host.clone(),
            username: self.agent.username.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let config = Config::load(args.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let broker = init_broker(&config.broker)
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;
    let connector = Connector::from_config(broker, &config);
    info!(identity = %connector.identity(), "Starting clique-agent");

    connector.messenger().publish_online().await?;

    let provider = Arc::new(StaticProvider {
        agent: config.agent.clone(),
    });
    let mut serving = connector.wait_for_machines(provider).await?;

    info!("Agent running, press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                serving.cancel();
                break;
            }
            outcome = serving.next() => match outcome {
                Some(ServeOutcome::Completed { request, .. }) => {
                    info!(request = %request, "Machine delivered");
                }
                Some(ServeOutcome::Failed { request, error }) => {
                    error!(request = ?request, error = %error, "Machine request failed");
                }
                None => break,
            },
        }
    }

    Ok(())
}
