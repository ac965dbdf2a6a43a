//! clique-request: machine requester
//!
//! Requests one machine and prints the answering agent's reply as JSON.
//!
//! ```text
//! clique-request [--config <path>] [--disc <gb>] [--pkey <key>] <name> <cpu> <mem> [image]
//! ```
//!
//! Exits non-zero when no agent answered within the retry budget.

use clap::Parser;
use tracing::{error, info};

use clique_connector::broker::init_broker;
use clique_connector::config::Config;
use clique_connector::utils::bootstrap::init_tracing;
use clique_connector::{Connector, MachineRequest};

#[derive(Debug, Parser)]
#[command(name = "clique-request", version, about = "Request one machine from the clique")]
struct Args {
    /// Configuration file.
    #[arg(long, env = "CLIQUE_CONFIG")]
    config: Option<String>,

    /// Disc size in gigabytes.
    #[arg(long)]
    disc: Option<u64>,

    /// Public key to install for the login user.
    #[arg(long)]
    pkey: Option<String>,

    /// Machine name.
    name: String,

    /// Number of CPUs.
    cpu: u32,

    /// Memory in megabytes.
    mem: u64,

    /// Image to boot.
    image: Option<String>,
}

impl Args {
    fn machine_request(&self) -> MachineRequest {
        let mut request = MachineRequest::new(self.name.clone(), self.cpu, self.mem);
        request.image = self.image.clone();
        request.disc = self.disc;
        request.pkey = self.pkey.clone();
        request
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let request = args.machine_request();
    let config = Config::load(args.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let broker = init_broker(&config.broker)
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;
    let connector = Connector::from_config(broker, &config);
    info!(identity = %connector.identity(), name = %request.name, "Requesting machine");

    let machine = connector.create_machine(&request).await?;
    println!("{}", serde_json::to_string(&machine)?);

    Ok(())
}
