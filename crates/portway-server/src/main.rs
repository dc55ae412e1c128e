//! Portway server CLI
//!
//! Reverse-tunnel server: agents dial in and register as clients,
//! operators request TCP tunnels multiplexed over each agent connection.

use clap::Parser;
use portway_control::{ClientRepository, ClientService, PortDistributor, PortRange};
use portway_server::{PortwayServer, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "portway-server",
    about = "Reverse-tunnel server for remote agents",
    version,
    long_about = "Accepts agent connections and multiplexes operator-requested\n\
                  TCP tunnels over them.\n\n\
                  Examples:\n  \
                  # Tunnels on ports 20000-20100, keep lost clients for an hour\n  \
                  portway-server --listen 0.0.0.0:8080 \\\n    \
                  --allow-port 20000-20100 \\\n    \
                  --keep-lost-clients 3600"
)]
struct Cli {
    /// Listen address for agent connections
    #[arg(
        short = 'l',
        long,
        default_value = "0.0.0.0:8080",
        env = "PORTWAY_LISTEN"
    )]
    listen: SocketAddr,

    /// Allowed local tunnel port ranges (can be specified multiple times)
    /// Format: single port (e.g., "20000") or range (e.g., "20000-20100")
    #[arg(
        long = "allow-port",
        value_name = "PORT",
        default_value = "20000-30000",
        value_parser = parse_port_range
    )]
    allowed_ports: Vec<PortRange>,

    /// Keep disconnected clients for this many seconds; omit to delete
    /// them immediately on disconnect
    #[arg(long, value_name = "SECONDS", env = "PORTWAY_KEEP_LOST_CLIENTS")]
    keep_lost_clients: Option<u64>,

    /// Allow one credential to be used by several connected clients
    #[arg(long, env = "PORTWAY_MULTIUSE_CREDS")]
    allow_multiuse_creds: bool,

    /// How often to purge expired disconnected clients, in seconds
    #[arg(long, default_value = "60", value_name = "SECONDS")]
    sweep_interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_port_range(s: &str) -> Result<PortRange, String> {
    s.parse::<PortRange>()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "portway_server=debug,portway_control=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "portway_server=info,portway_control=info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting portway server");
    tracing::info!("Listen: {}", cli.listen);
    for range in &cli.allowed_ports {
        if range.start == range.end {
            tracing::info!("Allowed tunnel port: {}", range.start);
        } else {
            tracing::info!("Allowed tunnel ports: {}-{}", range.start, range.end);
        }
    }
    match cli.keep_lost_clients {
        Some(secs) => tracing::info!("Keeping lost clients for {}s", secs),
        None => tracing::info!("Retention disabled, lost clients are deleted immediately"),
    }

    let keep_lost_clients = cli
        .keep_lost_clients
        .map(|secs| chrono::Duration::seconds(secs as i64));
    let repo = Arc::new(ClientRepository::new(keep_lost_clients));
    let distributor = PortDistributor::new(&cli.allowed_ports);
    if distributor.allowed_count() == 0 {
        anyhow::bail!("no allowed tunnel ports configured");
    }
    let service = Arc::new(ClientService::new(distributor, repo));

    let config = ServerConfig {
        listen_addr: cli.listen,
        allow_multiuse_creds: cli.allow_multiuse_creds,
        sweep_interval: Duration::from_secs(cli.sweep_interval),
    };
    let server = PortwayServer::bind(config, service).await?;
    server.run().await
}
