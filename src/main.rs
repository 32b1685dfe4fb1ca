use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcperf::{
    Config, Endpoint, EndpointList, Error, LoadGenerator, Registry, Result, SocketPool,
};

#[derive(Parser)]
#[command(name = "dhcperf")]
#[command(author, version, about = "A DHCPv4 load generator", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "dhcperf.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Network device to bind the sockets to.
    #[arg(short, long)]
    interface: Option<String>,

    /// Relay address stamped into giaddr.
    #[arg(short, long)]
    gateway: Option<Ipv4Addr>,

    /// Stop sending after this many seconds.
    #[arg(short = 'L', long)]
    lifetime: Option<f64>,

    /// Server to send to (`ip:port`, `ip` or `port`); may be repeated.
    #[arg(short, long = "server")]
    servers: Vec<String>,

    #[arg(short, long)]
    num_requests: Option<u64>,

    /// Requests per second.
    #[arg(short, long)]
    rate: Option<f64>,

    /// Reply timeout in milliseconds.
    #[arg(short, long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    /// Print the attributes of the first requests without sending them.
    Expand { count: usize },
}

impl Cli {
    fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(interface) = &self.interface {
            config.interface = Some(interface.clone());
        }
        if let Some(gateway) = self.gateway {
            config.gateway = Some(gateway);
        }
        if let Some(lifetime) = self.lifetime {
            config.lifetime_seconds = Some(lifetime);
        }
        if !self.servers.is_empty() {
            let mut servers = EndpointList::default();
            let default = Endpoint::new(Ipv4Addr::BROADCAST, 67);
            for server in &self.servers {
                servers.add(server, default)?;
            }
            config.servers = servers.iter().copied().collect();
        }
        if let Some(num_requests) = self.num_requests {
            config.num_requests = Some(num_requests);
        }
        if let Some(rate) = self.rate {
            config.rate = Some(rate);
        }
        if let Some(timeout) = self.timeout {
            config.timeout_ms = timeout;
        }
        config.validate()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut config = Config::load_or_create(&cli.config)?;
    cli.apply(&mut config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting load generator with config: {:?}", cli.config);
            let generator = LoadGenerator::new(&config)?;
            let shutdown = generator.shutdown_handle();
            let mut task = tokio::task::spawn_blocking(move || generator.run());

            let joined = tokio::select! {
                joined = &mut task => joined,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, draining outstanding requests...");
                    shutdown.store(true, Ordering::Relaxed);
                    task.await
                }
            };

            let stats = joined.map_err(|error| Error::Io(std::io::Error::other(error)))??;
            print!("{}", stats.report());
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Expand { count } => {
            // No sockets needed to expand templates.
            let registry = Registry::new(SocketPool::new(0));
            let mut generator = LoadGenerator::with_registry(&config, registry)?;
            for index in 0..count {
                let (stream, attributes) = generator.expand_next()?;
                println!("# request {} (input {})", index, stream);
                for (name, value) in attributes {
                    println!("{} = {}", name, value);
                }
            }
            Ok(())
        }
    }
}
