//! Backhaul CLI - run a relay or connect local services to one

use anyhow::{bail, Context, Result};
use backhaul_cli::config::{load_yaml, parse_forward, parse_web};
use backhaul_client::{ClientConfig, ServerEndpoint, TunnelClient};
use backhaul_control::{MemoryCache, PortPool};
use backhaul_relay::{RelayConfig, RelayServer};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Backhaul - expose local services through a public relay
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Expose local web and TCP services through a public relay", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server
    Relay(RelayArgs),
    /// Connect to a relay and expose local services
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// YAML config file
    #[arg(short, long, env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,

    /// Address for tunnel, back-connection and public HTTP traffic
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Domain web sub-domains are registered under
    #[arg(long)]
    domain: Option<String>,

    /// Accepted client tokens (comma separated); none means an open relay
    #[arg(long, env = "BACKHAUL_TOKEN", value_delimiter = ',')]
    token: Vec<String>,

    /// Refuse port forwards
    #[arg(long)]
    no_forward: bool,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// YAML config file
    #[arg(short, long, env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,

    /// Relay URL (ws://host:port or wss://host:port)
    #[arg(short, long, env = "BACKHAUL_SERVER")]
    server: Option<String>,

    /// Authentication token
    #[arg(short, long, env = "BACKHAUL_TOKEN")]
    token: Option<String>,

    /// Web service as sub_domain=[host:]port (repeatable)
    #[arg(long)]
    web: Vec<String>,

    /// TCP forward as [name@]remote_port=[host:]port, remote port 0 lets the relay pick (repeatable)
    #[arg(long)]
    forward: Vec<String>,

    /// Skip TLS certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Relay(args) => run_relay(args).await,
        Commands::Connect(args) => run_connect(args).await,
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Cancel `shutdown` on Ctrl+C
fn spawn_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Shutting down...");
        shutdown.cancel();
    });
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => load_yaml::<RelayConfig>(path)?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(domain) = args.domain {
        config.web_domain = domain;
    }
    if !args.token.is_empty() {
        config.tokens = args.token;
    }
    if args.no_forward {
        config.enable_forward = false;
    }

    if config.tokens.is_empty() {
        warn!("No tokens configured, any client may connect");
    }

    let shutdown = CancellationToken::new();
    let mut server = RelayServer::new(config.clone()).with_shutdown(shutdown.clone());

    if config.enable_forward {
        let pool = PortPool::scan(config.port_pool, Arc::new(MemoryCache::new())).await;
        server = server.with_port_pool(Arc::new(pool));
    }

    spawn_ctrl_c(shutdown);
    server.run().await.context("Relay server failed")?;
    info!("Relay stopped");
    Ok(())
}

async fn run_connect(args: ConnectArgs) -> Result<()> {
    let mut config = match (&args.config, &args.server) {
        (Some(path), _) => load_yaml::<ClientConfig>(path)?,
        (None, Some(server)) => ClientConfig::builder()
            .server(server.clone())
            .build()
            .map_err(anyhow::Error::msg)?,
        (None, None) => bail!("Either --server or --config is required"),
    };

    if let (Some(_), Some(server)) = (&args.config, args.server) {
        config.server = server
            .parse::<ServerEndpoint>()
            .context(format!("Invalid server URL: {}", server))?;
    }
    if let Some(token) = args.token {
        config.token = Some(token);
    }
    for web in &args.web {
        config.webs.push(parse_web(web).context("Invalid --web")?);
    }
    for forward in &args.forward {
        config
            .forwards
            .push(parse_forward(forward).context("Invalid --forward")?);
    }
    if args.insecure {
        config.insecure = true;
    }

    if config.webs.is_empty() && config.forwards.is_empty() {
        bail!("Nothing to expose: declare at least one --web or --forward");
    }

    let client = TunnelClient::new(config).context("Failed to create tunnel client")?;
    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());

    client.run(shutdown).await;
    Ok(())
}
