//! Burrow client
//!
//! Keeps one tunnel WebSocket open to the relay and:
//! - Accepts local TCP connections on every configured listener
//! - Finds each connection's destination (fixed target or HTTP sniffing)
//! - Multiplexes all of them over the tunnel

use anyhow::{anyhow, Context, Result};
use burrow::config::{generate_example_config, Config, ListenMode, ListenerConfig, LoggingConfig};
use burrow::tunnel::{ClientRouter, ConnectionRegistry, LocalMultiplexer, TunnelSession};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Burrow client - multiplexed TCP tunnel over WebSocket
#[derive(Parser, Debug)]
#[command(name = "burrow-client")]
#[command(about = "Burrow client - tunnels local TCP and HTTP connections through a relay")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "burrow.toml")]
    config: String,

    /// Relay address host:port (overrides config)
    #[arg(short, long)]
    relay: Option<String>,

    /// WebSocket path on the relay (overrides config)
    #[arg(long)]
    path: Option<String>,

    /// Local HTTP sniffing listener (replaces configured listeners)
    #[arg(long)]
    http: Option<String>,

    /// Local TCP listener forwarding to --target (replaces configured listeners)
    #[arg(long, requires = "target")]
    tcp: Option<String>,

    /// Destination host:port for --tcp
    #[arg(long)]
    target: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", generate_example_config().to_toml()?);
        return Ok(());
    }

    let config = Config::load_or_default(&args.config).context("Failed to load configuration")?;
    init_logging(args.log_level.as_deref(), &config.logging);

    let mut client_config = config.client.unwrap_or_default();
    if let Some(relay) = args.relay {
        client_config.relay = relay;
    }
    if let Some(path) = args.path {
        client_config.path = path;
    }

    let mut cli_listeners = Vec::new();
    if let Some(listen) = args.http {
        cli_listeners.push(ListenerConfig {
            listen,
            mode: ListenMode::Http,
            target: None,
        });
    }
    if let Some(listen) = args.tcp {
        cli_listeners.push(ListenerConfig {
            listen,
            mode: ListenMode::Tcp,
            target: args.target,
        });
    }
    if !cli_listeners.is_empty() {
        client_config.listeners = cli_listeners;
    }
    if client_config.listeners.is_empty() {
        return Err(anyhow!("No listeners configured"));
    }

    info!("Burrow client v{}", burrow::VERSION);
    info!("Relay: {}{}", client_config.relay, client_config.path);

    // bind every listener before dialing so config mistakes surface first
    let mut bound = Vec::new();
    for listener_config in &client_config.listeners {
        let sniffer = listener_config
            .sniffer()
            .with_context(|| format!("Invalid listener {}", listener_config.listen))?;
        let listener = TcpListener::bind(&listener_config.listen)
            .await
            .with_context(|| format!("Failed to bind {}", listener_config.listen))?;
        bound.push((listener, sniffer));
    }

    let registry = Arc::new(ConnectionRegistry::new());
    let router = Arc::new(ClientRouter::new(registry.clone()));
    let session = TunnelSession::connect(client_config.session_config(), router)
        .await
        .context("Failed to establish tunnel")?;

    let mux = Arc::new(LocalMultiplexer::new(session.clone(), registry));
    let mut tasks = tokio::task::JoinSet::new();
    for (listener, sniffer) in bound {
        tasks.spawn(mux.clone().serve(listener, sniffer));
    }

    tokio::select! {
        _ = tasks.join_next() => {
            error!("Listener task ended unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    session.shutdown();
    Ok(())
}

fn init_logging(cli_level: Option<&str>, logging: &LoggingConfig) {
    let level = cli_level.unwrap_or(&logging.level);
    let builder = tracing_subscriber::fmt().with_env_filter(level);
    if logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}
