//! Burrow relay
//!
//! Accepts tunnel WebSockets from clients and:
//! - Dials the destinations they ask for
//! - Relays bytes between each destination and its logical connection
//! - Closes every destination of a tunnel when it drops

use anyhow::{Context, Result};
use burrow::config::{generate_example_config, Config, LoggingConfig};
use burrow::tunnel::Demultiplexer;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Burrow relay - multiplexed TCP tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Burrow relay - terminates tunnels and dials destinations")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "burrow.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// WebSocket path (overrides config)
    #[arg(long)]
    path: Option<String>,

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

    let mut server_config = config.server.unwrap_or_default();
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if let Some(path) = args.path {
        server_config.path = path;
    }

    info!("Burrow relay v{}", burrow::VERSION);
    info!("Listening on {}{}", server_config.listen, server_config.path);

    let listener = TcpListener::bind(&server_config.listen)
        .await
        .context("Failed to bind to address")?;
    let demux = Arc::new(Demultiplexer::new(server_config.demux_config()));

    tokio::select! {
        _ = demux.clone().serve(listener) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

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
