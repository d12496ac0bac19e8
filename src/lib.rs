//! # Burrow
//!
//! A TCP tunnel that carries many independent connections over one
//! persistent WebSocket, for reaching hosts behind NATs and firewalls that
//! only let HTTP through.
//!
//! ## Features
//!
//! - **Multiplexing** of any number of logical connections over a single tunnel
//! - **Static TCP forwarding** to a fixed destination
//! - **Transparent HTTP sniffing**, including `CONNECT` for HTTPS
//! - **Automatic reconnect** of the tunnel with a fixed delay and keepalive pings
//! - **Per-connection XOR scrambling** of payloads (not encryption)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐        ┌──────────────────────┐        ┌──────────────┐
//! │ local client │──TCP──▶│ burrow-client        │        │ destination  │
//! └──────────────┘        │  LocalMultiplexer    │        └──────▲───────┘
//!                         │  TunnelSession       │               │ TCP
//!                         └──────────┬───────────┘        ┌──────┴───────┐
//!                                    │   one WebSocket    │ burrow-server│
//!                                    └───────────────────▶│ Demultiplexer│
//!                                   Open / Data / Close   └──────────────┘
//! ```

pub mod config;
pub mod obfuscation;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
