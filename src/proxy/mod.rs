//! Destination discovery for local connections
//!
//! Provides:
//! - Static target forwarding (plain TCP tunnel)
//! - Transparent HTTP sniffing, including CONNECT

mod http;
mod tcp;

pub use http::{find_header, parse_host_port, split_initial_line, HttpSniffer, RequestLine, CONNECT_ESTABLISHED};
pub use tcp::StaticTarget;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::net::TcpStream;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No Host header in request")]
    MissingHost,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Request header exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Timed out waiting for request")]
    Timeout,

    #[error("Connection closed before request was complete")]
    Closed,
}

/// Destination a logical connection should be opened to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, falling back to `default_port`
    pub fn parse(s: &str, default_port: u16) -> Result<Self, ProxyError> {
        let (host, port) = parse_host_port(s, default_port)?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// What a sniffer learned from a fresh local connection
#[derive(Debug, Clone)]
pub struct Sniffed {
    pub target: Target,
    /// Bytes already consumed from the socket that must be forwarded first
    pub initial_data: Bytes,
    /// Response to write back to the local client before relaying
    pub reply: Option<&'static [u8]>,
}

/// Strategy producing a destination from a newly accepted connection.
///
/// Selected per listener. Errors close the local connection without any
/// frame being sent.
#[async_trait]
pub trait TargetSniffer: Send + Sync {
    async fn sniff(&self, stream: &mut TcpStream) -> Result<Sniffed, ProxyError>;

    /// Short label for logs
    fn name(&self) -> &'static str;
}
