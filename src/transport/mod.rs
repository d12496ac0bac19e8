//! Transport layer
//!
//! Provides:
//! - The client-side WebSocket dial to the relay
//! - The relay-side upgrade with path check

mod ws;

pub use ws::{accept, connect, ClientStream, ServerStream};

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Upgrade rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}
