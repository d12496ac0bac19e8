//! Tunnel layer - multiplexed connections over one WebSocket
//!
//! Provides:
//! - Frame encoding/decoding and chunking
//! - Connection registries
//! - Client-side multiplexer and tunnel session
//! - Server-side demultiplexer

mod demux;
mod frame;
mod link;
mod multiplexer;
mod peer;
mod registry;
mod session;

pub use demux::{Demultiplexer, DemuxConfig, ServerSession, SweepStats};
pub use frame::{ConnectionId, Frame};
pub use link::{spawn_writer, TunnelSender};
pub use multiplexer::{ClientRouter, LocalMultiplexer};
pub use peer::{pump, PeerEvent, PeerHandle, PumpEnd};
pub use registry::{ConnectionRegistry, Registry};
pub use session::{SessionConfig, SessionState, TunnelSession};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Host name too long: {0} bytes (max 255)")]
    HostTooLong(usize),

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receiver of frames decoded from a tunnel.
///
/// Called from the tunnel's read loop, so implementations must not block.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, frame: Frame);
}
