//! Protocol definitions and constants

use std::time::Duration;

/// Length of a connection identifier on the wire
pub const ID_LEN: usize = 8;

/// Frame header: identifier plus the 4-byte control field
pub const FRAME_HEADER_SIZE: usize = ID_LEN + 4;

/// Largest WebSocket message the relay is guaranteed to accept (8 KB)
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// Largest payload carried by a single Data message
pub const MAX_CHUNK_SIZE: usize = MAX_MESSAGE_SIZE - FRAME_HEADER_SIZE;

/// Control value of an Open frame
pub const CONTROL_OPEN: i32 = 0;

/// Control value of a Close frame (followed by two zero bytes)
pub const CONTROL_CLOSE: i32 = 2;

/// Default WebSocket path of the relay
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Keepalive interval of the client tunnel
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(50);

/// Delay between tunnel reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Interval of the relay's liveness sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Timeout for dialing a destination
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the WebSocket upgrade
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for sniffing the first request of an HTTP connection
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum length of an HTTP request line
pub const MAX_INITIAL_LINE_LENGTH: usize = 4096;

/// Maximum size of the HTTP header block scanned for `Host`
pub const MAX_HEADER_SIZE: usize = 8192;

/// Default port for plain HTTP targets
pub const HTTP_DEFAULT_PORT: u16 = 80;

/// Default port for `CONNECT` targets
pub const HTTPS_DEFAULT_PORT: u16 = 443;

/// Read buffer for local and destination sockets
pub const READ_BUFFER_SIZE: usize = 32 * 1024;
