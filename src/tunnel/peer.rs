//! Plain TCP endpoints attached to a tunnel connection
//!
//! A peer is either a local client socket (client side) or a destination
//! socket (relay side). Frames arriving from the tunnel reach the socket
//! through a [`PeerHandle`]; bytes read from the socket go back through a
//! caller-supplied callback.

use bytes::Bytes;
use std::future::Future;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::trace;

/// Event delivered from the tunnel to a peer socket
#[derive(Debug)]
pub enum PeerEvent {
    /// Bytes to write to the socket
    Data(Bytes),
    /// The other side closed the connection
    Close,
}

/// Sending half of a peer's event queue.
///
/// Cloning is cheap. The queue is unbounded so the tunnel read loop never
/// waits on a slow socket.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerHandle {
    /// Create a handle and the receiver to pass to [`pump`]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue bytes for the socket. Returns false once the peer is gone.
    pub fn deliver(&self, data: Bytes) -> bool {
        self.tx.send(PeerEvent::Data(data)).is_ok()
    }

    /// Ask the peer to shut down its socket
    pub fn close(&self) {
        let _ = self.tx.send(PeerEvent::Close);
    }

    /// Whether the pumping task is still running
    pub fn is_active(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Whether both handles feed the same peer
    pub fn same_channel(&self, other: &PeerHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Why [`pump`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// A Close arrived from the tunnel
    ClosedByTunnel,
    /// The socket reached end of stream
    PeerEof,
    /// Reading the socket failed
    PeerError,
    /// Writing the socket failed
    WriteFailed,
    /// The read callback refused the bytes
    TunnelUnavailable,
}

/// Drive one peer socket until either direction ends.
///
/// Tunnel events are written to the socket in order. Socket reads of up to
/// `read_buf_size` bytes are passed to `on_read`, which returns false when
/// the bytes could not be forwarded. The socket is dropped on return.
pub async fn pump<F, Fut>(
    stream: TcpStream,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    read_buf_size: usize,
    mut on_read: F,
) -> PumpEnd
where
    F: FnMut(Bytes) -> Fut,
    Fut: Future<Output = bool>,
{
    let (mut reader, mut writer) = stream.into_split();

    let inbound = async {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Data(data) => {
                    if let Err(e) = writer.write_all(&data).await {
                        trace!("Peer write failed: {}", e);
                        return PumpEnd::WriteFailed;
                    }
                }
                PeerEvent::Close => {
                    let _ = writer.shutdown().await;
                    return PumpEnd::ClosedByTunnel;
                }
            }
        }
        // every handle dropped, nothing will ever arrive again
        PumpEnd::ClosedByTunnel
    };

    let outbound = async {
        let mut buf = vec![0u8; read_buf_size];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => return PumpEnd::PeerEof,
                Ok(n) => {
                    if !on_read(Bytes::copy_from_slice(&buf[..n])).await {
                        return PumpEnd::TunnelUnavailable;
                    }
                }
                Err(e) => {
                    trace!("Peer read failed: {}", e);
                    return PumpEnd::PeerError;
                }
            }
        }
    };

    tokio::select! {
        end = inbound => end,
        end = outbound => end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (client, accepted) = tokio::join!(connect, listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_same_channel() {
        let (a, _a_events) = PeerHandle::channel();
        let (b, _b_events) = PeerHandle::channel();
        assert!(a.same_channel(&a.clone()));
        assert!(!a.same_channel(&b));
    }

    #[tokio::test]
    async fn test_pump_forwards_both_directions() {
        let (mut outside, inside) = socket_pair().await;
        let (handle, events) = PeerHandle::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_in_task = seen.clone();
        let task = tokio::spawn(pump(inside, events, 1024, move |data| {
            seen_in_task.lock().unwrap().extend_from_slice(&data);
            async { true }
        }));

        assert!(handle.deliver(Bytes::from_static(b"to peer")));
        let mut buf = [0u8; 7];
        outside.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to peer");

        outside.write_all(b"from peer").await.unwrap();
        outside.shutdown().await.unwrap();

        assert_eq!(task.await.unwrap(), PumpEnd::PeerEof);
        assert_eq!(&seen.lock().unwrap()[..], b"from peer");
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_pump_close_event_shuts_socket() {
        let (mut outside, inside) = socket_pair().await;
        let (handle, events) = PeerHandle::channel();

        let task = tokio::spawn(pump(inside, events, 1024, |_| async { true }));
        handle.deliver(Bytes::from_static(b"bye"));
        handle.close();

        assert_eq!(task.await.unwrap(), PumpEnd::ClosedByTunnel);
        let mut rest = Vec::new();
        outside.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"bye");
    }

    #[tokio::test]
    async fn test_pump_stops_when_callback_refuses() {
        let (mut outside, inside) = socket_pair().await;
        let (_handle, events) = PeerHandle::channel();

        let task = tokio::spawn(pump(inside, events, 1024, |_| async { false }));
        outside.write_all(b"x").await.unwrap();

        assert_eq!(task.await.unwrap(), PumpEnd::TunnelUnavailable);
    }
}
