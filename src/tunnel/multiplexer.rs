//! Client-side multiplexer
//!
//! Accepts local connections, opens a logical connection on the tunnel for
//! each one and routes frames coming back from the relay to the right local
//! socket.

use super::{pump, ConnectionId, ConnectionRegistry, Frame, FrameHandler, PeerHandle, PumpEnd, TunnelSession};
use crate::protocol::READ_BUFFER_SIZE;
use crate::proxy::TargetSniffer;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

/// Routes inbound tunnel frames to local connections
#[derive(Clone)]
pub struct ClientRouter {
    registry: Arc<ConnectionRegistry>,
}

impl ClientRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

impl FrameHandler for ClientRouter {
    fn on_frame(&self, frame: Frame) {
        match frame {
            Frame::Open { id, host, port } => {
                debug!("Ignoring Open for {} ({}:{}) on client side", id, host, port);
            }
            Frame::Data { id, payload } => {
                let Some(peer) = self.registry.get(&id) else {
                    trace!("Data for unknown connection {}", id);
                    return;
                };
                if !peer.deliver(payload) {
                    self.registry.remove(&id);
                }
            }
            Frame::Close { id } => {
                if let Some(peer) = self.registry.remove(&id) {
                    debug!("Relay closed connection {}", id);
                    peer.close();
                }
            }
        }
    }
}

/// Local side of the tunnel, shared by all listeners of one client
pub struct LocalMultiplexer {
    session: Arc<TunnelSession>,
    registry: Arc<ConnectionRegistry>,
}

impl LocalMultiplexer {
    /// `registry` must be the one the session's [`ClientRouter`] routes into
    pub fn new(session: Arc<TunnelSession>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { session, registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &Arc<TunnelSession> {
        &self.session
    }

    /// Accept local connections on `listener` forever
    pub async fn serve(self: Arc<Self>, listener: TcpListener, sniffer: Arc<dyn TargetSniffer>) {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        info!("Accepting {} connections on {}", sniffer.name(), local);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept on {} failed: {}", local, e);
                    continue;
                }
            };
            debug!("New local connection from {}", peer_addr);

            let mux = self.clone();
            let sniffer = sniffer.clone();
            tokio::spawn(async move {
                mux.handle_connection(stream, sniffer).await;
            });
        }
    }

    /// Carry one local connection over the tunnel until either side closes
    pub async fn handle_connection(&self, mut stream: TcpStream, sniffer: Arc<dyn TargetSniffer>) {
        if !self.session.is_connected() {
            debug!("Tunnel down, dropping local connection");
            return;
        }

        let sniffed = match sniffer.sniff(&mut stream).await {
            Ok(sniffed) => sniffed,
            Err(e) => {
                debug!("Could not determine destination: {}", e);
                return;
            }
        };

        let Some(tunnel) = self.session.sender() else {
            debug!("Tunnel went down while sniffing, dropping local connection");
            return;
        };

        let _ = stream.set_nodelay(true);
        let (peer, events) = PeerHandle::channel();
        let id = self.registry.register(peer);

        if let Err(e) = tunnel
            .send_open(id, &sniffed.target.host, sniffed.target.port)
            .await
        {
            warn!("Failed to open {} to {}: {}", id, sniffed.target, e);
            self.registry.remove(&id);
            return;
        }
        info!("Connection {} opened to {}", id, sniffed.target);

        if let Some(reply) = sniffed.reply {
            if let Err(e) = stream.write_all(reply).await {
                debug!("Local connection {} gone before reply: {}", id, e);
                self.finish(id).await;
                return;
            }
        }

        if !sniffed.initial_data.is_empty() && tunnel.send_data(id, &sniffed.initial_data).await.is_err() {
            self.registry.remove(&id);
            return;
        }

        let session = self.session.clone();
        let end = pump(stream, events, READ_BUFFER_SIZE, move |data| {
            let tunnel = session.sender();
            async move {
                match tunnel {
                    Some(tunnel) => tunnel.send_data(id, &data).await.is_ok(),
                    None => false,
                }
            }
        })
        .await;

        trace!("Connection {} ended: {:?}", id, end);
        if end != PumpEnd::ClosedByTunnel {
            self.finish(id).await;
        }
    }

    /// Forget `id`, telling the relay if the tunnel is up
    async fn finish(&self, id: ConnectionId) {
        if self.registry.remove(&id).is_none() {
            return;
        }
        if let Some(tunnel) = self.session.sender() {
            let _ = tunnel.send_close(id).await;
        }
        debug!("Connection {} closed", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::PeerEvent;
    use bytes::Bytes;

    #[test]
    fn test_router_ignores_unknown_ids() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = ClientRouter::new(registry.clone());
        let id = ConnectionId::from_bytes(*b"ffffffff");

        router.on_frame(Frame::Data {
            id,
            payload: Bytes::from_static(b"late"),
        });
        router.on_frame(Frame::Close { id });
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_router_delivers_then_closes() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = ClientRouter::new(registry.clone());
        let (peer, mut events) = PeerHandle::channel();
        let id = registry.register(peer);

        router.on_frame(Frame::Data {
            id,
            payload: Bytes::from_static(b"abc"),
        });
        router.on_frame(Frame::Close { id });

        assert!(matches!(events.recv().await, Some(PeerEvent::Data(d)) if &d[..] == b"abc"));
        assert!(matches!(events.recv().await, Some(PeerEvent::Close)));
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_router_drops_dead_peer() {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = ClientRouter::new(registry.clone());
        let (peer, events) = PeerHandle::channel();
        let id = registry.register(peer);
        drop(events);

        router.on_frame(Frame::Data {
            id,
            payload: Bytes::from_static(b"x"),
        });
        assert!(registry.is_empty());
    }
}
