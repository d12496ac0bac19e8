//! Server-side demultiplexer
//!
//! Each accepted tunnel becomes a [`ServerSession`] with its own connection
//! registry. Open frames dial destinations, Data and Close frames are routed
//! to them, and everything a session owns is closed when its tunnel ends.

use super::{pump, spawn_writer, ConnectionId, ConnectionRegistry, Frame, PeerEvent, PeerHandle, TunnelSender};
use crate::protocol::{CONNECT_TIMEOUT, DEFAULT_WS_PATH, MAX_CHUNK_SIZE, SWEEP_INTERVAL};
use crate::transport;
use bytes::BytesMut;
use dashmap::DashMap;
use futures_util::{Sink, Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn};

/// Relay settings
#[derive(Debug, Clone)]
pub struct DemuxConfig {
    /// WebSocket path tunnels must upgrade on
    pub path: String,
    pub sweep_interval: Duration,
    /// Limit for dialing a destination
    pub connect_timeout: Duration,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_WS_PATH.to_string(),
            sweep_interval: SWEEP_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Result of one liveness sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Sessions still open after the sweep
    pub sessions: usize,
    /// Destinations still registered after the sweep
    pub destinations: usize,
}

/// State of one accepted tunnel
pub struct ServerSession {
    id: u64,
    registry: ConnectionRegistry,
    out: TunnelSender,
    connect_timeout: Duration,
}

impl ServerSession {
    pub fn new(id: u64, out: TunnelSender, connect_timeout: Duration) -> Self {
        Self {
            id,
            registry: ConnectionRegistry::new(),
            out,
            connect_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Whether the tunnel's writer is still running
    pub fn is_open(&self) -> bool {
        self.out.is_active()
    }

    /// Route one frame received on this session's tunnel
    pub fn handle_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Open { id, host, port } => {
                // registered before the dial so Data racing the connect is queued
                let (peer, events) = PeerHandle::channel();
                if !self.registry.insert(id, peer.clone()) {
                    warn!("Session {}: duplicate Open for {}", self.id, id);
                    return;
                }
                let session = self.clone();
                tokio::spawn(async move {
                    session.connect_destination(id, peer, host, port, events).await;
                });
            }
            Frame::Data { id, payload } => {
                let Some(peer) = self.registry.get(&id) else {
                    trace!("Session {}: data for unknown connection {}", self.id, id);
                    return;
                };
                if !peer.deliver(payload) {
                    self.registry.remove_if(&id, |h| h.same_channel(&peer));
                }
            }
            Frame::Close { id } => {
                if let Some(peer) = self.registry.remove(&id) {
                    debug!("Session {}: client closed {}", self.id, id);
                    peer.close();
                }
            }
        }
    }

    /// Dial for `peer` and pump until either side ends.
    ///
    /// Registry updates only touch the entry while it is still `peer`, so a
    /// later Open reusing `id` is left alone.
    async fn connect_destination(
        self: Arc<Self>,
        id: ConnectionId,
        peer: PeerHandle,
        host: String,
        port: u16,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let dial = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port))).await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                info!("Session {}: connect to {}:{} failed: {}", self.id, host, port, e);
                self.abandon(id, &peer).await;
                return;
            }
            Err(_) => {
                info!("Session {}: connect to {}:{} timed out", self.id, host, port);
                self.abandon(id, &peer).await;
                return;
            }
        };

        let current = self.registry.get(&id);
        if !current.is_some_and(|h| h.same_channel(&peer)) {
            debug!("Session {}: {} closed while dialing", self.id, id);
            return;
        }
        let _ = stream.set_nodelay(true);
        info!("Session {}: {} connected to {}:{}", self.id, id, host, port);

        let out = self.out.clone();
        let end = pump(stream, events, MAX_CHUNK_SIZE, move |data| {
            let out = out.clone();
            async move { out.send_data(id, &data).await.is_ok() }
        })
        .await;

        trace!("Session {}: {} ended: {:?}", self.id, id, end);
        self.abandon(id, &peer).await;
    }

    /// Drop `peer` if it is still registered and tell the client once
    async fn abandon(&self, id: ConnectionId, peer: &PeerHandle) {
        if self.registry.remove_if(&id, |h| h.same_channel(peer)).is_some() {
            let _ = self.out.send_close(id).await;
        }
    }

    /// Close every destination this session owns
    pub fn teardown(&self) -> usize {
        let drained = self.registry.drain();
        for (_, peer) in &drained {
            peer.close();
        }
        drained.len()
    }
}

/// Stops the sweep when `serve` is dropped
struct SweepTask(JoinHandle<()>);

impl Drop for SweepTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Relay endpoint: accepts tunnels and demultiplexes their frames
pub struct Demultiplexer {
    sessions: DashMap<u64, Arc<ServerSession>>,
    next_id: AtomicU64,
    config: DemuxConfig,
}

impl Demultiplexer {
    pub fn new(config: DemuxConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &DemuxConfig {
        &self.config
    }

    /// Number of live tunnel sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Accept tunnels on `listener` forever, sweeping on the configured interval
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let demux = self.clone();
        let _sweeper = SweepTask(tokio::spawn(async move {
            let period = demux.config.sweep_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                demux.sweep();
            }
        }));

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New tunnel connection from {}", peer_addr);
                    let demux = self.clone();
                    tokio::spawn(async move {
                        demux.handle_connection(stream).await;
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Upgrade one accepted socket and run it as a tunnel session
    pub async fn handle_connection(&self, stream: TcpStream) {
        let peer_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);

        match transport::accept(stream, &self.config.path).await {
            Ok(ws) => self.run_session(ws).await,
            Err(e) => debug!("Rejected tunnel from {:?}: {}", peer_addr, e),
        }
    }

    /// Drive an upgraded tunnel until it closes
    pub async fn run_session<S>(&self, ws: S)
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();
        let (out, writer) = spawn_writer(sink);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ServerSession::new(id, out, self.config.connect_timeout));
        self.sessions.insert(id, session.clone());
        info!("Session {} opened", id);

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => match Frame::decode(BytesMut::from(&data[..])) {
                    Ok(frame) => session.handle_frame(frame),
                    Err(e) => debug!("Session {}: dropping message: {}", id, e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Session {}: read failed: {}", id, e);
                    break;
                }
            }
        }

        writer.abort();
        self.sessions.remove(&id);
        let closed = session.teardown();
        info!("Session {} closed, {} destinations dropped", id, closed);
    }

    /// Drop closed sessions and dead destinations, and log what is left
    pub fn sweep(&self) -> SweepStats {
        let mut stale = Vec::new();
        self.sessions.retain(|_, session| {
            if session.is_open() {
                true
            } else {
                stale.push(session.clone());
                false
            }
        });
        for session in stale {
            session.teardown();
        }

        let mut stats = SweepStats::default();
        for entry in self.sessions.iter() {
            let session = entry.value();
            session.registry().retain(|peer| peer.is_active());
            stats.sessions += 1;
            stats.destinations += session.registry().len();
        }

        info!(
            "Sweep: {} sessions, {} destinations",
            stats.sessions, stats.destinations
        );
        stats
    }
}
