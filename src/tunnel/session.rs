//! Client side of the tunnel: one supervised WebSocket to the relay
//!
//! The session keeps at most one live link. When the link drops it waits
//! for the reconnect delay and dials again, forever. Connections registered
//! against the old link are left alone; they end when their local socket
//! does.

use super::{spawn_writer, Frame, FrameHandler, TunnelSender};
use crate::protocol::{DEFAULT_WS_PATH, KEEPALIVE_INTERVAL, RECONNECT_DELAY};
use crate::transport::{self, ClientStream, TransportError};
use bytes::BytesMut;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

/// Tunnel session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay address as host:port
    pub relay: String,
    /// WebSocket path on the relay
    pub path: String,
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
}

impl SessionConfig {
    pub fn new(relay: impl Into<String>) -> Self {
        Self {
            relay: relay.into(),
            path: DEFAULT_WS_PATH.to_string(),
            keepalive_interval: KEEPALIVE_INTERVAL,
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

/// Link state observed by connection tasks
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected(TunnelSender),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(tx) if tx.is_active())
    }
}

/// Supervised tunnel to the relay
pub struct TunnelSession {
    config: SessionConfig,
    handler: Arc<dyn FrameHandler>,
    state: watch::Sender<SessionState>,
    supervisor: OnceLock<AbortHandle>,
}

impl TunnelSession {
    /// Open the tunnel and start supervising it.
    ///
    /// The first handshake must succeed; later failures are retried. The
    /// session is already connected when this returns.
    pub async fn connect(
        config: SessionConfig,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Arc<Self>, TransportError> {
        let ws = transport::connect(&config.relay, &config.path).await?;
        info!("Tunnel established to {}{}", config.relay, config.path);

        let link = Link::attach(ws);
        let (state, _) = watch::channel(SessionState::Connected(link.sender.clone()));
        let session = Arc::new(Self {
            config,
            handler,
            state,
            supervisor: OnceLock::new(),
        });

        let task = tokio::spawn(supervise(session.clone(), link));
        let _ = session.supervisor.set(task.abort_handle());
        Ok(session)
    }

    /// Sender of the current link, if it is up
    pub fn sender(&self) -> Option<TunnelSender> {
        match &*self.state.borrow() {
            SessionState::Connected(tx) if tx.is_active() => Some(tx.clone()),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Watch link state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Stop supervising and drop the current link
    pub fn shutdown(&self) {
        if let Some(handle) = self.supervisor.get() {
            handle.abort();
        }
        self.state.send_replace(SessionState::Disconnected);
    }
}

/// One upgraded WebSocket with its writer task running
struct Link {
    stream: SplitStream<ClientStream>,
    sender: TunnelSender,
    writer: JoinHandle<()>,
}

impl Link {
    fn attach(ws: ClientStream) -> Self {
        let (sink, stream) = ws.split();
        let (sender, writer) = spawn_writer(sink);
        Self {
            stream,
            sender,
            writer,
        }
    }
}

async fn supervise(session: Arc<TunnelSession>, first: Link) {
    let mut link = first;
    loop {
        run_link(&session, link).await;
        session.state.send_replace(SessionState::Disconnected);
        warn!(
            "Tunnel to {} lost, reconnecting in {:?}",
            session.config.relay, session.config.reconnect_delay
        );
        link = reconnect(&session).await;
    }
}

/// Redial with a fixed delay until a handshake succeeds
async fn reconnect(session: &TunnelSession) -> Link {
    loop {
        tokio::time::sleep(session.config.reconnect_delay).await;
        session.state.send_replace(SessionState::Connecting);

        match transport::connect(&session.config.relay, &session.config.path).await {
            Ok(ws) => {
                info!("Tunnel re-established to {}", session.config.relay);
                let link = Link::attach(ws);
                session
                    .state
                    .send_replace(SessionState::Connected(link.sender.clone()));
                return link;
            }
            Err(e) => {
                warn!("Tunnel reconnect to {} failed: {}", session.config.relay, e);
                session.state.send_replace(SessionState::Disconnected);
            }
        }
    }
}

/// Run one link until it closes or errors
async fn run_link(session: &TunnelSession, link: Link) {
    let Link {
        mut stream,
        sender,
        writer,
    } = link;

    let period = session.config.keepalive_interval;
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                trace!("Sending keepalive ping");
                if sender.ping().await.is_err() {
                    break;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    match Frame::decode(BytesMut::from(&data[..])) {
                        Ok(frame) => session.handler.on_frame(frame),
                        Err(e) => debug!("Dropping tunnel message: {}", e),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Relay closed tunnel: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Tunnel read failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::ConnectionId;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Frame>>);

    impl FrameHandler for Collect {
        fn on_frame(&self, frame: Frame) {
            self.0.lock().unwrap().push(frame);
        }
    }

    #[tokio::test]
    async fn test_first_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TunnelSession::connect(
            SessionConfig::new(addr.to_string()),
            Arc::new(Collect::default()),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_session_delivers_frames_and_reports_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = transport::accept(stream, DEFAULT_WS_PATH).await.unwrap();
            let id = ConnectionId::from_bytes(*b"aaaabbbb");
            futures_util::SinkExt::send(
                &mut ws,
                Message::Binary(Frame::encode_close(id).to_vec()),
            )
            .await
            .unwrap();
            // hold the link open until the client goes away
            while let Some(Ok(_)) = ws.next().await {}
        });

        let handler = Arc::new(Collect::default());
        let session = TunnelSession::connect(SessionConfig::new(addr.to_string()), handler.clone())
            .await
            .unwrap();

        let mut state = session.subscribe();
        state.wait_for(|s| s.is_connected()).await.unwrap();
        assert!(session.sender().is_some());

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.0.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(handler.0.lock().unwrap()[0], Frame::Close { .. }));

        session.shutdown();
        assert!(!session.is_connected());
        relay.abort();
    }
}
