//! Outbound half of a tunnel WebSocket
//!
//! All frames for one tunnel go through a single writer task so messages
//! from different connections never interleave mid-frame.

use super::{ConnectionId, Frame, TunnelError};
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

const WRITER_QUEUE: usize = 256;

/// Cloneable handle for queueing frames on a tunnel
#[derive(Debug, Clone)]
pub struct TunnelSender {
    tx: mpsc::Sender<Message>,
}

impl TunnelSender {
    /// Wrap an existing message queue
    pub fn from_channel(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Whether the writer task is still accepting messages
    pub fn is_active(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn send_open(&self, id: ConnectionId, host: &str, port: u16) -> Result<(), TunnelError> {
        let msg = Frame::encode_open(id, host, port)?;
        self.send(Message::Binary(msg.to_vec())).await
    }

    /// Queue a payload, split into as many Data messages as needed
    pub async fn send_data(&self, id: ConnectionId, payload: &[u8]) -> Result<(), TunnelError> {
        for msg in Frame::encode_data(id, payload) {
            self.send(Message::Binary(msg.to_vec())).await?;
        }
        Ok(())
    }

    pub async fn send_close(&self, id: ConnectionId) -> Result<(), TunnelError> {
        self.send(Message::Binary(Frame::encode_close(id).to_vec()))
            .await
    }

    /// Queue a WebSocket ping
    pub async fn ping(&self) -> Result<(), TunnelError> {
        self.send(Message::Ping(Vec::new())).await
    }

    async fn send(&self, msg: Message) -> Result<(), TunnelError> {
        self.tx.send(msg).await.map_err(|_| TunnelError::TunnelClosed)
    }
}

/// Spawn the writer task for `sink`.
///
/// The task ends when every [`TunnelSender`] is dropped or the sink fails,
/// and closes the sink on the way out.
pub fn spawn_writer<S>(mut sink: S) -> (TunnelSender, JoinHandle<()>)
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(WRITER_QUEUE);

    let task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.feed(msg).await {
                debug!("Tunnel write failed: {}", e);
                break;
            }

            // batch whatever else is already queued into one flush
            let mut failed = false;
            while let Ok(msg) = rx.try_recv() {
                if let Err(e) = sink.feed(msg).await {
                    debug!("Tunnel write failed: {}", e);
                    failed = true;
                    break;
                }
            }
            if failed {
                break;
            }

            if let Err(e) = sink.flush().await {
                debug!("Tunnel flush failed: {}", e);
                break;
            }
        }

        rx.close();
        let _ = sink.close().await;
        trace!("Tunnel writer stopped");
    });

    (TunnelSender::from_channel(tx), task)
}
