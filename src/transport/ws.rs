//! WebSocket transport over plain TCP

use super::TransportError;
use crate::protocol::HANDSHAKE_TIMEOUT;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Tunnel stream as seen by the client
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tunnel stream as seen by the relay
pub type ServerStream = WebSocketStream<TcpStream>;

/// Open the tunnel WebSocket to `relay` (host:port) at `path`
pub async fn connect(relay: &str, path: &str) -> Result<ClientStream, TransportError> {
    let url = format!("ws://{}{}", relay, path);
    debug!("Dialing tunnel {}", url);

    let (ws, response) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str()))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(handshake_error)?;

    debug!("Tunnel upgraded with status {}", response.status());
    Ok(ws)
}

/// Upgrade an accepted socket, answering 404 unless the request targets `path`
pub async fn accept(stream: TcpStream, path: &str) -> Result<ServerStream, TransportError> {
    let expected = path.to_string();
    let callback = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == expected {
            return Ok(response);
        }
        let mut reject = ErrorResponse::new(Some("not found".to_string()));
        *reject.status_mut() = StatusCode::NOT_FOUND;
        Err(reject)
    };

    tokio::time::timeout(HANDSHAKE_TIMEOUT, accept_hdr_async(stream, callback))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(handshake_error)
}

fn handshake_error(err: WsError) -> TransportError {
    match err {
        WsError::Io(e) => TransportError::Io(e),
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Http(resp) => {
            let body = resp
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            TransportError::Rejected {
                status: resp.status().as_u16(),
                body,
            }
        }
        other => TransportError::Handshake(other.to_string()),
    }
}
