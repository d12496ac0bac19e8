//! Transparent HTTP sniffing
//!
//! Reads just enough of a fresh connection to learn where it is going:
//! the request line for `CONNECT`, or the `Host` header otherwise.

use super::{ProxyError, Sniffed, Target, TargetSniffer};
use crate::protocol::{HTTPS_DEFAULT_PORT, HTTP_DEFAULT_PORT, MAX_HEADER_SIZE, MAX_INITIAL_LINE_LENGTH, SNIFF_TIMEOUT};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Response sent to a client whose CONNECT was accepted
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Parsed HTTP request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Bytes taken by the line including its terminator
    pub consumed: usize,
}

/// HTTP sniffer for local connections
#[derive(Debug, Clone)]
pub struct HttpSniffer {
    timeout: Duration,
}

impl Default for HttpSniffer {
    fn default() -> Self {
        Self {
            timeout: SNIFF_TIMEOUT,
        }
    }
}

impl HttpSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Read until the end of the header block, a full window, or EOF
    async fn read_head(stream: &mut TcpStream) -> Result<BytesMut, ProxyError> {
        let mut buf = BytesMut::with_capacity(MAX_HEADER_SIZE);
        let mut chunk = [0u8; 2048];

        loop {
            if header_end(&buf).is_some() || buf.len() >= MAX_HEADER_SIZE {
                return Ok(buf);
            }

            let want = (MAX_HEADER_SIZE - buf.len()).min(chunk.len());
            let n = stream.read(&mut chunk[..want]).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Err(ProxyError::Closed);
                }
                return Ok(buf);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn classify(buf: BytesMut) -> Result<Sniffed, ProxyError> {
        let line = match split_initial_line(&buf) {
            Some(line) => line,
            None if buf.len() >= MAX_INITIAL_LINE_LENGTH => {
                return Err(ProxyError::HeaderTooLarge(MAX_INITIAL_LINE_LENGTH))
            }
            None => {
                return Err(ProxyError::InvalidRequest(
                    String::from_utf8_lossy(&buf).into_owned(),
                ))
            }
        };

        let header_end = header_end(&buf);

        if line.method.eq_ignore_ascii_case("CONNECT") {
            let target = Target::parse(&line.target, HTTPS_DEFAULT_PORT)?;
            let initial_data = match header_end {
                Some(end) => buf.freeze().slice(end..),
                None => Bytes::new(),
            };
            debug!("CONNECT request for {}", target);
            return Ok(Sniffed {
                target,
                initial_data,
                reply: Some(CONNECT_ESTABLISHED),
            });
        }

        // a window cut mid-header only yields its complete lines
        let region_end = header_end
            .or_else(|| buf.iter().rposition(|&b| b == b'\n').map(|pos| pos + 1))
            .unwrap_or(line.consumed)
            .max(line.consumed);
        let host = find_header(&buf[line.consumed..region_end], "host").ok_or(ProxyError::MissingHost)?;
        let target = Target::parse(&host, HTTP_DEFAULT_PORT)?;
        debug!("{} request for {}", line.method, target);

        Ok(Sniffed {
            target,
            initial_data: buf.freeze(),
            reply: None,
        })
    }
}

#[async_trait]
impl TargetSniffer for HttpSniffer {
    async fn sniff(&self, stream: &mut TcpStream) -> Result<Sniffed, ProxyError> {
        let buf = tokio::time::timeout(self.timeout, Self::read_head(stream))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        Self::classify(buf)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Split the first line of `buf` into method, target and version.
///
/// Only the first `MAX_INITIAL_LINE_LENGTH` bytes are examined.
pub fn split_initial_line(buf: &[u8]) -> Option<RequestLine> {
    let window = &buf[..buf.len().min(MAX_INITIAL_LINE_LENGTH)];
    let newline = window.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&window[..newline]).ok()?.trim_end_matches('\r');

    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    let version = parts.next()?.to_string();

    Some(RequestLine {
        method,
        target,
        version,
        consumed: newline + 1,
    })
}

/// Value of header `name` (case-insensitive) within a header region.
///
/// Scanning stops at the first empty line. Folded continuation lines are
/// joined with a single space.
pub fn find_header(region: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(region);
    let mut value: Option<String> = None;

    for raw in text.split('\n') {
        let line = raw.trim_end_matches('\r');

        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(v) = value.as_mut() {
                v.push(' ');
                v.push_str(line.trim());
            }
            continue;
        }
        if value.is_some() || line.is_empty() {
            break;
        }

        if let Some((key, rest)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                value = Some(rest.trim().to_string());
            }
        }
    }

    value
}

/// Split `host[:port]`, using `default_port` when no port is given.
///
/// Bracketed IPv6 literals are unwrapped; a bare IPv6 literal is taken as a
/// host without a port.
pub fn parse_host_port(s: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let s = s.trim();
    let invalid = || ProxyError::InvalidAddress(s.to_string());

    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
        match after {
            "" => (host, None),
            _ => (host, Some(after.strip_prefix(':').ok_or_else(invalid)?)),
        }
    } else {
        match s.matches(':').count() {
            0 => (s, None),
            1 => {
                let (host, port) = s.split_once(':').ok_or_else(invalid)?;
                (host, Some(port))
            }
            _ => (s, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}

/// Offset just past the blank line ending the header block.
///
/// Accepts `\r\n\r\n` as well as bare-LF line endings.
fn header_end(buf: &[u8]) -> Option<usize> {
    buf.iter().enumerate().find_map(|(pos, &b)| {
        if b != b'\n' {
            return None;
        }
        match &buf[pos + 1..] {
            [b'\n', ..] => Some(pos + 2),
            [b'\r', b'\n', ..] => Some(pos + 3),
            _ => None,
        }
    })
}
