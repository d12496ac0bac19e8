//! Frame encoding/decoding for the tunnel protocol
//!
//! Every WebSocket binary message carries exactly one frame:
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |                   Connection ID (8 ASCII bytes)                       |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |          Control (i32 BE)         |        Payload (rest of message)  |
//! +--------+--------+--------+--------+-----------------------------------+
//! ```
//!
//! `control == 0` with a payload is an Open, `control == 2` followed by two
//! zero bytes is a Close, anything else is Data. For Data the control field
//! is only a hint; the payload always runs to the end of the message.

use super::TunnelError;
use crate::obfuscation;
use crate::protocol::{CONTROL_CLOSE, CONTROL_OPEN, FRAME_HEADER_SIZE, ID_LEN, MAX_CHUNK_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Identifier of one logical connection
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId([u8; ID_LEN]);

impl ConnectionId {
    /// Generate a random identifier of 8 lowercase hex characters
    pub fn generate() -> Self {
        let value: u32 = rand::random();
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(format!("{:08x}", value).as_bytes());
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Scrambling seed for every frame tagged with this identifier
    pub fn seed(&self) -> u8 {
        obfuscation::seed(&self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

/// A decoded tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Ask the relay to dial a destination
    Open {
        id: ConnectionId,
        host: String,
        port: u16,
    },
    /// Payload bytes, already unscrambled
    Data { id: ConnectionId, payload: Bytes },
    /// The connection is gone on the sending side
    Close { id: ConnectionId },
}

impl Frame {
    /// Identifier the frame is tagged with
    pub fn id(&self) -> ConnectionId {
        match self {
            Frame::Open { id, .. } | Frame::Data { id, .. } | Frame::Close { id } => *id,
        }
    }

    /// Encode an Open frame
    pub fn encode_open(id: ConnectionId, host: &str, port: u16) -> Result<Bytes, TunnelError> {
        let host_len = host.len();
        if host_len > u8::MAX as usize {
            return Err(TunnelError::HostTooLong(host_len));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 1 + host_len + 2);
        buf.put_slice(id.as_bytes());
        buf.put_i32(CONTROL_OPEN);
        buf.put_u8(host_len as u8);
        buf.put_slice(host.as_bytes());
        buf.put_u16(port);

        obfuscation::apply(&mut buf[FRAME_HEADER_SIZE..], id.seed());
        Ok(buf.freeze())
    }

    /// Encode a Close frame. Close frames are never scrambled.
    pub fn encode_close(id: ConnectionId) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 2);
        buf.put_slice(id.as_bytes());
        buf.put_i32(CONTROL_CLOSE);
        buf.put_u16(0);
        buf.freeze()
    }

    /// Encode a payload as one or more Data messages.
    ///
    /// The payload is scrambled once and cut into chunks of at most
    /// `MAX_CHUNK_SIZE` bytes. Each message's control field holds the number
    /// of bytes still unsent before that chunk, so only the last chunk's
    /// control equals its own length. A hint that would equal a sentinel is
    /// replaced by [`DATA_CONTROL_FALLBACK`]. Receivers ignore it either way.
    pub fn encode_data(id: ConnectionId, payload: &[u8]) -> Vec<Bytes> {
        if payload.is_empty() {
            return Vec::new();
        }

        let mut body = BytesMut::from(payload);
        obfuscation::apply(&mut body, id.seed());

        let mut messages = Vec::with_capacity(payload.len().div_ceil(MAX_CHUNK_SIZE));
        while !body.is_empty() {
            let remaining = body.len();
            let chunk = body.split_to(remaining.min(MAX_CHUNK_SIZE));

            let mut msg = BytesMut::with_capacity(FRAME_HEADER_SIZE + chunk.len());
            msg.put_slice(id.as_bytes());
            msg.put_i32(data_control(remaining));
            msg.put_slice(&chunk);
            messages.push(msg.freeze());
        }
        messages
    }

    /// Decode one tunnel message.
    ///
    /// Malformed Open payloads fall back to Data; only messages too short to
    /// hold a header are rejected.
    pub fn decode(mut buf: BytesMut) -> Result<Self, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TunnelError::InvalidFrame(format!(
                "message too short: {} bytes",
                buf.len()
            )));
        }

        let mut raw_id = [0u8; ID_LEN];
        raw_id.copy_from_slice(&buf[..ID_LEN]);
        let id = ConnectionId::from_bytes(raw_id);
        buf.advance(ID_LEN);
        let control = buf.get_i32();

        if control == CONTROL_CLOSE && buf[..] == [0, 0] {
            return Ok(Frame::Close { id });
        }

        if control == CONTROL_OPEN && !buf.is_empty() {
            if let Some((host, port)) = decode_open_payload(&buf, id.seed()) {
                return Ok(Frame::Open { id, host, port });
            }
        }

        obfuscation::apply(&mut buf, id.seed());
        Ok(Frame::Data {
            id,
            payload: buf.freeze(),
        })
    }
}

/// Control written instead of a Data hint that collides with a sentinel
pub const DATA_CONTROL_FALLBACK: i32 = -1;

/// Control field for a Data message, never `CONTROL_OPEN` or `CONTROL_CLOSE`
fn data_control(remaining: usize) -> i32 {
    match i32::try_from(remaining) {
        Ok(CONTROL_OPEN) | Ok(CONTROL_CLOSE) | Err(_) => DATA_CONTROL_FALLBACK,
        Ok(hint) => hint,
    }
}

/// Parse `hostLen | host | port` from a scrambled Open payload
fn decode_open_payload(scrambled: &[u8], seed: u8) -> Option<(String, u16)> {
    let mut payload = scrambled.to_vec();
    obfuscation::apply(&mut payload, seed);

    let host_len = *payload.first()? as usize;
    if payload.len() < 1 + host_len + 2 {
        return None;
    }
    let host = String::from_utf8_lossy(&payload[1..1 + host_len]).into_owned();
    let port = u16::from_be_bytes([payload[1 + host_len], payload[2 + host_len]]);
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_MESSAGE_SIZE;

    fn id(s: &[u8; 8]) -> ConnectionId {
        ConnectionId::from_bytes(*s)
    }

    #[test]
    fn test_generated_id_is_hex() {
        let id = ConnectionId::generate();
        assert!(id.as_bytes().iter().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(id.to_string().len(), 8);
    }

    #[test]
    fn test_open_roundtrip() {
        let conn = id(b"1f2e3d4c");
        for (host, port) in [("example.com", 443u16), ("10.0.0.1", 22), ("", 0)] {
            let encoded = Frame::encode_open(conn, host, port).unwrap();
            let decoded = Frame::decode(BytesMut::from(&encoded[..])).unwrap();
            assert_eq!(
                decoded,
                Frame::Open {
                    id: conn,
                    host: host.to_string(),
                    port
                }
            );
        }
    }

    #[test]
    fn test_open_max_host_length() {
        let conn = id(b"aaaaaaaa");
        let host = "h".repeat(255);
        let encoded = Frame::encode_open(conn, &host, 8080).unwrap();
        match Frame::decode(BytesMut::from(&encoded[..])).unwrap() {
            Frame::Open { host: h, port, .. } => {
                assert_eq!(h, host);
                assert_eq!(port, 8080);
            }
            other => panic!("expected open, got {:?}", other),
        }

        let too_long = "h".repeat(256);
        assert!(matches!(
            Frame::encode_open(conn, &too_long, 80),
            Err(TunnelError::HostTooLong(256))
        ));
    }

    #[test]
    fn test_open_payload_is_scrambled() {
        let conn = id(b"0123abcd");
        let encoded = Frame::encode_open(conn, "example.com", 80).unwrap();
        assert_eq!(&encoded[..8], b"0123abcd");
        assert_eq!(&encoded[8..12], &[0, 0, 0, 0]);
        assert_eq!(encoded[12], 11 ^ b'3');
        assert!(!encoded.windows(11).any(|w| w == b"example.com"));
    }

    #[test]
    fn test_close_layout() {
        let conn = id(b"deadbeef");
        let encoded = Frame::encode_close(conn);
        assert_eq!(&encoded[..], b"deadbeef\x00\x00\x00\x02\x00\x00");
        assert_eq!(
            Frame::decode(BytesMut::from(&encoded[..])).unwrap(),
            Frame::Close { id: conn }
        );
    }

    #[test]
    fn test_small_data_single_message() {
        let conn = id(b"cafebabe");
        let messages = Frame::encode_data(conn, b"hello");
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][8..12], &5i32.to_be_bytes());

        let decoded = Frame::decode(BytesMut::from(&messages[0][..])).unwrap();
        assert_eq!(
            decoded,
            Frame::Data {
                id: conn,
                payload: Bytes::from_static(b"hello")
            }
        );
    }

    #[test]
    fn test_large_data_is_chunked_and_reassembled() {
        let conn = id(b"12345678");
        let payload: Vec<u8> = (0..3 * MAX_CHUNK_SIZE + 100).map(|i| (i % 251) as u8).collect();

        let messages = Frame::encode_data(conn, &payload);
        assert_eq!(messages.len(), 4);
        assert!(messages.iter().all(|m| m.len() <= MAX_MESSAGE_SIZE));

        // control carries the bytes remaining before each chunk
        let controls: Vec<i32> = messages
            .iter()
            .map(|m| i32::from_be_bytes([m[8], m[9], m[10], m[11]]))
            .collect();
        assert_eq!(
            controls,
            vec![
                payload.len() as i32,
                (payload.len() - MAX_CHUNK_SIZE) as i32,
                (payload.len() - 2 * MAX_CHUNK_SIZE) as i32,
                100
            ]
        );

        let mut reassembled = Vec::new();
        for msg in messages {
            match Frame::decode(BytesMut::from(&msg[..])).unwrap() {
                Frame::Data { id: got, payload } => {
                    assert_eq!(got, conn);
                    reassembled.extend_from_slice(&payload);
                }
                other => panic!("expected data, got {:?}", other),
            }
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_two_seed_bytes_stay_data() {
        let conn = id(b"abcdefgh");
        let messages = Frame::encode_data(conn, b"dd");
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][8..12], &DATA_CONTROL_FALLBACK.to_be_bytes());
        assert_eq!(
            Frame::decode(BytesMut::from(&messages[0][..])).unwrap(),
            Frame::Data {
                id: conn,
                payload: Bytes::from_static(b"dd")
            }
        );
    }

    #[test]
    fn test_two_byte_tail_chunk_stays_data() {
        let conn = id(b"abcdefgh");
        let mut payload = vec![b'x'; MAX_CHUNK_SIZE];
        payload.extend_from_slice(b"dd");

        let messages = Frame::encode_data(conn, &payload);
        assert_eq!(messages.len(), 2);
        match Frame::decode(BytesMut::from(&messages[1][..])).unwrap() {
            Frame::Data { payload, .. } => assert_eq!(&payload[..], b"dd"),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_data_produces_nothing() {
        assert!(Frame::encode_data(id(b"00000000"), b"").is_empty());
    }

    #[test]
    fn test_short_message_rejected() {
        assert!(matches!(
            Frame::decode(BytesMut::from(&b"abcd"[..])),
            Err(TunnelError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_truncated_open_falls_back_to_data() {
        let conn = id(b"abcdefgh");
        let mut raw = BytesMut::new();
        raw.put_slice(conn.as_bytes());
        raw.put_i32(0);
        // declares a 20 byte host but carries only three bytes
        raw.put_slice(&[20 ^ b'd', b'x' ^ b'd', b'y' ^ b'd']);

        match Frame::decode(raw).unwrap() {
            Frame::Data { payload, .. } => assert_eq!(&payload[..], &[20, b'x', b'y']),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_control_is_ignored_for_data() {
        let conn = id(b"abcdefgh");
        let mut raw = BytesMut::new();
        raw.put_slice(conn.as_bytes());
        raw.put_i32(9999);
        raw.put_slice(&[b'h' ^ b'd', b'i' ^ b'd']);

        match Frame::decode(raw).unwrap() {
            Frame::Data { payload, .. } => assert_eq!(&payload[..], b"hi"),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_close_control_with_nonzero_payload_is_data() {
        let conn = id(b"abcdefgh");
        let mut raw = BytesMut::new();
        raw.put_slice(conn.as_bytes());
        raw.put_i32(2);
        raw.put_slice(&[1, 2]);
        assert!(matches!(Frame::decode(raw).unwrap(), Frame::Data { .. }));
    }
}
