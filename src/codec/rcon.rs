//! Source RCON wire format.
//!
//! Every packet on the TCP stream is:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬────────────┬──────┐
//! │ size     │ id       │ type     │ body       │ 0 0  │
//! │ int32 LE │ int32 LE │ int32 LE │ ASCII      │      │
//! └──────────┴──────────┴──────────┴────────────┴──────┘
//! ```
//!
//! `size` counts the bytes after itself: 10 plus the body length. Types 2
//! and 3 are overloaded by direction; an inbound type 2 is an auth response,
//! an outbound type 2 executes a command.
//!
//! [`RconStream`] accumulates partial reads off the socket and yields
//! complete packets, rejecting frames whose declared size is out of range
//! before buffering them.

use bytes::{Bytes, BytesMut};

use crate::error::RconError;

/// Fixed overhead counted by the size field: id + type + two NULs.
pub const PACKET_OVERHEAD: usize = 10;

/// Size-field width on the wire.
const SIZE_FIELD: usize = 4;

/// Minimum legal value of the size field.
pub const MIN_FRAME_SIZE: usize = PACKET_OVERHEAD;

/// Packet type constants.
pub mod packet_type {
    /// Server: command output or sentinel echo.
    pub const RESPONSE_VALUE: i32 = 0;
    /// Client: execute a command.
    pub const EXECCOMMAND: i32 = 2;
    /// Server: authentication verdict. Same value as EXECCOMMAND; the
    /// direction disambiguates.
    pub const AUTH_RESPONSE: i32 = 2;
    /// Client: authenticate.
    pub const AUTH: i32 = 3;
}

/// Request id a server uses to signal auth rejection.
pub const AUTH_FAILURE_ID: i32 = -1;

/// One RCON packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconPacket {
    /// Caller-chosen correlation id.
    pub id: i32,
    /// Packet type; see [`packet_type`].
    pub packet_type: i32,
    /// Body bytes, trailing NULs stripped.
    pub body: Bytes,
}

impl RconPacket {
    /// Client AUTH packet.
    pub fn auth(id: i32, password: &str) -> Self {
        Self {
            id,
            packet_type: packet_type::AUTH,
            body: Bytes::copy_from_slice(password.as_bytes()),
        }
    }

    /// Client EXECCOMMAND packet.
    pub fn exec(id: i32, command: &str) -> Self {
        Self {
            id,
            packet_type: packet_type::EXECCOMMAND,
            body: Bytes::copy_from_slice(command.as_bytes()),
        }
    }

    /// Empty RESPONSE_VALUE used as the end-of-reply sentinel.
    pub fn sentinel(id: i32) -> Self {
        Self {
            id,
            packet_type: packet_type::RESPONSE_VALUE,
            body: Bytes::new(),
        }
    }

    /// Encode to wire bytes, size field included.
    pub fn encode(&self) -> Bytes {
        let size = PACKET_OVERHEAD + self.body.len();
        let mut buf = Vec::with_capacity(SIZE_FIELD + size);
        buf.extend_from_slice(&(size as i32).to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.packet_type.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf.extend_from_slice(&[0, 0]);
        Bytes::from(buf)
    }

    /// Decode the bytes the size field counted.
    fn decode_frame(frame: &[u8]) -> Result<Self, RconError> {
        debug_assert!(frame.len() >= PACKET_OVERHEAD);
        let id = i32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let packet_type = i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        // The last two bytes are the body and empty-string terminators;
        // servers disagree about padding, so only the declared length is
        // trusted.
        let body = Bytes::copy_from_slice(&frame[8..frame.len() - 2]);
        Ok(Self {
            id,
            packet_type,
            body,
        })
    }

    /// Body as lossy UTF-8.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Whether the body is empty.
    #[inline]
    pub fn is_empty_body(&self) -> bool {
        self.body.is_empty()
    }
}

/// Parsing state for the stream accumulator.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Need the 4-byte size field.
    WaitingForSize,
    /// Size parsed, need that many more bytes.
    WaitingForFrame { size: usize },
}

/// Accumulates TCP bytes and extracts complete RCON packets.
///
/// One per connection, owned by the session manager's inbound path. A frame
/// declaring `size < 10` or `size > max_frame_bytes` is a protocol
/// violation; the caller is expected to drop the connection.
pub struct RconStream {
    buffer: BytesMut,
    state: State,
    max_frame_bytes: usize,
}

impl RconStream {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            state: State::WaitingForSize,
            max_frame_bytes,
        }
    }

    /// Push socket bytes and extract every complete packet.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<RconPacket>, RconError> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        while let Some(packet) = self.try_extract_one()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    fn try_extract_one(&mut self) -> Result<Option<RconPacket>, RconError> {
        match self.state {
            State::WaitingForSize => {
                if self.buffer.len() < SIZE_FIELD {
                    return Ok(None);
                }
                let declared = i32::from_le_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]);

                if declared < MIN_FRAME_SIZE as i32 || declared as usize > self.max_frame_bytes {
                    return Err(RconError::Framing(format!(
                        "frame size {declared} outside [{MIN_FRAME_SIZE}, {}]",
                        self.max_frame_bytes
                    )));
                }

                let _ = self.buffer.split_to(SIZE_FIELD);
                self.state = State::WaitingForFrame {
                    size: declared as usize,
                };
                self.try_extract_one()
            }
            State::WaitingForFrame { size } => {
                if self.buffer.len() < size {
                    return Ok(None);
                }
                let frame = self.buffer.split_to(size);
                self.state = State::WaitingForSize;
                RconPacket::decode_frame(&frame).map(Some)
            }
        }
    }

    /// Buffered byte count, for diagnostics.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_auth_packet_layout() {
        let bytes = RconPacket::auth(42, "hunter2").encode();

        // size = 10 + 7
        assert_eq!(&bytes[0..4], &17i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &42i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &3i32.to_le_bytes());
        assert_eq!(&bytes[12..19], b"hunter2");
        assert_eq!(&bytes[19..], &[0, 0]);
    }

    #[test]
    fn test_encode_sentinel_is_minimal() {
        let bytes = RconPacket::sentinel(7).encode();
        assert_eq!(bytes.len(), SIZE_FIELD + MIN_FRAME_SIZE);
        assert_eq!(&bytes[0..4], &10i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0i32.to_le_bytes());
    }

    #[test]
    fn test_stream_roundtrip_single_packet() {
        let mut stream = RconStream::new(4096);
        let packet = RconPacket::exec(7, "status");

        let packets = stream.push(&packet.encode()).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].id, 7);
        assert_eq!(packets[0].packet_type, packet_type::EXECCOMMAND);
        assert_eq!(packets[0].body_text(), "status");
        assert_eq!(stream.buffered(), 0);
    }

    #[test]
    fn test_stream_multiple_packets_one_push() {
        let mut stream = RconStream::new(4096);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&RconPacket::exec(1, "a").encode());
        bytes.extend_from_slice(&RconPacket::exec(2, "bb").encode());
        bytes.extend_from_slice(&RconPacket::sentinel(2).encode());

        let packets = stream.push(&bytes).unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].id, 1);
        assert_eq!(packets[1].body_text(), "bb");
        assert!(packets[2].is_empty_body());
    }

    #[test]
    fn test_stream_byte_at_a_time() {
        let mut stream = RconStream::new(4096);
        let bytes = RconPacket::exec(9, "say hi").encode();

        let mut collected = Vec::new();
        for byte in &bytes {
            collected.extend(stream.push(&[*byte]).unwrap());
        }

        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].body_text(), "say hi");
    }

    #[test]
    fn test_stream_partial_then_rest() {
        let mut stream = RconStream::new(4096);
        let bytes = RconPacket::exec(5, "longer command body").encode();

        assert!(stream.push(&bytes[..6]).unwrap().is_empty());
        let packets = stream.push(&bytes[6..]).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].body_text(), "longer command body");
    }

    #[test]
    fn test_stream_rejects_undersized_frame() {
        let mut stream = RconStream::new(4096);
        let bytes = 9i32.to_le_bytes();
        assert!(matches!(
            stream.push(&bytes),
            Err(RconError::Framing(_))
        ));
    }

    #[test]
    fn test_stream_rejects_oversized_frame() {
        let mut stream = RconStream::new(4096);
        let bytes = 5000i32.to_le_bytes();
        assert!(matches!(
            stream.push(&bytes),
            Err(RconError::Framing(_))
        ));
    }

    #[test]
    fn test_stream_rejects_negative_size() {
        let mut stream = RconStream::new(4096);
        let bytes = (-1i32).to_le_bytes();
        assert!(matches!(
            stream.push(&bytes),
            Err(RconError::Framing(_))
        ));
    }

    #[test]
    fn test_auth_response_decode() {
        // Server auth verdict: type 2, id echoes the request (or -1).
        let mut raw = Vec::new();
        raw.extend_from_slice(&10i32.to_le_bytes());
        raw.extend_from_slice(&(-1i32).to_le_bytes());
        raw.extend_from_slice(&packet_type::AUTH_RESPONSE.to_le_bytes());
        raw.extend_from_slice(&[0, 0]);

        let mut stream = RconStream::new(4096);
        let packets = stream.push(&raw).unwrap();
        assert_eq!(packets[0].id, AUTH_FAILURE_ID);
        assert_eq!(packets[0].packet_type, packet_type::AUTH_RESPONSE);
        assert!(packets[0].is_empty_body());
    }

    #[test]
    fn test_known_pad_body_survives_decode() {
        // The observed terminator pad must come through byte-exact.
        let pad = RconPacket {
            id: 7,
            packet_type: packet_type::RESPONSE_VALUE,
            body: Bytes::from_static(b"\x00\x01\x00\x00"),
        };
        let mut stream = RconStream::new(4096);
        let packets = stream.push(&pad.encode()).unwrap();
        assert_eq!(&packets[0].body[..], b"\x00\x01\x00\x00");
    }
}
