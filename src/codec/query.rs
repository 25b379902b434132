//! Source Query wire format.
//!
//! Every datagram starts with a 4-byte outer header:
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ -1 (int32) │ response header + payload    │  single packet
//! │ -2 (int32) │ split-packet fragment        │  see `split`
//! └────────────┴──────────────────────────────┘
//! ```
//!
//! Inside a single packet, one header byte selects the response kind
//! (INFO 0x49, PLAYERS 0x44, RULES 0x45, CHALLENGE 0x41). All multi-byte
//! integers are little-endian; strings are NUL-terminated and decoded as
//! UTF-8 with invalid bytes replaced.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::CodecError;
use crate::request::RequestPayload;
use crate::response::{Player, ServerInfo};

use super::split::SplitFragment;

/// Outer header of a single-packet datagram.
pub const SINGLE_PACKET: i32 = -1;

/// Outer header of a split-packet fragment.
pub const SPLIT_PACKET: i32 = -2;

/// Challenge placeholder sent on the first PLAYERS/RULES attempt.
pub const DEFAULT_CHALLENGE: i32 = -1;

/// Request and response header bytes.
pub mod headers {
    /// A2S_INFO request.
    pub const INFO_REQUEST: u8 = 0x54;
    /// A2S_PLAYER request.
    pub const PLAYERS_REQUEST: u8 = 0x55;
    /// A2S_RULES request.
    pub const RULES_REQUEST: u8 = 0x56;
    /// A2S_INFO response.
    pub const INFO_RESPONSE: u8 = 0x49;
    /// A2S_PLAYER response.
    pub const PLAYERS_RESPONSE: u8 = 0x44;
    /// A2S_RULES response.
    pub const RULES_RESPONSE: u8 = 0x45;
    /// S2C_CHALLENGE response.
    pub const CHALLENGE_RESPONSE: u8 = 0x41;
}

/// Payload string of the A2S_INFO request.
const INFO_REQUEST_BODY: &[u8] = b"Source Engine Query\0";

/// A decoded outer frame.
#[derive(Debug, Clone)]
pub enum OuterFrame {
    /// Single packet: response header byte plus payload.
    Single(Bytes),
    /// One fragment of a split packet.
    Split(SplitFragment),
}

/// A decoded inner response.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    Info(ServerInfo),
    Players(Vec<Player>),
    Rules(HashMap<String, String>),
    /// Anti-spoofing token; the request must be re-sent carrying it.
    Challenge(i32),
}

/// Checked little-endian reader over a response body.
///
/// Every accessor fails with [`CodecError::ShortRead`] instead of panicking
/// when the buffer runs out.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.remaining() < n {
            Err(CodecError::ShortRead {
                needed: n - self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn u16_le(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub fn i32_le(&mut self) -> Result<i32, CodecError> {
        self.need(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(i32::from_le_bytes(bytes))
    }

    pub fn u64_le(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn f32_le(&mut self) -> Result<f32, CodecError> {
        self.need(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(f32::from_le_bytes(bytes))
    }

    /// NUL-terminated string, invalid UTF-8 replaced.
    pub fn cstring(&mut self) -> Result<String, CodecError> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.buf.len() {
            return Err(CodecError::ShortRead { needed: 1 });
        }
        let s = String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned();
        self.pos += 1; // consume the NUL
        Ok(s)
    }
}

/// Encode a UDP query request into a datagram.
///
/// # Panics
///
/// Debug-asserts that the payload is a query variant; RCON payloads are
/// encoded by the RCON codec.
pub fn encode_request(payload: &RequestPayload) -> Bytes {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&SINGLE_PACKET.to_le_bytes());
    match payload {
        RequestPayload::Info => {
            buf.push(headers::INFO_REQUEST);
            buf.extend_from_slice(INFO_REQUEST_BODY);
        }
        RequestPayload::Players { challenge } => {
            buf.push(headers::PLAYERS_REQUEST);
            buf.extend_from_slice(&challenge.to_le_bytes());
        }
        RequestPayload::Rules { challenge } => {
            buf.push(headers::RULES_REQUEST);
            buf.extend_from_slice(&challenge.to_le_bytes());
        }
        other => {
            debug_assert!(false, "not a query payload: {:?}", other);
        }
    }
    Bytes::from(buf)
}

/// Decode the outer framing of one datagram.
pub fn decode_datagram(datagram: &[u8]) -> Result<OuterFrame, CodecError> {
    let mut reader = ByteReader::new(datagram);
    match reader.i32_le()? {
        SINGLE_PACKET => Ok(OuterFrame::Single(Bytes::copy_from_slice(
            &datagram[4..],
        ))),
        SPLIT_PACKET => Ok(OuterFrame::Split(SplitFragment::decode(&datagram[4..])?)),
        other => Err(CodecError::Framing(format!(
            "unknown outer header {other:#010X}"
        ))),
    }
}

/// Decode a single-packet body (response header byte included).
pub fn decode_response(body: &[u8]) -> Result<QueryResponse, CodecError> {
    let mut reader = ByteReader::new(body);
    match reader.u8()? {
        headers::INFO_RESPONSE => Ok(QueryResponse::Info(decode_info(&mut reader)?)),
        headers::PLAYERS_RESPONSE => Ok(QueryResponse::Players(decode_players(&mut reader)?)),
        headers::RULES_RESPONSE => Ok(QueryResponse::Rules(decode_rules(&mut reader)?)),
        headers::CHALLENGE_RESPONSE => Ok(QueryResponse::Challenge(reader.i32_le()?)),
        other => Err(CodecError::UnknownHeader(other)),
    }
}

fn decode_info(reader: &mut ByteReader<'_>) -> Result<ServerInfo, CodecError> {
    let protocol = reader.u8()?;
    let name = reader.cstring()?;
    let map = reader.cstring()?;
    let folder = reader.cstring()?;
    let game = reader.cstring()?;
    let app_id = reader.u16_le()?;
    let players = reader.u8()?;
    let max_players = reader.u8()?;
    let bots = reader.u8()?;
    let server_type = reader.u8()? as char;
    let environment = reader.u8()? as char;
    let password_protected = reader.u8()? == 1;
    let vac_enabled = reader.u8()? == 1;
    let version = reader.cstring()?;

    // Everything past here is optional; old engines stop at `version`.
    let edf = if reader.remaining() > 0 { reader.u8()? } else { 0 };

    let port = if edf & 0x80 != 0 {
        Some(reader.u16_le()?)
    } else {
        None
    };
    let steam_id = if edf & 0x10 != 0 {
        Some(reader.u64_le()?)
    } else {
        None
    };
    let (stv_port, stv_name) = if edf & 0x40 != 0 {
        (Some(reader.u16_le()?), Some(reader.cstring()?))
    } else {
        (None, None)
    };
    let keywords = if edf & 0x20 != 0 {
        Some(reader.cstring()?)
    } else {
        None
    };
    let game_id = if edf & 0x01 != 0 {
        Some(reader.u64_le()?)
    } else {
        None
    };

    Ok(ServerInfo {
        protocol,
        name,
        map,
        folder,
        game,
        app_id,
        players,
        max_players,
        bots,
        server_type,
        environment,
        password_protected,
        vac_enabled,
        version,
        edf,
        port,
        steam_id,
        stv_port,
        stv_name,
        keywords,
        game_id,
    })
}

fn decode_players(reader: &mut ByteReader<'_>) -> Result<Vec<Player>, CodecError> {
    let count = reader.u8()?;
    let mut players = Vec::with_capacity(count as usize);
    for _ in 0..count {
        players.push(Player {
            index: reader.u8()?,
            name: reader.cstring()?,
            score: reader.i32_le()?,
            duration: reader.f32_le()?,
        });
    }
    Ok(players)
}

fn decode_rules(reader: &mut ByteReader<'_>) -> Result<HashMap<String, String>, CodecError> {
    let count = reader.u16_le()?;
    let mut rules = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = reader.cstring()?;
        let value = reader.cstring()?;
        rules.insert(key, value);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestPayload;

    /// Build a well-formed A2S_INFO response body.
    fn info_body() -> Vec<u8> {
        let mut body = vec![headers::INFO_RESPONSE, 0x11];
        body.extend_from_slice(b"Test\0");
        body.extend_from_slice(b"de_dust2\0");
        body.extend_from_slice(b"csgo\0");
        body.extend_from_slice(b"Counter-Strike: Global Offensive\0");
        body.extend_from_slice(&730u16.to_le_bytes());
        body.extend_from_slice(&[16, 32, 0, b'd', b'l', 0, 1]);
        body.extend_from_slice(b"1.38.7.9\0");
        body
    }

    #[test]
    fn test_encode_info_request_exact_bytes() {
        let bytes = encode_request(&RequestPayload::Info);
        let mut expected = vec![0xFF, 0xFF, 0xFF, 0xFF, 0x54];
        expected.extend_from_slice(b"Source Engine Query\0");
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn test_encode_players_request_default_challenge() {
        let bytes = encode_request(&RequestPayload::Players {
            challenge: DEFAULT_CHALLENGE,
        });
        assert_eq!(
            &bytes[..],
            &[0xFF, 0xFF, 0xFF, 0xFF, 0x55, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_encode_players_request_with_token() {
        // Token 0xDEADBEEF as i32, little-endian on the wire.
        let bytes = encode_request(&RequestPayload::Players {
            challenge: 0xDEADBEEFu32 as i32,
        });
        assert_eq!(
            &bytes[..],
            &[0xFF, 0xFF, 0xFF, 0xFF, 0x55, 0xEF, 0xBE, 0xAD, 0xDE]
        );
    }

    #[test]
    fn test_encode_rules_request_header() {
        let bytes = encode_request(&RequestPayload::Rules { challenge: -1 });
        assert_eq!(bytes[4], headers::RULES_REQUEST);
    }

    #[test]
    fn test_decode_single_datagram() {
        let mut datagram = vec![0xFF, 0xFF, 0xFF, 0xFF];
        datagram.extend_from_slice(&info_body());

        match decode_datagram(&datagram).unwrap() {
            OuterFrame::Single(body) => assert_eq!(body[0], headers::INFO_RESPONSE),
            other => panic!("expected single packet, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_outer_header() {
        let datagram = [0x00, 0x00, 0x00, 0x00, 0x49];
        assert!(matches!(
            decode_datagram(&datagram),
            Err(CodecError::Framing(_))
        ));
    }

    #[test]
    fn test_decode_truncated_outer_header() {
        assert!(matches!(
            decode_datagram(&[0xFF, 0xFF]),
            Err(CodecError::ShortRead { .. })
        ));
    }

    #[test]
    fn test_decode_info_response() {
        let response = decode_response(&info_body()).unwrap();
        let info = match response {
            QueryResponse::Info(info) => info,
            other => panic!("expected info, got {other:?}"),
        };

        assert_eq!(info.protocol, 0x11);
        assert_eq!(info.name, "Test");
        assert_eq!(info.map, "de_dust2");
        assert_eq!(info.folder, "csgo");
        assert_eq!(info.app_id, 730);
        assert_eq!(info.players, 16);
        assert_eq!(info.max_players, 32);
        assert_eq!(info.server_type, 'd');
        assert_eq!(info.environment, 'l');
        assert!(!info.password_protected);
        assert!(info.vac_enabled);
        assert_eq!(info.version, "1.38.7.9");
        assert_eq!(info.edf, 0);
        assert!(info.port.is_none());
    }

    #[test]
    fn test_decode_info_with_edf_tail() {
        let mut body = info_body();
        body.push(0x80 | 0x20); // port + keywords
        body.extend_from_slice(&27015u16.to_le_bytes());
        body.extend_from_slice(b"secure,increased_maxplayers\0");

        let info = match decode_response(&body).unwrap() {
            QueryResponse::Info(info) => info,
            other => panic!("expected info, got {other:?}"),
        };
        assert_eq!(info.port, Some(27015));
        assert_eq!(
            info.keywords.as_deref(),
            Some("secure,increased_maxplayers")
        );
        assert!(info.steam_id.is_none());
        assert!(info.stv_port.is_none());
    }

    #[test]
    fn test_decode_challenge_response() {
        let body = [0x41, 0xEF, 0xBE, 0xAD, 0xDE];
        assert_eq!(
            decode_response(&body).unwrap(),
            QueryResponse::Challenge(0xDEADBEEFu32 as i32)
        );
    }

    #[test]
    fn test_decode_players_response() {
        let mut body = vec![headers::PLAYERS_RESPONSE, 2];
        body.push(0);
        body.extend_from_slice(b"Alice\0");
        body.extend_from_slice(&5i32.to_le_bytes());
        body.extend_from_slice(&4.0f32.to_le_bytes());
        body.push(1);
        body.extend_from_slice(b"Bob\0");
        body.extend_from_slice(&(-1i32).to_le_bytes());
        body.extend_from_slice(&0.5f32.to_le_bytes());

        let players = match decode_response(&body).unwrap() {
            QueryResponse::Players(players) => players,
            other => panic!("expected players, got {other:?}"),
        };
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].name, "Alice");
        assert_eq!(players[0].score, 5);
        assert_eq!(players[1].name, "Bob");
        assert_eq!(players[1].score, -1);
        assert!((players[1].duration - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_decode_rules_response() {
        let mut body = vec![headers::RULES_RESPONSE];
        body.extend_from_slice(&2u16.to_le_bytes());
        body.extend_from_slice(b"mp_friendlyfire\0");
        body.extend_from_slice(b"1\0");
        body.extend_from_slice(b"sv_gravity\0");
        body.extend_from_slice(b"800\0");

        let rules = match decode_response(&body).unwrap() {
            QueryResponse::Rules(rules) => rules,
            other => panic!("expected rules, got {other:?}"),
        };
        assert_eq!(rules.len(), 2);
        assert_eq!(rules["mp_friendlyfire"], "1");
        assert_eq!(rules["sv_gravity"], "800");
    }

    #[test]
    fn test_decode_unknown_inner_header() {
        assert!(matches!(
            decode_response(&[0x5A, 0x00]),
            Err(CodecError::UnknownHeader(0x5A))
        ));
    }

    #[test]
    fn test_decode_truncated_player_entry() {
        // Claims one player but the entry is cut mid-string.
        let body = [headers::PLAYERS_RESPONSE, 1, 0, b'A', b'l'];
        assert!(matches!(
            decode_response(&body),
            Err(CodecError::ShortRead { .. })
        ));
    }

    #[test]
    fn test_cstring_lossy_decode() {
        let mut body = vec![headers::RULES_RESPONSE];
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&[0xFF, 0xFE, b'k', 0x00]); // invalid UTF-8 prefix
        body.extend_from_slice(b"v\0");

        let rules = match decode_response(&body).unwrap() {
            QueryResponse::Rules(rules) => rules,
            other => panic!("expected rules, got {other:?}"),
        };
        let key = rules.keys().next().unwrap();
        assert!(key.contains('\u{FFFD}'));
        assert!(key.ends_with('k'));
    }
}
