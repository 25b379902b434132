//! Request model: destinations, payloads and correlation keys.
//!
//! Requests are a tagged sum over the payload variants rather than a type
//! hierarchy; the codec discriminates on the variant when encoding and the
//! session manager derives the correlation key from it.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Which wire protocol a destination speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// Source Query over UDP.
    Query,
    /// Source RCON over TCP.
    Rcon,
    /// Master-server listing. Tagged for identity only; not served by the core.
    Master,
}

/// A queryable endpoint: host/port plus protocol tag. Identity for lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub addr: SocketAddr,
    pub kind: ProtocolKind,
}

impl Destination {
    /// A Source Query destination.
    pub fn query(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: ProtocolKind::Query,
        }
    }

    /// A Source RCON destination.
    pub fn rcon(addr: SocketAddr) -> Self {
        Self {
            addr,
            kind: ProtocolKind::Rcon,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}", self.addr, self.kind)
    }
}

/// Send priority. Lanes are drained high-first; FIFO holds within a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Lane index for per-destination queues.
    #[inline]
    pub fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    /// Number of priority lanes.
    pub const LANES: usize = 3;
}

/// The response kinds a UDP query can resolve to.
///
/// Doubles as the UDP correlation key: the transport carries no request id,
/// so at most one request per kind may be in flight per destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Info,
    Players,
    Rules,
}

/// What a request asks the server to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    /// A2S_INFO.
    Info,
    /// A2S_PLAYER with the current challenge token.
    Players { challenge: i32 },
    /// A2S_RULES with the current challenge token.
    Rules { challenge: i32 },
    /// SERVERDATA_AUTH.
    Auth { id: i32, password: String },
    /// SERVERDATA_EXECCOMMAND.
    Command { id: i32, body: String },
}

impl RequestPayload {
    /// The protocol this payload travels over.
    #[inline]
    pub fn protocol_kind(&self) -> ProtocolKind {
        match self {
            RequestPayload::Info | RequestPayload::Players { .. } | RequestPayload::Rules { .. } => {
                ProtocolKind::Query
            }
            RequestPayload::Auth { .. } | RequestPayload::Command { .. } => ProtocolKind::Rcon,
        }
    }

    /// The correlation key an inbound reply is matched under.
    #[inline]
    pub fn correlation_key(&self) -> CorrelationKey {
        match self {
            RequestPayload::Info => CorrelationKey::Udp(QueryKind::Info),
            RequestPayload::Players { .. } => CorrelationKey::Udp(QueryKind::Players),
            RequestPayload::Rules { .. } => CorrelationKey::Udp(QueryKind::Rules),
            RequestPayload::Auth { id, .. } | RequestPayload::Command { id, .. } => {
                CorrelationKey::Rcon(*id)
            }
        }
    }

    /// Whether the server may answer this with a challenge token first.
    #[inline]
    pub fn challengeable(&self) -> bool {
        matches!(
            self,
            RequestPayload::Players { .. } | RequestPayload::Rules { .. }
        )
    }

    /// Same payload with the challenge token substituted.
    ///
    /// Returns `None` for payloads that carry no challenge.
    pub fn with_challenge(&self, token: i32) -> Option<RequestPayload> {
        match self {
            RequestPayload::Players { .. } => Some(RequestPayload::Players { challenge: token }),
            RequestPayload::Rules { .. } => Some(RequestPayload::Rules { challenge: token }),
            _ => None,
        }
    }
}

/// Identifier used to match an inbound frame to its originating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// UDP: the expected response kind.
    Udp(QueryKind),
    /// RCON: the caller-chosen 32-bit id.
    Rcon(i32),
}

/// A fully-assembled request ready for dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    pub destination: Destination,
    pub payload: RequestPayload,
    pub priority: Priority,
    /// Deadline applied after the final send attempt.
    pub deadline: Duration,
}

impl Request {
    pub fn new(
        destination: Destination,
        payload: RequestPayload,
        priority: Priority,
        deadline: Duration,
    ) -> Self {
        Self {
            destination,
            payload,
            priority,
            deadline,
        }
    }

    #[inline]
    pub fn correlation_key(&self) -> CorrelationKey {
        self.payload.correlation_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:27015".parse().unwrap()
    }

    #[test]
    fn test_destination_identity() {
        let a = Destination::query(addr());
        let b = Destination::query(addr());
        let c = Destination::rcon(addr());

        assert_eq!(a, b);
        // Same host/port, different protocol tag: distinct identity.
        assert_ne!(a, c);
    }

    #[test]
    fn test_payload_protocol_kinds() {
        assert_eq!(RequestPayload::Info.protocol_kind(), ProtocolKind::Query);
        assert_eq!(
            RequestPayload::Players { challenge: -1 }.protocol_kind(),
            ProtocolKind::Query
        );
        assert_eq!(
            RequestPayload::Auth {
                id: 1,
                password: "x".into()
            }
            .protocol_kind(),
            ProtocolKind::Rcon
        );
        assert_eq!(
            RequestPayload::Command {
                id: 1,
                body: "status".into()
            }
            .protocol_kind(),
            ProtocolKind::Rcon
        );
    }

    #[test]
    fn test_correlation_keys() {
        assert_eq!(
            RequestPayload::Info.correlation_key(),
            CorrelationKey::Udp(QueryKind::Info)
        );
        assert_eq!(
            RequestPayload::Rules { challenge: -1 }.correlation_key(),
            CorrelationKey::Udp(QueryKind::Rules)
        );
        assert_eq!(
            RequestPayload::Command {
                id: 42,
                body: "status".into()
            }
            .correlation_key(),
            CorrelationKey::Rcon(42)
        );
    }

    #[test]
    fn test_challenge_substitution() {
        let players = RequestPayload::Players { challenge: -1 };
        assert_eq!(
            players.with_challenge(0x1234),
            Some(RequestPayload::Players { challenge: 0x1234 })
        );
        assert!(RequestPayload::Info.with_challenge(0x1234).is_none());
        assert!(players.challengeable());
        assert!(!RequestPayload::Info.challengeable());
    }

    #[test]
    fn test_priority_lanes() {
        assert_eq!(Priority::High.lane(), 0);
        assert_eq!(Priority::Normal.lane(), 1);
        assert_eq!(Priority::Low.lane(), 2);
        assert!(Priority::High < Priority::Normal);
    }
}
