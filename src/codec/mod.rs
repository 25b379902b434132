//! Pure, stateless encode/decode of protocol frames.
//!
//! Two codecs live here: Source Query (UDP datagrams, with split-packet
//! reassembly in [`split`]) and Source RCON (TCP, length-prefixed frames).
//! Codecs never touch sockets or the pending table; they turn bytes into
//! typed frames and back.

pub mod query;
pub mod rcon;
pub mod split;

pub use query::{decode_datagram, decode_response, encode_request, OuterFrame, QueryResponse};
pub use rcon::{packet_type, RconPacket, RconStream};
pub use split::{ReassemblyBuffer, SplitFragment};
