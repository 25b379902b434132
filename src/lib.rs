//! # sourcewire
//!
//! Asynchronous game-server query engine for Valve protocols:
//!
//! - **Source Query** (UDP): A2S_INFO, A2S_PLAYER and A2S_RULES with
//!   transparent challenge handling, split-packet reassembly and bzip2
//!   decompression.
//! - **Source RCON** (TCP): authentication and command execution with the
//!   sentinel-packet workaround for multi-frame replies.
//!
//! ## Architecture
//!
//! ```text
//! Client (facade) ──► SessionManager ──► Codec ──► Transport Pool ──► wire
//!       ▲                   │  pending table,            UDP socket /
//!       │                   │  retries, reassembly       TCP connections
//!       └── future ◄── CompletionPool ◄── inbound match ◄───┘
//! ```
//!
//! Requests become entries in the session manager's pending table, keyed by
//! destination plus a correlation key (the expected response kind for UDP,
//! the caller-chosen id for RCON). Inbound frames are decoded, matched and
//! completed on a worker pool; the transport read tasks never run caller
//! code.
//!
//! ## Example
//!
//! ```ignore
//! use sourcewire::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder().build().await?;
//!     let info = client.query_info("203.0.113.5:27015".parse()?).await?;
//!     println!("{} ({}/{})", info.name, info.players, info.max_players);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod request;
pub mod response;
pub mod session;
pub mod transport;

mod client;

pub use client::{Client, ClientBuilder};
pub use config::Config;
pub use error::{CodecError, RconError, Result, SourcewireError, TransportError};
pub use request::{
    CorrelationKey, Destination, Priority, ProtocolKind, QueryKind, Request, RequestPayload,
};
pub use response::{Player, Response, ServerInfo};
pub use session::{RconSession, ResponseFuture, SessionManager};
