//! Error types for sourcewire.
//!
//! Errors are layered the way the engine is: transport, codec and RCON
//! protocol errors each have their own enum, and [`SourcewireError`] is the
//! umbrella the public API returns. Request-lifecycle outcomes (timeout,
//! cancellation) live on the umbrella directly since they are not tied to a
//! single layer.

use thiserror::Error;

/// Errors raised by the transport pools (UDP socket, TCP connections).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination's write queue is at its high-water mark.
    #[error("write queue full for destination")]
    Backpressure,

    /// The TCP connection to the destination was closed.
    #[error("connection closed")]
    Closed,

    /// Establishing the TCP connection failed.
    #[error("connect failed: {0}")]
    ConnectFailed(std::io::Error),

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while encoding or decoding protocol frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ended before a complete field could be read.
    #[error("short read: needed {needed} more bytes")]
    ShortRead { needed: usize },

    /// The outer framing was malformed.
    #[error("framing error: {0}")]
    Framing(String),

    /// The response header byte is not a known response kind.
    #[error("unknown response header: 0x{0:02X}")]
    UnknownHeader(u8),

    /// Split-packet fragments disagreed on their group headers.
    #[error("reassembly error: {0}")]
    Reassembly(String),

    /// The CRC32 of the decompressed payload did not match the stored value.
    #[error("checksum mismatch: expected {expected:#010X}, got {actual:#010X}")]
    Checksum { expected: u32, actual: u32 },

    /// bzip2 decompression failed or produced the wrong length.
    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Errors specific to the Source RCON protocol.
#[derive(Debug, Error)]
pub enum RconError {
    /// A command was issued before a successful authentication.
    #[error("not authenticated with the server's rcon interface")]
    NotAuthenticated,

    /// The server revoked the session's authentication; requests that were
    /// in flight when the revocation arrived fail with this.
    #[error("authentication rejected by server")]
    AuthRejected,

    /// A request id collided with one already in flight on the destination.
    #[error("correlation id {0} already in flight")]
    BadCorrelation(i32),

    /// A frame declared an out-of-range size.
    #[error("framing violation: {0}")]
    Framing(String),
}

/// Main error type for all sourcewire operations.
#[derive(Debug, Error)]
pub enum SourcewireError {
    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encode/decode failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// RCON protocol failure.
    #[error(transparent)]
    Rcon(#[from] RconError),

    /// The request's deadline expired after all retries.
    #[error("request timed out")]
    Timeout,

    /// The request was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    /// JSON error while loading configuration.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// The engine was shut down while the request was pending.
    #[error("engine shut down")]
    Shutdown,
}

/// Result type alias using SourcewireError.
pub type Result<T> = std::result::Result<T, SourcewireError>;
