//! Engine configuration.
//!
//! All knobs recognized by the core, with the defaults the protocol was tuned
//! against. Durations are carried as milliseconds so a `Config` can be
//! deserialized from JSON verbatim; accessor methods hand out [`Duration`]s.
//!
//! # Example
//!
//! ```
//! use sourcewire::Config;
//!
//! let config = Config {
//!     read_timeout_ms: 2_000,
//!     max_retries: 1,
//!     ..Config::default()
//! };
//! assert_eq!(config.read_timeout().as_secs(), 2);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Default per-request deadline in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;

/// Default number of UDP resend attempts after the initial send.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default initial retry backoff in milliseconds.
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 250;

/// Default retry backoff cap in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 2_000;

/// Default per-destination write queue depth.
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 256;

/// Default maximum RCON frame size in bytes (soft protocol limit).
pub const DEFAULT_RCON_MAX_FRAME_BYTES: usize = 4_096;

/// Pad bodies observed terminating a multi-frame RCON reply.
///
/// Server builds differ on the exact bytes; both known shapes are matched by
/// default and the set is configurable.
pub const DEFAULT_RCON_SENTINEL_PADS: [&[u8]; 2] =
    [b"\x00\x01\x00\x00", b"\x00\x01\x00\x00\x00\x00"];

/// Configuration for the query engine.
///
/// Construct with struct-update syntax over [`Config::default()`], or load
/// from JSON with [`Config::from_json`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-request deadline, applied after the final send attempt.
    pub read_timeout_ms: u64,
    /// UDP resend attempts after the initial send. RCON never retries.
    pub max_retries: u32,
    /// First resend happens this long after the initial send.
    pub backoff_initial_ms: u64,
    /// Resend interval cap; backoff doubles per attempt up to this.
    pub backoff_max_ms: u64,
    /// Number of completion worker tasks. Zero means one per CPU.
    pub worker_pool_size: usize,
    /// Bounded depth of each per-destination write lane.
    pub write_queue_depth: usize,
    /// Frames declaring a larger size are a protocol violation.
    pub rcon_max_frame_bytes: usize,
    /// Bodies treated as the server's reply to the sentinel packet.
    pub rcon_sentinel_pads: Vec<Vec<u8>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            worker_pool_size: 0,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
            rcon_max_frame_bytes: DEFAULT_RCON_MAX_FRAME_BYTES,
            rcon_sentinel_pads: DEFAULT_RCON_SENTINEL_PADS
                .iter()
                .map(|p| p.to_vec())
                .collect(),
        }
    }
}

impl Config {
    /// Load a config from a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Per-request deadline as a [`Duration`].
    #[inline]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Initial retry backoff as a [`Duration`].
    #[inline]
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    /// Retry backoff cap as a [`Duration`].
    #[inline]
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Resend wait before attempt `n` (zero-based), doubling and capped.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let initial = self.backoff_initial_ms.max(1);
        let scaled = initial.saturating_mul(1u64 << attempt.min(32));
        Duration::from_millis(scaled.min(self.backoff_max_ms))
    }

    /// Effective completion worker count.
    pub fn effective_worker_pool_size(&self) -> usize {
        if self.worker_pool_size > 0 {
            self.worker_pool_size
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Whether a body matches one of the configured sentinel pads.
    #[inline]
    pub fn is_sentinel_pad(&self, body: &[u8]) -> bool {
        self.rcon_sentinel_pads.iter().any(|p| p == body)
    }
}
