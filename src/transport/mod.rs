//! Transport pools.
//!
//! One pool per protocol kind: [`UdpPool`] shares a single bound socket
//! across destinations, [`TcpPool`] keeps one lazily-opened connection per
//! destination. Both own the sockets exclusively and hand inbound bytes to
//! the session manager as [`InboundEvent`]s; neither ever decodes a frame.
//!
//! Outbound writes go through per-destination lanes: one bounded queue per
//! priority, drained high-first by a dedicated writer task, so writes to
//! the same destination are ordered and writes across destinations
//! interleave freely. A full lane rejects the write synchronously with
//! [`TransportError::Backpressure`].

mod tcp;
mod udp;

pub use tcp::TcpPool;
pub use udp::UdpPool;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::request::{Destination, Priority};

/// Why a TCP connection went away.
#[derive(Debug)]
pub enum CloseReason {
    /// Establishing the connection failed.
    ConnectFailed(std::io::Error),
    /// The peer closed the stream.
    Eof,
    /// A read or write failed mid-stream.
    Io(std::io::Error),
}

/// Inbound traffic and lifecycle notices, routed to the session manager.
#[derive(Debug)]
pub enum InboundEvent {
    /// One UDP datagram.
    Datagram {
        destination: Destination,
        bytes: Bytes,
    },
    /// A chunk of TCP stream bytes, framing not yet applied.
    Stream {
        destination: Destination,
        bytes: Bytes,
    },
    /// The destination's TCP connection is gone.
    Closed {
        destination: Destination,
        reason: CloseReason,
    },
}

/// Send side of one destination's priority lanes.
pub(crate) struct LaneSet {
    senders: [mpsc::Sender<Bytes>; Priority::LANES],
}

/// Receive side, owned by the destination's writer task.
pub(crate) struct LaneReceivers {
    receivers: [mpsc::Receiver<Bytes>; Priority::LANES],
}

/// Create one destination's lanes, each bounded to `depth`.
pub(crate) fn lanes(depth: usize) -> (LaneSet, LaneReceivers) {
    let (high_tx, high_rx) = mpsc::channel(depth);
    let (normal_tx, normal_rx) = mpsc::channel(depth);
    let (low_tx, low_rx) = mpsc::channel(depth);
    (
        LaneSet {
            senders: [high_tx, normal_tx, low_tx],
        },
        LaneReceivers {
            receivers: [high_rx, normal_rx, low_rx],
        },
    )
}

impl LaneSet {
    /// Enqueue without waiting. A full lane is backpressure, a closed lane
    /// means the writer task is gone.
    pub(crate) fn try_send(&self, bytes: Bytes, priority: Priority) -> Result<(), TransportError> {
        self.senders[priority.lane()]
            .try_send(bytes)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }
}

impl LaneReceivers {
    /// Next frame to write, preferring higher-priority lanes.
    ///
    /// Returns `None` once every lane's sender is dropped and drained.
    pub(crate) async fn recv(&mut self) -> Option<Bytes> {
        let [high, normal, low] = &mut self.receivers;
        loop {
            tokio::select! {
                biased;
                frame = high.recv() => match frame {
                    Some(frame) => return Some(frame),
                    None => break,
                },
                frame = normal.recv() => match frame {
                    Some(frame) => return Some(frame),
                    None => break,
                },
                frame = low.recv() => match frame {
                    Some(frame) => return Some(frame),
                    None => break,
                },
            }
        }
        // One lane closed; drain the others non-blockingly before giving up.
        for rx in &mut self.receivers {
            if let Ok(frame) = rx.try_recv() {
                return Some(frame);
            }
        }
        None
    }
}
