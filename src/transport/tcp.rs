//! TCP transport pool.
//!
//! One connection per RCON destination, opened lazily on first send and
//! kept alive. A single actor task per connection both drains the write
//! lanes and reads inbound bytes; when the connection dies for any reason
//! the actor removes itself from the pool and reports
//! [`InboundEvent::Closed`] so the session manager can fail the
//! destination's in-flight requests. A later send simply reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::TransportError;
use crate::request::{Destination, Priority};

use super::{lanes, CloseReason, InboundEvent, LaneReceivers, LaneSet};

/// Socket read chunk size.
const READ_CHUNK: usize = 8 * 1024;

type ConnMap = Arc<Mutex<HashMap<Destination, LaneSet>>>;

/// Lazy per-destination TCP pool.
pub struct TcpPool {
    conns: ConnMap,
    inbound_tx: mpsc::Sender<InboundEvent>,
    queue_depth: usize,
}

impl TcpPool {
    pub fn new(config: &Config, inbound_tx: mpsc::Sender<InboundEvent>) -> Self {
        Self {
            conns: Arc::new(Mutex::new(HashMap::new())),
            inbound_tx,
            queue_depth: config.write_queue_depth,
        }
    }

    /// Enqueue one frame, opening the connection if none exists.
    ///
    /// Returns [`TransportError::Backpressure`] synchronously when the
    /// destination's lane is full.
    pub fn send(
        &self,
        destination: Destination,
        bytes: Bytes,
        priority: Priority,
    ) -> Result<(), TransportError> {
        let mut map = self.conns.lock().expect("tcp conn map poisoned");
        let lane_set = map.entry(destination).or_insert_with(|| {
            let (set, receivers) = lanes(self.queue_depth);
            let conns = self.conns.clone();
            let inbound_tx = self.inbound_tx.clone();
            tokio::spawn(async move {
                connection_actor(destination, receivers, conns, inbound_tx).await;
            });
            set
        });
        lane_set.try_send(bytes, priority)
    }

    /// Drop the destination's connection without a close notification.
    ///
    /// Used after a framing violation, where the session manager has
    /// already failed the destination's pending requests itself. The actor
    /// exits once its lanes drain.
    pub fn close(&self, destination: Destination) {
        self.conns
            .lock()
            .expect("tcp conn map poisoned")
            .remove(&destination);
    }

    /// Whether a connection (or a pending connect) exists for the destination.
    pub fn is_connected(&self, destination: &Destination) -> bool {
        self.conns
            .lock()
            .expect("tcp conn map poisoned")
            .contains_key(destination)
    }
}

/// Owns one connection end to end: connect, pump writes, pump reads, report
/// the close.
async fn connection_actor(
    destination: Destination,
    mut receivers: LaneReceivers,
    conns: ConnMap,
    inbound_tx: mpsc::Sender<InboundEvent>,
) {
    let stream = match TcpStream::connect(destination.addr).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("tcp connect to {} failed: {}", destination, e);
            close(destination, &conns, &inbound_tx, CloseReason::ConnectFailed(e)).await;
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("set_nodelay on {} failed: {}", destination, e);
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK];

    let reason = loop {
        tokio::select! {
            biased;
            frame = receivers.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_half.write_all(&frame).await {
                        break CloseReason::Io(e);
                    }
                }
                // Pool dropped; the engine is shutting down.
                None => return,
            },
            result = read_half.read(&mut buf) => match result {
                Ok(0) => break CloseReason::Eof,
                Ok(n) => {
                    let event = InboundEvent::Stream {
                        destination,
                        bytes: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if inbound_tx.send(event).await.is_err() {
                        return;
                    }
                }
                Err(e) => break CloseReason::Io(e),
            },
        }
    };

    tracing::debug!("tcp connection to {} closed: {:?}", destination, reason);
    close(destination, &conns, &inbound_tx, reason).await;
}

async fn close(
    destination: Destination,
    conns: &ConnMap,
    inbound_tx: &mpsc::Sender<InboundEvent>,
    reason: CloseReason,
) {
    conns
        .lock()
        .expect("tcp conn map poisoned")
        .remove(&destination);
    let _ = inbound_tx
        .send(InboundEvent::Closed {
            destination,
            reason,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_lazy_connect_and_write() {
        let (listener, addr) = listener().await;
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let pool = TcpPool::new(&Config::default(), inbound_tx);
        let destination = Destination::rcon(addr);

        pool.send(destination, Bytes::from_static(b"hello"), Priority::Normal)
            .unwrap();

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(pool.is_connected(&destination));
    }

    #[tokio::test]
    async fn test_inbound_bytes_routed() {
        let (listener, addr) = listener().await;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let pool = TcpPool::new(&Config::default(), inbound_tx);
        let destination = Destination::rcon(addr);

        pool.send(destination, Bytes::from_static(b"x"), Priority::Normal)
            .unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"reply bytes").await.unwrap();

        match inbound_rx.recv().await.unwrap() {
            InboundEvent::Stream {
                destination: from,
                bytes,
            } => {
                assert_eq!(from, destination);
                assert_eq!(&bytes[..], b"reply bytes");
            }
            other => panic!("expected stream bytes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_emits_closed_and_clears_pool() {
        let (listener, addr) = listener().await;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let pool = TcpPool::new(&Config::default(), inbound_tx);
        let destination = Destination::rcon(addr);

        pool.send(destination, Bytes::from_static(b"x"), Priority::Normal)
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        loop {
            match inbound_rx.recv().await.unwrap() {
                InboundEvent::Closed {
                    destination: from,
                    reason,
                } => {
                    assert_eq!(from, destination);
                    assert!(matches!(reason, CloseReason::Eof | CloseReason::Io(_)));
                    break;
                }
                // The write may have landed before the peer hung up.
                InboundEvent::Stream { .. } => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(!pool.is_connected(&destination));
    }

    #[tokio::test]
    async fn test_connect_failure_emits_closed() {
        // Nothing listens on this port.
        let (listener, addr) = listener().await;
        drop(listener);

        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let pool = TcpPool::new(&Config::default(), inbound_tx);
        let destination = Destination::rcon(addr);

        pool.send(destination, Bytes::from_static(b"x"), Priority::Normal)
            .unwrap();

        match inbound_rx.recv().await.unwrap() {
            InboundEvent::Closed { reason, .. } => {
                assert!(matches!(reason, CloseReason::ConnectFailed(_)));
            }
            other => panic!("expected closed, got {other:?}"),
        }
        assert!(!pool.is_connected(&destination));
    }
}
