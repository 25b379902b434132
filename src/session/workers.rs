//! Completion worker pool.
//!
//! Futures are completed here, never on the transport read path: the
//! inbound task posts `(sender, result)` pairs onto a shared channel and a
//! fixed set of worker tasks drains it. A caller doing heavy work inside
//! `.await` therefore never stalls socket reads.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::Result;
use crate::response::Response;

/// One future completion waiting for a worker.
struct Completion {
    tx: oneshot::Sender<Result<Response>>,
    result: Result<Response>,
}

/// Handle for posting completions.
#[derive(Clone)]
pub struct CompletionPool {
    tx: mpsc::UnboundedSender<Completion>,
}

impl CompletionPool {
    /// Spawn `size` worker tasks sharing one queue.
    pub fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Completion>();
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..size.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let completion = { rx.lock().await.recv().await };
                    match completion {
                        // The receiver side of a cancelled future may be
                        // gone already; that is fine.
                        Some(c) => {
                            let _ = c.tx.send(c.result);
                        }
                        None => return,
                    }
                }
            });
        }

        Self { tx }
    }

    /// Post one completion. The send only fails during shutdown, in which
    /// case the caller's future resolves as shut down.
    pub fn complete(&self, tx: oneshot::Sender<Result<Response>>, result: Result<Response>) {
        if self.tx.send(Completion { tx, result }).is_err() {
            tracing::debug!("completion pool gone; dropping completion");
        }
    }
}
