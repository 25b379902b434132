//! The pending-request table.
//!
//! The table is the engine's only widely shared mutable state: one entry
//! per (destination, correlation key) while a request is in flight, plus a
//! FIFO overflow queue per UDP key so a second request of the same kind
//! waits for the first instead of confusing the correlation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::error::{Result, SourcewireError};
use crate::request::{CorrelationKey, Destination, Request};
use crate::response::Response;

/// Table key: destination identity plus correlation key.
pub type PendingKey = (Destination, CorrelationKey);

/// Lifecycle of a pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting behind another request with the same key.
    Queued,
    /// On the wire, awaiting a reply.
    Sent,
    /// Partially answered: split fragments or RCON bodies accumulating.
    Partial,
    /// Completed; removed from the table before the future fires.
    Done,
}

/// Accumulation state for a multi-frame RCON command reply.
#[derive(Debug, Default)]
pub struct RconAccumulator {
    /// Output bodies in arrival order.
    pub bodies: Vec<Bytes>,
    /// Consecutive empty bodies seen; two mark end-of-stream.
    pub empty_streak: u32,
}

impl RconAccumulator {
    /// Concatenate everything accumulated, lossy UTF-8.
    pub fn into_output(self) -> String {
        let total: usize = self.bodies.iter().map(|b| b.len()).sum();
        let mut out = Vec::with_capacity(total);
        for body in &self.bodies {
            out.extend_from_slice(body);
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// One in-flight request.
pub struct PendingEntry {
    pub request: Request,
    /// Single-shot completion handle; taken exactly once.
    pub tx: Option<oneshot::Sender<Result<Response>>>,
    pub state: EntryState,
    pub sent_at: Instant,
    /// Resends performed so far (UDP only).
    pub retries: u32,
    /// Whether the transparent challenge retry was already spent.
    pub challenge_retried: bool,
    /// Command reply accumulation (RCON only).
    pub rcon: Option<RconAccumulator>,
    /// Most recent codec/transport error; surfaced when the schedule expires.
    pub last_error: Option<SourcewireError>,
    /// Wakes the retry driver when the entry completes.
    pub done: Arc<Notify>,
    /// Distinguishes this dispatch from a successor reusing the key.
    pub token: u64,
}

impl PendingEntry {
    pub fn new(request: Request, tx: oneshot::Sender<Result<Response>>, token: u64) -> Self {
        Self {
            request,
            tx: Some(tx),
            state: EntryState::Sent,
            sent_at: Instant::now(),
            retries: 0,
            challenge_retried: false,
            rcon: None,
            last_error: None,
            done: Arc::new(Notify::new()),
            token,
        }
    }
}

/// A dispatch waiting for its key to free up (UDP only).
pub struct QueuedRequest {
    pub request: Request,
    pub tx: oneshot::Sender<Result<Response>>,
    pub token: u64,
}

/// Pending entries and their overflow queues, guarded by one mutex at the
/// session manager.
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<PendingKey, PendingEntry>,
    queues: HashMap<PendingKey, VecDeque<QueuedRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a request is actively in flight under the key.
    pub fn contains(&self, key: &PendingKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert an active entry. The caller must have checked the invariant
    /// that the key is free.
    pub fn insert(&mut self, key: PendingKey, entry: PendingEntry) {
        debug_assert!(!self.entries.contains_key(&key), "duplicate pending key");
        self.entries.insert(key, entry);
    }

    pub fn get_mut(&mut self, key: &PendingKey) -> Option<&mut PendingEntry> {
        self.entries.get_mut(key)
    }

    /// Remove the active entry, marking it done.
    pub fn remove(&mut self, key: &PendingKey) -> Option<PendingEntry> {
        let mut entry = self.entries.remove(key)?;
        entry.state = EntryState::Done;
        entry.done.notify_waiters();
        Some(entry)
    }

    /// Remove the active entry only if the token matches (cancel path).
    pub fn remove_if_token(&mut self, key: &PendingKey, token: u64) -> Option<PendingEntry> {
        if self.entries.get(key).map(|e| e.token) != Some(token) {
            return None;
        }
        self.remove(key)
    }

    /// Park a dispatch behind the key's active entry.
    pub fn enqueue(&mut self, key: PendingKey, queued: QueuedRequest) {
        self.queues.entry(key).or_default().push_back(queued);
    }

    /// Next parked dispatch for the key, if any.
    pub fn dequeue(&mut self, key: &PendingKey) -> Option<QueuedRequest> {
        let queue = self.queues.get_mut(key)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(key);
        }
        next
    }

    /// Remove a parked dispatch by token (cancel of a queued request).
    pub fn remove_queued(&mut self, key: &PendingKey, token: u64) -> Option<QueuedRequest> {
        let queue = self.queues.get_mut(key)?;
        let pos = queue.iter().position(|q| q.token == token)?;
        let removed = queue.remove(pos);
        if queue.is_empty() {
            self.queues.remove(key);
        }
        removed
    }

    /// Keys of active entries on a destination.
    pub fn keys_for_destination(&self, destination: &Destination) -> Vec<PendingKey> {
        self.entries
            .keys()
            .filter(|(dest, _)| dest == destination)
            .copied()
            .collect()
    }

    /// Oldest sent entry on the destination for which `pred` holds.
    pub fn oldest_matching<F>(&self, destination: &Destination, pred: F) -> Option<PendingKey>
    where
        F: Fn(&PendingEntry) -> bool,
    {
        self.entries
            .iter()
            .filter(|((dest, _), entry)| {
                dest == destination
                    && matches!(entry.state, EntryState::Sent | EntryState::Partial)
                    && pred(entry)
            })
            .min_by_key(|(_, entry)| entry.sent_at)
            .map(|(key, _)| *key)
    }

    /// Number of active entries, for diagnostics.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Priority, QueryKind, RequestPayload};
    use std::time::Duration;

    fn destination() -> Destination {
        Destination::query("127.0.0.1:27015".parse().unwrap())
    }

    fn request(payload: RequestPayload) -> Request {
        Request::new(
            destination(),
            payload,
            Priority::Normal,
            Duration::from_secs(5),
        )
    }

    fn key(kind: QueryKind) -> PendingKey {
        (destination(), CorrelationKey::Udp(kind))
    }

    #[test]
    fn test_insert_and_remove() {
        let mut table = PendingTable::new();
        let (tx, _rx) = oneshot::channel();
        let k = key(QueryKind::Info);

        table.insert(k, PendingEntry::new(request(RequestPayload::Info), tx, 1));
        assert!(table.contains(&k));
        assert_eq!(table.len(), 1);

        let entry = table.remove(&k).unwrap();
        assert_eq!(entry.state, EntryState::Done);
        assert!(table.is_empty());
        assert!(table.remove(&k).is_none());
    }

    #[test]
    fn test_remove_if_token_mismatch_keeps_entry() {
        let mut table = PendingTable::new();
        let (tx, _rx) = oneshot::channel();
        let k = key(QueryKind::Info);

        table.insert(k, PendingEntry::new(request(RequestPayload::Info), tx, 7));
        assert!(table.remove_if_token(&k, 8).is_none());
        assert!(table.contains(&k));
        assert!(table.remove_if_token(&k, 7).is_some());
    }

    #[test]
    fn test_queue_fifo_order() {
        let mut table = PendingTable::new();
        let k = key(QueryKind::Players);

        for token in 1..=3 {
            let (tx, _rx) = oneshot::channel();
            table.enqueue(
                k,
                QueuedRequest {
                    request: request(RequestPayload::Players { challenge: -1 }),
                    tx,
                    token,
                },
            );
        }

        assert_eq!(table.dequeue(&k).unwrap().token, 1);
        assert_eq!(table.dequeue(&k).unwrap().token, 2);
        assert_eq!(table.dequeue(&k).unwrap().token, 3);
        assert!(table.dequeue(&k).is_none());
    }

    #[test]
    fn test_remove_queued_by_token() {
        let mut table = PendingTable::new();
        let k = key(QueryKind::Rules);

        for token in 1..=3 {
            let (tx, _rx) = oneshot::channel();
            table.enqueue(
                k,
                QueuedRequest {
                    request: request(RequestPayload::Rules { challenge: -1 }),
                    tx,
                    token,
                },
            );
        }

        assert!(table.remove_queued(&k, 2).is_some());
        assert_eq!(table.dequeue(&k).unwrap().token, 1);
        assert_eq!(table.dequeue(&k).unwrap().token, 3);
    }

    #[test]
    fn test_oldest_matching_prefers_earliest_sent() {
        let mut table = PendingTable::new();

        let (tx1, _rx1) = oneshot::channel();
        let mut first = PendingEntry::new(request(RequestPayload::Players { challenge: -1 }), tx1, 1);
        first.sent_at = Instant::now() - Duration::from_secs(2);
        table.insert(key(QueryKind::Players), first);

        let (tx2, _rx2) = oneshot::channel();
        table.insert(
            key(QueryKind::Rules),
            PendingEntry::new(request(RequestPayload::Rules { challenge: -1 }), tx2, 2),
        );

        let oldest = table
            .oldest_matching(&destination(), |e| e.request.payload.challengeable())
            .unwrap();
        assert_eq!(oldest, key(QueryKind::Players));
    }

    #[test]
    fn test_keys_for_destination_ignores_other_destinations() {
        let mut table = PendingTable::new();
        let other = Destination::query("127.0.0.1:27016".parse().unwrap());

        let (tx1, _rx1) = oneshot::channel();
        table.insert(
            key(QueryKind::Info),
            PendingEntry::new(request(RequestPayload::Info), tx1, 1),
        );
        let (tx2, _rx2) = oneshot::channel();
        table.insert(
            (other, CorrelationKey::Udp(QueryKind::Info)),
            PendingEntry::new(
                Request::new(
                    other,
                    RequestPayload::Info,
                    Priority::Normal,
                    Duration::from_secs(5),
                ),
                tx2,
                2,
            ),
        );

        assert_eq!(table.keys_for_destination(&destination()).len(), 1);
    }

    #[test]
    fn test_accumulator_concatenates_in_order() {
        let mut acc = RconAccumulator::default();
        acc.bodies.push(Bytes::from_static(b"hostname: X\n"));
        acc.bodies.push(Bytes::from_static(b"players: 3\n"));

        assert_eq!(acc.into_output(), "hostname: X\nplayers: 3\n");
    }
}
