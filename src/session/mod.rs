//! Session manager: correlates inbound frames to in-flight requests.
//!
//! The manager owns the pending-request table and everything that hangs off
//! it: UDP split-packet reassembly buffers, RCON stream accumulators, retry
//! and timeout drivers, and the completion worker pool. The transport read
//! tasks push [`InboundEvent`]s into one channel; a single session task
//! decodes, matches and transitions entries, and posts finished futures to
//! the [`CompletionPool`] so no caller code ever runs on the read path.
//!
//! Correlation model:
//! - UDP carries no transport id, so the key is the *expected response
//!   kind*; one request of each kind may be in flight per destination and
//!   extra dispatches queue FIFO behind it.
//! - RCON frames echo the caller-chosen 32-bit id, which is the key; a
//!   duplicate id on the same destination is rejected at dispatch.

pub mod pending;
pub mod workers;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep, Instant};

use crate::codec::query::{self, QueryResponse};
use crate::codec::rcon::{packet_type, RconPacket, RconStream, AUTH_FAILURE_ID};
use crate::codec::split::{ReassemblyBuffer, SplitFragment};
use crate::codec::OuterFrame;
use crate::config::Config;
use crate::error::{Result, SourcewireError, TransportError};
use crate::request::{CorrelationKey, Destination, Priority, QueryKind, Request, RequestPayload};
use crate::response::Response;
use crate::transport::{CloseReason, InboundEvent, TcpPool, UdpPool};

use pending::{EntryState, PendingEntry, PendingKey, PendingTable, QueuedRequest, RconAccumulator};
use workers::CompletionPool;

/// Depth of the transport-to-session event channel.
const INBOUND_CHANNEL_DEPTH: usize = 1_024;

/// Per-destination RCON authentication record.
///
/// Created lazily on the first auth attempt, deleted when the transport
/// reports the connection closed.
#[derive(Debug)]
pub struct RconSession {
    pub authenticated: bool,
    pub auth_id: Option<i32>,
    pub last_used: Instant,
}

impl RconSession {
    pub fn new() -> Self {
        Self {
            authenticated: false,
            auth_id: None,
            last_used: Instant::now(),
        }
    }
}

impl Default for RconSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared RCON session table; owned by the facade, invalidated here.
pub type RconSessionTable = Arc<Mutex<HashMap<Destination, RconSession>>>;

/// The future returned by [`SessionManager::dispatch`].
///
/// Resolves exactly once. [`cancel`](Self::cancel) removes the pending entry
/// synchronously; a frame racing the cancellation is discarded.
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Response>>,
    inner: Arc<SessionInner>,
    key: PendingKey,
    token: u64,
}

impl ResponseFuture {
    /// Cancel the request synchronously. Awaiting the future afterwards
    /// observes [`SourcewireError::Cancelled`]; cancelling after completion
    /// is a no-op.
    pub fn cancel(&self) {
        self.inner.cancel(self.key, self.token);
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx).poll(cx).map(|r| match r {
            Ok(result) => result,
            Err(_) => Err(SourcewireError::Shutdown),
        })
    }
}

/// The session manager. One per [`Client`](crate::Client).
pub struct SessionManager {
    inner: Arc<SessionInner>,
    /// Dropping this stops the session task, which in turn winds down the
    /// transport tasks.
    _shutdown: oneshot::Sender<()>,
}

struct SessionInner {
    config: Config,
    table: Mutex<PendingTable>,
    udp: UdpPool,
    tcp: TcpPool,
    workers: CompletionPool,
    /// Reassembly buffers keyed by (destination, split group id).
    splits: Mutex<HashMap<(Destination, i32), ReassemblyBuffer>>,
    /// One stream accumulator per live TCP connection.
    rcon_streams: Mutex<HashMap<Destination, RconStream>>,
    rcon_sessions: RconSessionTable,
    next_token: AtomicU64,
}

impl SessionManager {
    /// Bind transports and start the session task.
    pub async fn start(config: Config, rcon_sessions: RconSessionTable) -> Result<Self> {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CHANNEL_DEPTH);

        let udp = UdpPool::bind(&config, inbound_tx.clone()).await?;
        let tcp = TcpPool::new(&config, inbound_tx);
        let workers = CompletionPool::new(config.effective_worker_pool_size());

        let inner = Arc::new(SessionInner {
            config,
            table: Mutex::new(PendingTable::new()),
            udp,
            tcp,
            workers,
            splits: Mutex::new(HashMap::new()),
            rcon_streams: Mutex::new(HashMap::new()),
            rcon_sessions,
            next_token: AtomicU64::new(1),
        });

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let session = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = inbound_rx.recv() => match event {
                        Some(event) => session.handle_event(event),
                        None => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
            tracing::debug!("session task stopping");
        });

        Ok(Self {
            inner,
            _shutdown: shutdown_tx,
        })
    }

    /// Register a pending entry and put the request on the wire.
    ///
    /// Backpressure and RCON id collisions surface synchronously as `Err`;
    /// everything later arrives through the returned future.
    pub fn dispatch(&self, request: Request) -> Result<ResponseFuture> {
        self.inner.clone().dispatch(request)
    }

    /// The engine configuration in effect.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl SessionInner {
    fn dispatch(self: Arc<Self>, request: Request) -> Result<ResponseFuture> {
        let key = (request.destination, request.correlation_key());
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match key.1 {
            CorrelationKey::Udp(_) => self.dispatch_udp(key, token, request, tx)?,
            CorrelationKey::Rcon(_) => self.dispatch_rcon(key, token, request, tx)?,
        }

        Ok(ResponseFuture {
            rx,
            inner: self,
            key,
            token,
        })
    }

    fn dispatch_udp(
        self: &Arc<Self>,
        key: PendingKey,
        token: u64,
        request: Request,
        tx: oneshot::Sender<Result<Response>>,
    ) -> Result<()> {
        let deadline = request.deadline;
        let done = {
            let mut table = self.table.lock().expect("pending table poisoned");
            if table.contains(&key) {
                // Same kind already in flight: wait your turn.
                table.enqueue(key, QueuedRequest { request, tx, token });
                return Ok(());
            }
            let entry = PendingEntry::new(request.clone(), tx, token);
            let done = entry.done.clone();
            table.insert(key, entry);
            done
        };

        let bytes = query::encode_request(&request.payload);
        if let Err(e) = self.udp.send(request.destination, bytes, request.priority) {
            self.table
                .lock()
                .expect("pending table poisoned")
                .remove_if_token(&key, token);
            self.promote_next(key);
            return Err(e.into());
        }

        self.spawn_udp_driver(key, token, deadline, done);
        Ok(())
    }

    fn dispatch_rcon(
        self: &Arc<Self>,
        key: PendingKey,
        token: u64,
        request: Request,
        tx: oneshot::Sender<Result<Response>>,
    ) -> Result<()> {
        let CorrelationKey::Rcon(id) = key.1 else {
            unreachable!("rcon dispatch with udp key");
        };
        let deadline = request.deadline;

        let (packet, sentinel) = match &request.payload {
            RequestPayload::Auth { id, password } => (RconPacket::auth(*id, password), None),
            RequestPayload::Command { id, body } => {
                (RconPacket::exec(*id, body), Some(RconPacket::sentinel(*id)))
            }
            other => unreachable!("not an rcon payload: {other:?}"),
        };

        let done = {
            let mut table = self.table.lock().expect("pending table poisoned");
            if table.contains(&key) {
                return Err(crate::error::RconError::BadCorrelation(id).into());
            }
            let mut entry = PendingEntry::new(request.clone(), tx, token);
            if matches!(request.payload, RequestPayload::Command { .. }) {
                entry.rcon = Some(RconAccumulator::default());
            }
            let done = entry.done.clone();
            table.insert(key, entry);
            done
        };

        let destination = request.destination;
        let priority = request.priority;
        let send_result = self
            .tcp
            .send(destination, packet.encode(), priority)
            .and_then(|_| match sentinel {
                // The sentinel rides the same lane, so it lands right after
                // the command and the server's reply to it delimits the
                // output stream.
                Some(sentinel) => self.tcp.send(destination, sentinel.encode(), priority),
                None => Ok(()),
            });

        if let Err(e) = send_result {
            self.table
                .lock()
                .expect("pending table poisoned")
                .remove_if_token(&key, token);
            return Err(e.into());
        }

        self.spawn_rcon_driver(key, token, deadline, done);
        Ok(())
    }

    /// UDP retry driver: resend on the backoff schedule, then allow one
    /// deadline of grace after the last send before expiring the entry.
    fn spawn_udp_driver(
        self: &Arc<Self>,
        key: PendingKey,
        token: u64,
        deadline: Duration,
        done: Arc<Notify>,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            for attempt in 0..inner.config.max_retries {
                let wait = inner.config.backoff_for_attempt(attempt);
                tokio::select! {
                    _ = done.notified() => return,
                    _ = sleep(wait) => {}
                }
                if !inner.resend(key, token) {
                    return;
                }
            }
            tokio::select! {
                _ = done.notified() => return,
                _ = sleep(deadline) => {}
            }
            inner.expire(key, token);
        });
    }

    /// RCON driver: no retries, a single deadline.
    fn spawn_rcon_driver(
        self: &Arc<Self>,
        key: PendingKey,
        token: u64,
        deadline: Duration,
        done: Arc<Notify>,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.notified() => return,
                _ = sleep(deadline) => {}
            }
            inner.expire(key, token);
        });
    }

    /// Re-send the entry's current payload. Returns false once the entry is
    /// gone (completed or replaced).
    fn resend(&self, key: PendingKey, token: u64) -> bool {
        let frame = {
            let mut table = self.table.lock().expect("pending table poisoned");
            let Some(entry) = table.get_mut(&key) else {
                return false;
            };
            if entry.token != token {
                return false;
            }
            entry.retries += 1;
            // The payload may have picked up a challenge token since the
            // first send.
            (
                query::encode_request(&entry.request.payload),
                entry.request.destination,
                entry.request.priority,
            )
        };

        let (bytes, destination, priority) = frame;
        tracing::debug!("resending {:?} to {}", key.1, destination);
        if let Err(e) = self.udp.send(destination, bytes, priority) {
            self.record_error(key, token, e.into());
        }
        true
    }

    /// The schedule ran out: surface the recorded error, or a timeout.
    fn expire(self: &Arc<Self>, key: PendingKey, token: u64) {
        let entry = {
            let mut table = self.table.lock().expect("pending table poisoned");
            table.remove_if_token(&key, token)
        };
        let Some(mut entry) = entry else { return };

        let error = entry.last_error.take().unwrap_or(SourcewireError::Timeout);
        tracing::debug!(
            "request {:?} to {} expired after {} retries: {}",
            key.1,
            key.0,
            entry.retries,
            error
        );
        if let Some(tx) = entry.tx.take() {
            self.workers.complete(tx, Err(error));
        }
        self.promote_next(key);
    }

    /// Remove the entry on caller request; a later frame for it is dropped.
    fn cancel(self: &Arc<Self>, key: PendingKey, token: u64) {
        let entry = {
            let mut table = self.table.lock().expect("pending table poisoned");
            table.remove_if_token(&key, token)
        };
        if let Some(mut entry) = entry {
            if let Some(tx) = entry.tx.take() {
                self.workers.complete(tx, Err(SourcewireError::Cancelled));
            }
            self.promote_next(key);
            return;
        }

        let queued = {
            let mut table = self.table.lock().expect("pending table poisoned");
            table.remove_queued(&key, token)
        };
        if let Some(queued) = queued {
            self.workers
                .complete(queued.tx, Err(SourcewireError::Cancelled));
        }
    }

    /// Activate the next queued dispatch for a freed key, if any.
    fn promote_next(self: &Arc<Self>, key: PendingKey) {
        loop {
            // Dequeue and re-insert under one lock so a concurrent dispatch
            // cannot slip into the freed key in between.
            let activated = {
                let mut table = self.table.lock().expect("pending table poisoned");
                if table.contains(&key) {
                    None
                } else {
                    table.dequeue(&key).map(|queued| {
                        let entry = PendingEntry::new(queued.request, queued.tx, queued.token);
                        let done = entry.done.clone();
                        let request = entry.request.clone();
                        table.insert(key, entry);
                        (queued.token, request, done)
                    })
                }
            };
            let Some((token, request, done)) = activated else { return };

            let bytes = query::encode_request(&request.payload);
            match self.udp.send(request.destination, bytes, request.priority) {
                Ok(()) => {
                    self.spawn_udp_driver(key, token, request.deadline, done);
                    return;
                }
                Err(e) => {
                    let entry = {
                        let mut table = self.table.lock().expect("pending table poisoned");
                        table.remove_if_token(&key, token)
                    };
                    if let Some(mut entry) = entry {
                        if let Some(tx) = entry.tx.take() {
                            self.workers.complete(tx, Err(e.into()));
                        }
                    }
                    // Try the next one in line.
                }
            }
        }
    }

    /// Record a non-terminal error; it surfaces when the schedule expires.
    fn record_error(&self, key: PendingKey, token: u64, error: SourcewireError) {
        let mut table = self.table.lock().expect("pending table poisoned");
        if let Some(entry) = table.get_mut(&key) {
            if entry.token == token {
                entry.last_error = Some(error);
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    fn handle_event(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::Datagram { destination, bytes } => {
                self.handle_datagram(destination, &bytes)
            }
            InboundEvent::Stream { destination, bytes } => self.handle_stream(destination, &bytes),
            InboundEvent::Closed {
                destination,
                reason,
            } => self.handle_closed(destination, reason),
        }
    }

    fn handle_datagram(self: &Arc<Self>, destination: Destination, bytes: &[u8]) {
        match query::decode_datagram(bytes) {
            Ok(OuterFrame::Single(body)) => self.handle_query_body(destination, &body),
            Ok(OuterFrame::Split(fragment)) => self.handle_fragment(destination, fragment),
            Err(e) => {
                // Unknown inbound bytes never fail unrelated entries.
                tracing::warn!("dropping undecodable datagram from {}: {}", destination, e);
            }
        }
    }

    fn handle_fragment(self: &Arc<Self>, destination: Destination, fragment: SplitFragment) {
        // Fragment arrival is the PARTIAL signal for whichever request is
        // being answered; with no inner header yet, that is the oldest one.
        {
            let mut table = self.table.lock().expect("pending table poisoned");
            if let Some(key) = table.oldest_matching(&destination, |e| {
                matches!(e.request.correlation_key(), CorrelationKey::Udp(_))
            }) {
                if let Some(entry) = table.get_mut(&key) {
                    entry.state = EntryState::Partial;
                }
            }
        }

        let group_key = (destination, fragment.group_id());
        let outcome = {
            let mut splits = self.splits.lock().expect("split map poisoned");
            let buffer = splits
                .entry(group_key)
                .or_insert_with(|| ReassemblyBuffer::for_fragment(&fragment));
            match buffer.insert(fragment) {
                Ok(None) => None,
                Ok(Some(datagram)) => {
                    splits.remove(&group_key);
                    Some(Ok(datagram))
                }
                Err(e) => {
                    splits.remove(&group_key);
                    Some(Err(e))
                }
            }
        };

        match outcome {
            None => {}
            Some(Ok(datagram)) => match query::decode_datagram(&datagram) {
                Ok(OuterFrame::Single(body)) => self.handle_query_body(destination, &body),
                Ok(OuterFrame::Split(_)) | Err(_) => {
                    tracing::warn!("reassembled datagram from {} is not a single packet", destination);
                }
            },
            Some(Err(e)) => {
                tracing::warn!("split reassembly from {} failed: {}", destination, e);
                self.record_udp_error(destination, e.into());
            }
        }
    }

    fn handle_query_body(self: &Arc<Self>, destination: Destination, body: &[u8]) {
        match query::decode_response(body) {
            Ok(QueryResponse::Challenge(token)) => self.handle_challenge(destination, token),
            Ok(QueryResponse::Info(info)) => {
                self.complete_udp(destination, QueryKind::Info, Response::Info(info))
            }
            Ok(QueryResponse::Players(players)) => {
                self.complete_udp(destination, QueryKind::Players, Response::Players(players))
            }
            Ok(QueryResponse::Rules(rules)) => {
                self.complete_udp(destination, QueryKind::Rules, Response::Rules(rules))
            }
            Err(e) => {
                tracing::warn!("undecodable query response from {}: {}", destination, e);
                self.record_udp_error(destination, e.into());
            }
        }
    }

    /// Transparently re-send the oldest eligible PLAYERS/RULES request with
    /// the server's challenge token. At most one retry per request.
    fn handle_challenge(self: &Arc<Self>, destination: Destination, token: i32) {
        let resend = {
            let mut table = self.table.lock().expect("pending table poisoned");
            let key = table.oldest_matching(&destination, |e| {
                e.request.payload.challengeable() && !e.challenge_retried
            });
            match key {
                Some(key) => {
                    let entry = table.get_mut(&key).expect("key just found");
                    entry.challenge_retried = true;
                    if let Some(payload) = entry.request.payload.with_challenge(token) {
                        entry.request.payload = payload;
                    }
                    Some((
                        key,
                        entry.token,
                        query::encode_request(&entry.request.payload),
                        entry.request.destination,
                    ))
                }
                None => None,
            }
        };

        let Some((key, entry_token, bytes, destination)) = resend else {
            tracing::warn!(
                "challenge from {} with no eligible pending request; dropping",
                destination
            );
            return;
        };

        tracing::debug!("answering challenge from {} with token {:#010X}", destination, token);
        // The challenge answer jumps the lane so a queued same-kind request
        // cannot slip in between.
        if let Err(e) = self.udp.send(destination, bytes, Priority::High) {
            self.record_error(key, entry_token, e.into());
        }
    }

    fn complete_udp(self: &Arc<Self>, destination: Destination, kind: QueryKind, response: Response) {
        let key = (destination, CorrelationKey::Udp(kind));
        let entry = {
            let mut table = self.table.lock().expect("pending table poisoned");
            table.remove(&key)
        };
        match entry {
            Some(mut entry) => {
                if let Some(tx) = entry.tx.take() {
                    self.workers.complete(tx, Ok(response));
                }
                self.promote_next(key);
            }
            None => {
                tracing::debug!("dropping unmatched {:?} reply from {}", kind, destination);
            }
        }
    }

    /// Attribute a codec failure to the oldest in-flight UDP request.
    fn record_udp_error(self: &Arc<Self>, destination: Destination, error: SourcewireError) {
        let mut table = self.table.lock().expect("pending table poisoned");
        let key = table.oldest_matching(&destination, |e| {
            matches!(e.request.correlation_key(), CorrelationKey::Udp(_))
        });
        if let Some(key) = key {
            if let Some(entry) = table.get_mut(&key) {
                entry.last_error = Some(error);
            }
        }
    }

    // ------------------------------------------------------------------
    // RCON inbound
    // ------------------------------------------------------------------

    fn handle_stream(self: &Arc<Self>, destination: Destination, bytes: &[u8]) {
        let packets = {
            let mut streams = self.rcon_streams.lock().expect("rcon stream map poisoned");
            let stream = streams
                .entry(destination)
                .or_insert_with(|| RconStream::new(self.config.rcon_max_frame_bytes));
            stream.push(bytes)
        };

        match packets {
            Ok(packets) => {
                for packet in packets {
                    self.handle_rcon_packet(destination, packet);
                }
            }
            Err(e) => {
                tracing::warn!("rcon framing violation from {}: {}; closing", destination, e);
                self.fail_rcon_destination(destination, |_| {
                    crate::error::RconError::Framing("frame size out of range".into()).into()
                });
                self.tcp.close(destination);
                self.rcon_streams
                    .lock()
                    .expect("rcon stream map poisoned")
                    .remove(&destination);
                self.rcon_sessions
                    .lock()
                    .expect("rcon session table poisoned")
                    .remove(&destination);
            }
        }
    }

    fn handle_rcon_packet(self: &Arc<Self>, destination: Destination, packet: RconPacket) {
        match packet.packet_type {
            t if t == packet_type::AUTH_RESPONSE => self.handle_auth_response(destination, packet),
            t if t == packet_type::RESPONSE_VALUE => self.handle_response_value(destination, packet),
            other => {
                tracing::warn!(
                    "dropping rcon packet with unexpected type {} from {}",
                    other,
                    destination
                );
            }
        }
    }

    fn handle_auth_response(self: &Arc<Self>, destination: Destination, packet: RconPacket) {
        if packet.id == AUTH_FAILURE_ID {
            // Rejection does not echo the request id; it lands on the
            // destination's pending auth attempt.
            let key = {
                let table = self.table.lock().expect("pending table poisoned");
                table.oldest_matching(&destination, |e| {
                    matches!(e.request.payload, RequestPayload::Auth { .. })
                })
            };
            let Some(key) = key else {
                // No auth in flight: the server revoked an established
                // session. Drop the record and fail whatever is in flight
                // so callers do not wait out their deadlines.
                let was_authenticated = {
                    let mut sessions = self
                        .rcon_sessions
                        .lock()
                        .expect("rcon session table poisoned");
                    let authenticated = sessions
                        .get(&destination)
                        .map(|session| session.authenticated)
                        .unwrap_or(false);
                    if authenticated {
                        sessions.remove(&destination);
                    }
                    authenticated
                };
                if was_authenticated {
                    tracing::warn!(
                        "server deauthenticated {}; failing in-flight requests",
                        destination
                    );
                    self.fail_rcon_destination(destination, |_| {
                        crate::error::RconError::AuthRejected.into()
                    });
                } else {
                    tracing::debug!(
                        "dropping auth rejection from {} with no pending auth",
                        destination
                    );
                }
                return;
            };
            let entry = {
                let mut table = self.table.lock().expect("pending table poisoned");
                table.remove(&key)
            };
            if let Some(mut entry) = entry {
                if let Some(tx) = entry.tx.take() {
                    self.workers.complete(
                        tx,
                        Ok(Response::RconAuth {
                            authenticated: false,
                        }),
                    );
                }
            }
            return;
        }

        let key = (destination, CorrelationKey::Rcon(packet.id));
        let entry = {
            let mut table = self.table.lock().expect("pending table poisoned");
            let is_auth = table
                .get_mut(&key)
                .map(|e| matches!(e.request.payload, RequestPayload::Auth { .. }))
                .unwrap_or(false);
            if is_auth {
                table.remove(&key)
            } else {
                None
            }
        };

        let Some(mut entry) = entry else {
            tracing::debug!(
                "dropping auth response id {} from {} with no matching auth",
                packet.id,
                destination
            );
            return;
        };

        {
            let mut sessions = self.rcon_sessions.lock().expect("rcon session table poisoned");
            let session = sessions.entry(destination).or_default();
            session.authenticated = true;
            session.auth_id = Some(packet.id);
            session.last_used = Instant::now();
        }

        if let Some(tx) = entry.tx.take() {
            self.workers.complete(
                tx,
                Ok(Response::RconAuth {
                    authenticated: true,
                }),
            );
        }
    }

    fn handle_response_value(self: &Arc<Self>, destination: Destination, packet: RconPacket) {
        let key = (destination, CorrelationKey::Rcon(packet.id));

        enum Verdict {
            Accumulated,
            Finished,
            Ignored,
            Unmatched,
        }

        let verdict = {
            let mut table = self.table.lock().expect("pending table poisoned");
            match table.get_mut(&key) {
                None => Verdict::Unmatched,
                Some(entry) => match &entry.request.payload {
                    // The server mirrors an empty RESPONSE_VALUE before the
                    // auth verdict; it carries no information.
                    RequestPayload::Auth { .. } => Verdict::Ignored,
                    RequestPayload::Command { .. } => {
                        let is_pad = self.config.is_sentinel_pad(&packet.body);
                        let acc = entry.rcon.get_or_insert_with(RconAccumulator::default);
                        if is_pad {
                            Verdict::Finished
                        } else if packet.body.is_empty() {
                            acc.empty_streak += 1;
                            if acc.empty_streak >= 2 {
                                Verdict::Finished
                            } else {
                                entry.state = EntryState::Partial;
                                Verdict::Accumulated
                            }
                        } else {
                            acc.empty_streak = 0;
                            acc.bodies.push(packet.body.clone());
                            entry.state = EntryState::Partial;
                            Verdict::Accumulated
                        }
                    }
                    _ => Verdict::Ignored,
                },
            }
        };

        match verdict {
            Verdict::Unmatched => {
                tracing::debug!(
                    "dropping response_value id {} from {} with no pending command",
                    packet.id,
                    destination
                );
            }
            Verdict::Ignored | Verdict::Accumulated => {}
            Verdict::Finished => {
                let entry = {
                    let mut table = self.table.lock().expect("pending table poisoned");
                    table.remove(&key)
                };
                if let Some(mut entry) = entry {
                    let output = entry
                        .rcon
                        .take()
                        .map(RconAccumulator::into_output)
                        .unwrap_or_default();
                    if let Some(tx) = entry.tx.take() {
                        self.workers.complete(tx, Ok(Response::RconOutput(output)));
                    }
                }
            }
        }
    }

    /// Fail every in-flight RCON request on the destination.
    fn fail_rcon_destination<F>(self: &Arc<Self>, destination: Destination, mut error_for: F)
    where
        F: FnMut(&PendingEntry) -> SourcewireError,
    {
        let keys = {
            let table = self.table.lock().expect("pending table poisoned");
            table.keys_for_destination(&destination)
        };
        for key in keys {
            if !matches!(key.1, CorrelationKey::Rcon(_)) {
                continue;
            }
            let entry = {
                let mut table = self.table.lock().expect("pending table poisoned");
                table.remove(&key)
            };
            if let Some(mut entry) = entry {
                let error = error_for(&entry);
                if let Some(tx) = entry.tx.take() {
                    self.workers.complete(tx, Err(error));
                }
            }
        }
    }

    fn handle_closed(self: &Arc<Self>, destination: Destination, reason: CloseReason) {
        tracing::debug!("transport closed for {}: {:?}", destination, reason);

        self.rcon_streams
            .lock()
            .expect("rcon stream map poisoned")
            .remove(&destination);
        self.rcon_sessions
            .lock()
            .expect("rcon session table poisoned")
            .remove(&destination);

        let error: SourcewireError = match reason {
            CloseReason::ConnectFailed(e) => TransportError::ConnectFailed(e).into(),
            CloseReason::Eof | CloseReason::Io(_) => TransportError::Closed.into(),
        };
        // io::Error is not Clone; the first entry gets the detailed error
        // and the rest get Closed.
        let mut detailed = Some(error);
        self.fail_rcon_destination(destination, |_| {
            detailed
                .take()
                .unwrap_or_else(|| TransportError::Closed.into())
        });
    }
}
