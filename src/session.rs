//! # Sessions and the Session Table
//!
//! A session is one end-to-end TCP pairing carried by the tunnel, named by
//! a 128-bit [`SessionId`] drawn from the system CSPRNG. Each side keeps a
//! [`SessionTable`] mapping ids to live [`SessionHandle`]s; the ingress
//! side additionally keeps an advisory index of sessions per listen port.
//!
//! ## Pumps
//!
//! Every live session runs two tasks:
//!
//! - **socket → link**: reads chunks from the TCP socket and submits Data
//!   frames. When the socket ends (EOF or error) it tears the session down
//!   and, if it was the first to observe closure, emits one Disconnect.
//! - **link → socket**: drains the session's payload channel into the TCP
//!   socket, preserving order.
//!
//! Whoever removes the session from the table owns the teardown; a `remove`
//! returning `Some` is the single linearization point, so the Disconnect is
//! emitted at most once even when local close races a peer Disconnect.
//!
//! ## Cancellation
//!
//! Closing a session from the frame-consumer side (peer Disconnect,
//! shutdown) flips a watch flag; both pumps observe it and drop their
//! socket halves, which closes the socket.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace};

use crate::link::LinkWriter;

/// Capacity of each session's payload channel (link → socket direction).
/// A full channel suspends the frame consumer, which is how a slow local
/// socket backpressures the whole link.
pub const SESSION_CHANNEL_CAPACITY: usize = 64;

/// Read size for the socket → link pump. Chunks may be smaller; byte order
/// is what matters.
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

// ============================================================================
// SessionId
// ============================================================================

/// CSPRNG failure while minting a session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsprngError {
    pub code: Option<u32>,
}

impl std::fmt::Display for CsprngError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "CSPRNG unavailable (error code {})", code),
            None => write!(f, "CSPRNG unavailable"),
        }
    }
}

impl std::error::Error for CsprngError {}

impl From<getrandom::Error> for CsprngError {
    fn from(err: getrandom::Error) -> Self {
        Self {
            code: Some(err.code().get()),
        }
    }
}

/// 128-bit opaque session identifier, globally unique for the lifetime of
/// the tunnel pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Mint a fresh id from the system CSPRNG.
    pub fn generate() -> Result<Self, CsprngError> {
        let mut id = [0u8; 16];
        getrandom::getrandom(&mut id)?;
        Ok(Self(id))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First four bytes as hex, the logging form.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({})", self.short_hex())
    }
}

// ============================================================================
// SessionHandle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Drain in progress: Disconnect emitted, socket not yet closed.
    HalfClosed,
    Closed,
}

/// Cheaply cloneable per-session record. The payload receiver is handed to
/// the socket-writer pump at creation; everything else is shared.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub target: SocketAddrV4,
    /// Listen port the client arrived on. Ingress only.
    pub local_port: Option<u16>,
    data_tx: mpsc::Sender<Vec<u8>>,
    closing: Arc<watch::Sender<bool>>,
    state: Arc<Mutex<SessionState>>,
    frames_relayed: Arc<AtomicU64>,
    bytes_relayed: Arc<AtomicU64>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("local_port", &self.local_port)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    /// Create a handle plus the payload receiver for its writer pump.
    pub fn channel(
        id: SessionId,
        target: SocketAddrV4,
        local_port: Option<u16>,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (data_tx, data_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (closing, _) = watch::channel(false);
        let handle = Self {
            id,
            target,
            local_port,
            data_tx,
            closing: Arc::new(closing),
            state: Arc::new(Mutex::new(SessionState::Open)),
            frames_relayed: Arc::new(AtomicU64::new(0)),
            bytes_relayed: Arc::new(AtomicU64::new(0)),
        };
        (handle, data_rx)
    }

    /// Queue a payload for the local socket. Suspends when the session's
    /// channel is full; errs when the writer pump is gone.
    pub async fn deliver(&self, payload: Vec<u8>) -> Result<(), SessionGone> {
        self.data_tx.send(payload).await.map_err(|_| SessionGone(self.id))
    }

    /// Flip the closing flag. Both pumps observe it and drop their socket
    /// halves. Idempotent, and effective even before any pump subscribes.
    pub fn cancel(&self) {
        self.closing.send_replace(true);
    }

    /// A receiver resolving once [`cancel`](Self::cancel) has been called,
    /// including when it was called before subscription.
    pub fn closing(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Record one relayed chunk. The frame counter doubles as the
    /// send-side sequence counter; it is never transmitted.
    pub fn record_relayed(&self, bytes: usize) {
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frames_relayed(&self) -> u64 {
        self.frames_relayed.load(Ordering::Relaxed)
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }
}

/// The session's writer pump has exited; payloads can no longer be
/// delivered.
#[derive(Debug, Clone, Copy)]
pub struct SessionGone(pub SessionId);

impl std::fmt::Display for SessionGone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session {} is no longer accepting payloads", self.0)
    }
}

impl std::error::Error for SessionGone {}

// ============================================================================
// SessionTable
// ============================================================================

/// Insert refused: the id is already live on this side.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateSession(pub SessionId);

impl std::fmt::Display for DuplicateSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session {} already present", self.0)
    }
}

impl std::error::Error for DuplicateSession {}

#[derive(Default)]
struct TableInner {
    sessions: HashMap<SessionId, SessionHandle>,
    /// Advisory ingress index; converges on remove, never consulted for
    /// routing.
    by_port: HashMap<u16, Vec<SessionId>>,
}

/// Associative container keyed by [`SessionId`]. Insert and remove are
/// atomic; a concurrent `get` sees the pre- or post-state, never a torn
/// value.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<TableInner>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: SessionHandle) -> Result<(), DuplicateSession> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.sessions.contains_key(&handle.id) {
            return Err(DuplicateSession(handle.id));
        }
        if let Some(port) = handle.local_port {
            inner.by_port.entry(port).or_default().push(handle.id);
        }
        inner.sessions.insert(handle.id, handle);
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<SessionHandle> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sessions.get(&id).cloned()
    }

    /// Idempotent removal; returns the handle if the session was live.
    pub fn remove(&self, id: SessionId) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let handle = inner.sessions.remove(&id)?;
        if let Some(port) = handle.local_port {
            if let Some(ids) = inner.by_port.get_mut(&port) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    inner.by_port.remove(&port);
                }
            }
        }
        Some(handle)
    }

    /// Snapshot of live ids; safe to iterate while the table mutates.
    pub fn ids(&self) -> Vec<SessionId> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sessions.keys().copied().collect()
    }

    /// Empty the table, returning every handle. Terminal; shutdown only.
    pub fn drain(&self) -> Vec<SessionHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_port.clear();
        inner.sessions.drain().map(|(_, handle)| handle).collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions currently attributed to an ingress listen port.
    pub fn sessions_on_port(&self, port: u16) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_port.get(&port).map(Vec::len).unwrap_or(0)
    }
}

// ============================================================================
// ActiveSessions (drain accounting)
// ============================================================================

struct ActiveInner {
    count: AtomicUsize,
    idle: Notify,
}

/// Counts running pump tasks so shutdown can wait, with a bounded timeout,
/// for sockets to drain and close.
#[derive(Clone)]
pub struct ActiveSessions {
    inner: Arc<ActiveInner>,
}

impl Default for ActiveSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ActiveInner {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Register one running pump; the guard deregisters on drop.
    pub fn guard(&self) -> ActivityGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolve once no pump is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct ActivityGuard {
    inner: Arc<ActiveInner>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

// ============================================================================
// Session pumps (shared by both sides)
// ============================================================================

/// Spawn both pumps for a connected session. Used by ingress after accept
/// and by egress after a successful dial.
pub fn spawn_session_pumps(
    stream: TcpStream,
    handle: SessionHandle,
    data_rx: mpsc::Receiver<Vec<u8>>,
    table: Arc<SessionTable>,
    link: LinkWriter,
    active: ActiveSessions,
) {
    let (read_half, write_half) = stream.into_split();

    tokio::spawn(pump_socket_to_link(
        read_half,
        handle.clone(),
        Arc::clone(&table),
        link.clone(),
        active.guard(),
    ));
    tokio::spawn(pump_link_to_socket(
        write_half,
        handle,
        data_rx,
        table,
        link,
        active.guard(),
    ));
}

/// Tear the session down after a locally-observed end (EOF, socket error).
/// Removal from the table is the linearization point: only the task that
/// wins it cancels the pumps and, when the peer does not already know,
/// emits the session's single Disconnect.
async fn finish_session(
    table: &SessionTable,
    link: &LinkWriter,
    handle: &SessionHandle,
    notify_peer: bool,
) {
    if let Some(removed) = table.remove(handle.id) {
        removed.set_state(SessionState::Closed);
        removed.cancel();
        if notify_peer {
            if let Err(e) = link.disconnect(handle.id).await {
                debug!(session = %handle.id.short_hex(), error = %e, "could not notify peer of close");
            }
        }
        info!(
            session = %handle.id.short_hex(),
            frames_relayed = removed.frames_relayed(),
            bytes_relayed = removed.bytes_relayed(),
            "session closed"
        );
    }
}

/// Awaits the closing flag becoming true without holding the `watch::Ref`
/// guard across the await point, so callers remain `Send` inside `select!`.
async fn wait_for_closing(closing: &mut watch::Receiver<bool>) {
    loop {
        if *closing.borrow() {
            return;
        }
        if closing.changed().await.is_err() {
            return;
        }
    }
}

/// socket → link. Exits on socket EOF/error, link death, or cancellation.
/// Submits the session's Disconnect right after its last Data frame, on the
/// same serialised path, so the peer sees them in that order.
async fn pump_socket_to_link(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    handle: SessionHandle,
    table: Arc<SessionTable>,
    link: LinkWriter,
    _guard: ActivityGuard,
) {
    let mut closing = handle.closing();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    let notify_peer = loop {
        tokio::select! {
            res = read_half.read(&mut buf) => match res {
                Ok(0) => {
                    debug!(session = %handle.id.short_hex(), "local socket EOF");
                    break true;
                }
                Ok(n) => {
                    handle.record_relayed(n);
                    if link
                        .data(handle.id, handle.target, buf[..n].to_vec())
                        .await
                        .is_err()
                    {
                        // Link writer is gone; shutdown will reap us.
                        break false;
                    }
                }
                Err(e) => {
                    debug!(session = %handle.id.short_hex(), error = %e, "local socket read error");
                    break true;
                }
            },
            _ = wait_for_closing(&mut closing) => break false,
        }
    };

    finish_session(&table, &link, &handle, notify_peer).await;
}

/// link → socket. Drains the payload channel in order; on cancellation it
/// flushes what was already queued, then closes the write half. A socket
/// write error ends the session like any other locally-observed close.
async fn pump_link_to_socket(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    handle: SessionHandle,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    table: Arc<SessionTable>,
    link: LinkWriter,
    _guard: ActivityGuard,
) {
    let mut closing = handle.closing();

    loop {
        tokio::select! {
            msg = data_rx.recv() => match msg {
                Some(payload) => {
                    if let Err(e) = write_half.write_all(&payload).await {
                        debug!(session = %handle.id.short_hex(), error = %e, "local socket write error");
                        finish_session(&table, &link, &handle, true).await;
                        return;
                    }
                }
                None => break,
            },
            _ = wait_for_closing(&mut closing) => break,
        }
    }

    // Deliver payloads that were already queued when the session closed.
    loop {
        match data_rx.try_recv() {
            Ok(payload) => {
                if write_half.write_all(&payload).await.is_err() {
                    finish_session(&table, &link, &handle, true).await;
                    return;
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }

    if let Err(e) = write_half.shutdown().await {
        trace!(session = %handle.id.short_hex(), error = %e, "socket shutdown");
    }
}

/// Close a session at the request of the peer or the shutdown coordinator:
/// remove it, cancel its pumps, emit nothing back.
pub fn close_without_notify(table: &SessionTable, id: SessionId) -> bool {
    match table.remove(id) {
        Some(handle) => {
            handle.set_state(SessionState::Closed);
            handle.cancel();
            true
        }
        None => false,
    }
}
