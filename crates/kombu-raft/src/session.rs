//! Client sessions: per-session sequencing state and the session manager.
//!
//! A session carries two sequence cursors. `request_sequence` is the highest
//! client sequence the leader has accepted; commands arriving ahead of it
//! queue in `pending_requests` and drain in order as the cursor advances.
//! `command_sequence` is the highest sequence the state machine has applied;
//! sequential queries gate on it through `pending_queries`.
//!
//! The manager's client-facing maps (`addresses`, `connections`, `clients`)
//! are touched by the transport layer concurrently with the server loop, so
//! they live behind locks of their own. Per-session cursor and queue state
//! is only ever mutated by leader-side code.

use crate::types::{ClientId, LogIndex, SessionId};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Opaque transport connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered and live.
    Open,
    /// No keep-alive committed within the session timeout; the leader will
    /// author an expiry unregister.
    Unstable,
    /// Expired by the leader.
    Expired,
    /// Closed by the client.
    Closed,
}

/// Deferred continuation stored in a session queue.
pub(crate) type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// Stored command outcome for deduplication, keyed by sequence.
pub(crate) type StoredResult = std::result::Result<Bytes, String>;

struct SessionInner {
    state: SessionState,
    timeout: Duration,
    /// Timestamp (millis) of the last committed entry proving liveness.
    keep_alive_time: u64,
    command_sequence: u64,
    request_sequence: u64,
    event_index: LogIndex,
    pending_requests: BTreeMap<u64, Thunk>,
    pending_queries: BTreeMap<u64, Vec<Thunk>>,
    results: BTreeMap<u64, StoredResult>,
    unregistering: bool,
    address: Option<String>,
    connection: Option<ConnectionId>,
}

/// A client's logical connection to the replicated state machine.
pub struct Session {
    id: SessionId,
    client: ClientId,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(id: SessionId, client: ClientId, timeout: Duration, timestamp: u64) -> Self {
        Self {
            id,
            client,
            inner: Mutex::new(SessionInner {
                state: SessionState::Open,
                timeout,
                keep_alive_time: timestamp,
                command_sequence: 0,
                request_sequence: 0,
                event_index: LogIndex::ZERO,
                pending_requests: BTreeMap::new(),
                pending_queries: BTreeMap::new(),
                results: BTreeMap::new(),
                unregistering: false,
                address: None,
                connection: None,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.inner.lock().state = state;
    }

    pub fn timeout(&self) -> Duration {
        self.inner.lock().timeout
    }

    pub fn command_sequence(&self) -> u64 {
        self.inner.lock().command_sequence
    }

    pub fn request_sequence(&self) -> u64 {
        self.inner.lock().request_sequence
    }

    /// The sequence the leader expects from the client next.
    pub fn next_request_sequence(&self) -> u64 {
        self.inner.lock().request_sequence + 1
    }

    pub(crate) fn keep_alive_time(&self) -> u64 {
        self.inner.lock().keep_alive_time
    }

    pub fn is_unregistering(&self) -> bool {
        self.inner.lock().unregistering
    }

    pub(crate) fn set_unregistering(&self) {
        self.inner.lock().unregistering = true;
    }

    /// Queue a command continuation to run once the request cursor reaches
    /// `sequence - 1`.
    pub(crate) fn register_request(&self, sequence: u64, thunk: Thunk) {
        self.inner.lock().pending_requests.insert(sequence, thunk);
    }

    /// Queue a query continuation to run once the command cursor reaches
    /// `sequence`.
    pub(crate) fn register_sequence_query(&self, sequence: u64, thunk: Thunk) {
        self.inner
            .lock()
            .pending_queries
            .entry(sequence)
            .or_default()
            .push(thunk);
    }

    /// Advance the request cursor and return the continuations that are now
    /// runnable, in ascending sequence order. The caller runs them after the
    /// session lock is released; a drained command advances the cursor again
    /// when it executes, cascading through any further queue entries.
    #[must_use]
    pub(crate) fn set_request_sequence(&self, sequence: u64) -> Vec<Thunk> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if sequence > inner.request_sequence {
            inner.request_sequence = sequence;
        }
        let mut ready = Vec::new();
        while let Some(entry) = inner.pending_requests.first_entry() {
            if *entry.key() <= inner.request_sequence + 1 {
                ready.push(entry.remove());
            } else {
                break;
            }
        }
        ready
    }

    /// Advance the command cursor and return the query continuations gated
    /// at or below it, in ascending sequence order.
    #[must_use]
    pub(crate) fn set_command_sequence(&self, sequence: u64) -> Vec<Thunk> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if sequence > inner.command_sequence {
            inner.command_sequence = sequence;
        }
        let mut ready = Vec::new();
        while let Some(entry) = inner.pending_queries.first_entry() {
            if *entry.key() <= inner.command_sequence {
                ready.extend(entry.remove());
            } else {
                break;
            }
        }
        ready
    }

    /// Refresh liveness from a committed keep-alive: update the clock,
    /// release command results the client has acknowledged, and record the
    /// client's event position.
    pub(crate) fn keep_alive(&self, timestamp: u64, command_sequence: u64, event_index: LogIndex) {
        let mut inner = self.inner.lock();
        inner.keep_alive_time = timestamp;
        inner.event_index = event_index;
        if inner.state == SessionState::Unstable {
            inner.state = SessionState::Open;
        }
        let keep = inner.results.split_off(&(command_sequence + 1));
        inner.results = keep;
    }

    /// Refresh liveness only (initialize entries after an election gap).
    pub(crate) fn touch(&self, timestamp: u64) {
        let mut inner = self.inner.lock();
        if timestamp > inner.keep_alive_time {
            inner.keep_alive_time = timestamp;
        }
    }

    pub(crate) fn cache_result(&self, sequence: u64, result: StoredResult) {
        self.inner.lock().results.insert(sequence, result);
    }

    pub(crate) fn cached_result(&self, sequence: u64) -> Option<StoredResult> {
        self.inner.lock().results.get(&sequence).cloned()
    }

    pub(crate) fn set_address(&self, address: Option<String>) {
        self.inner.lock().address = address;
    }

    pub fn address(&self) -> Option<String> {
        self.inner.lock().address.clone()
    }

    pub(crate) fn set_connection(&self, connection: Option<ConnectionId>) {
        self.inner.lock().connection = connection;
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.inner.lock().connection
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("state", &self.state())
            .finish()
    }
}

type Listener = Box<dyn Fn(SessionId) + Send + Sync>;

/// Registry of sessions and their transport bindings.
pub struct SessionManager {
    local_address: String,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    clients: RwLock<HashMap<ClientId, Arc<Session>>>,
    addresses: RwLock<HashMap<ClientId, String>>,
    connections: RwLock<HashMap<ClientId, ConnectionId>>,
    expire_listeners: RwLock<Vec<Listener>>,
    close_listeners: RwLock<Vec<Listener>>,
}

impl SessionManager {
    pub fn new(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            sessions: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            addresses: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            expire_listeners: RwLock::new(Vec::new()),
            close_listeners: RwLock::new(Vec::new()),
        }
    }

    /// Invoke `f` when a session is expired by the leader.
    pub fn on_expire(&self, f: impl Fn(SessionId) + Send + Sync + 'static) {
        self.expire_listeners.write().push(Box::new(f));
    }

    /// Invoke `f` when a session is closed by its client.
    pub fn on_close(&self, f: impl Fn(SessionId) + Send + Sync + 'static) {
        self.close_listeners.write().push(Box::new(f));
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub fn client_session(&self, client: &ClientId) -> Option<Arc<Session>> {
        self.clients.read().get(client).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Register a session, picking up any address/connection bindings the
    /// client established before registering.
    pub(crate) fn register_session(&self, session: Arc<Session>) -> Arc<Session> {
        tracing::debug!(session = %session.id(), client = %session.client(), "registering session");
        session.set_address(self.addresses.read().get(&session.client()).cloned());
        session.set_connection(self.connections.read().get(&session.client()).copied());
        self.sessions.write().insert(session.id(), session.clone());
        self.clients.write().insert(session.client(), session.clone());
        session
    }

    /// Remove a session and its bindings. Returns the removed session.
    pub(crate) fn unregister_session(&self, id: SessionId) -> Option<Arc<Session>> {
        let session = self.sessions.write().remove(&id)?;
        tracing::debug!(session = %id, "unregistering session");
        self.clients.write().remove(&session.client());
        self.addresses.write().remove(&session.client());
        self.connections.write().remove(&session.client());
        Some(session)
    }

    pub(crate) fn notify_expired(&self, id: SessionId) {
        for listener in self.expire_listeners.read().iter() {
            listener(id);
        }
    }

    pub(crate) fn notify_closed(&self, id: SessionId) {
        for listener in self.close_listeners.read().iter() {
            listener(id);
        }
    }

    /// Record which server a client is connected through. If the client was
    /// previously connected locally and has moved to another server, the
    /// stale local connection binding is dropped.
    pub fn register_address(&self, client: ClientId, address: impl Into<String>) {
        let address = address.into();
        if let Some(session) = self.client_session(&client) {
            session.set_address(Some(address.clone()));
            if address != self.local_address {
                if self.connections.write().remove(&client).is_some() {
                    tracing::debug!(%client, %address, "client moved, dropping local connection");
                    session.set_connection(None);
                }
            }
        }
        self.addresses.write().insert(client, address);
    }

    /// Bind a transport connection to a client.
    pub fn register_connection(&self, client: ClientId, connection: ConnectionId) {
        if let Some(session) = self.client_session(&client) {
            session.set_connection(Some(connection));
        }
        self.connections.write().insert(client, connection);
    }

    /// Drop every binding to a closed transport connection.
    pub fn unregister_connection(&self, connection: ConnectionId) {
        let mut connections = self.connections.write();
        let clients: Vec<ClientId> = connections
            .iter()
            .filter(|(_, c)| **c == connection)
            .map(|(client, _)| *client)
            .collect();
        for client in clients {
            if let Some(session) = self.client_session(&client) {
                session.set_connection(None);
            }
            connections.remove(&client);
        }
    }

    /// Whether the session's client has a live local connection. Unknown
    /// sessions pass: they may have registered an instant ago.
    pub fn has_connection(&self, id: SessionId) -> bool {
        match self.session(id) {
            Some(session) => self.connections.read().contains_key(&session.client()),
            None => true,
        }
    }
}
