//! Core types: terms, indexes, identifiers, log entries, RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::cluster::{Configuration, Member};
use crate::error::ErrorKind;

/// Election term (monotonically increasing).
///
/// Terms establish logical epochs; each term has at most one leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is sentinel for "no entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Stable identifier of a cluster server.
///
/// A string to support DNS names, UUIDs, or host:port combinations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        MemberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque 128-bit client identifier, chosen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn random() -> Self {
        ClientId(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session identifier, assigned by the state machine on register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Wall-clock milliseconds used to timestamp log entries.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Replicated log entry.
///
/// Every variant carries the authoring term and a wall-clock timestamp.
/// `Query` is never appended to the log; it exists only as an in-memory
/// handle while a query is being sequenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
    /// Leader no-op written immediately on taking leadership. Commits
    /// entries from prior terms and resets session liveness clocks.
    Initialize { term: Term, timestamp: u64 },

    /// Full membership list.
    Configuration {
        term: Term,
        timestamp: u64,
        members: Vec<Member>,
    },

    /// Client state-machine command.
    Command {
        term: Term,
        timestamp: u64,
        session: SessionId,
        sequence: u64,
        command: Bytes,
    },

    /// Client query handle (in-memory only, never appended).
    Query {
        term: Term,
        timestamp: u64,
        session: SessionId,
        sequence: u64,
        index: LogIndex,
        query: Bytes,
    },

    /// Session registration.
    Register {
        term: Term,
        timestamp: u64,
        client: ClientId,
        timeout_millis: u64,
    },

    /// Client-to-server address association.
    Connect {
        term: Term,
        timestamp: u64,
        client: ClientId,
        address: String,
    },

    /// Session liveness refresh.
    KeepAlive {
        term: Term,
        timestamp: u64,
        session: SessionId,
        command_sequence: u64,
        event_index: LogIndex,
    },

    /// Session removal; `expired` distinguishes leader-driven expiry from
    /// a client-requested close.
    Unregister {
        term: Term,
        timestamp: u64,
        session: SessionId,
        expired: bool,
    },
}

impl Entry {
    pub fn term(&self) -> Term {
        match self {
            Entry::Initialize { term, .. }
            | Entry::Configuration { term, .. }
            | Entry::Command { term, .. }
            | Entry::Query { term, .. }
            | Entry::Register { term, .. }
            | Entry::Connect { term, .. }
            | Entry::KeepAlive { term, .. }
            | Entry::Unregister { term, .. } => *term,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Entry::Initialize { timestamp, .. }
            | Entry::Configuration { timestamp, .. }
            | Entry::Command { timestamp, .. }
            | Entry::Query { timestamp, .. }
            | Entry::Register { timestamp, .. }
            | Entry::Connect { timestamp, .. }
            | Entry::KeepAlive { timestamp, .. }
            | Entry::Unregister { timestamp, .. } => *timestamp,
        }
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Query consistency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Apply locally once the session has caught up; no replication.
    Sequential,
    /// Like `Sequential`, valid only under the leader's heartbeat lease.
    LinearizableLease,
    /// Confirm leadership with a quorum round-trip before applying.
    Linearizable,
}

/// AppendEntries RPC request (leader → peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: MemberId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub commit_index: LogIndex,
}

/// AppendEntries RPC response.
///
/// On failure `log_index` doubles as a backtracking hint: the leader resets
/// the peer's next index to `min(next - 1, log_index + 1)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub status: ResponseStatus,
    pub term: Term,
    pub succeeded: bool,
    pub log_index: LogIndex,
}

/// Vote RPC request (candidate → peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Vote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub status: ResponseStatus,
    pub term: Term,
    pub voted: bool,
}

/// Poll RPC request (pre-vote probe).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub term: Term,
    pub candidate: MemberId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Poll RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub status: ResponseStatus,
    pub term: Term,
    pub accepted: bool,
}

/// Client command request (linearizable write).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session: SessionId,
    pub sequence: u64,
    pub command: Bytes,
}

/// Client command response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
    pub index: LogIndex,
    pub result: Option<Bytes>,
}

impl CommandResponse {
    pub fn ok(index: LogIndex, result: Bytes) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            index,
            result: Some(result),
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(kind),
            index: LogIndex::ZERO,
            result: None,
        }
    }
}

/// Client query request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session: SessionId,
    pub sequence: u64,
    /// Highest event index the client has seen; echoed into the in-memory
    /// query handle.
    pub index: LogIndex,
    pub query: Bytes,
    /// Defaults to `Linearizable` when unspecified.
    pub consistency: Option<Consistency>,
}

/// Client query response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
    pub index: LogIndex,
    pub result: Option<Bytes>,
}

impl QueryResponse {
    pub fn ok(index: LogIndex, result: Bytes) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            index,
            result: Some(result),
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(kind),
            index: LogIndex::ZERO,
            result: None,
        }
    }
}

/// Session registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client: ClientId,
}

/// Session registration response.
///
/// Carries the leader's client-facing address and the addresses of all
/// members so the client can discover the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
    pub session: Option<SessionId>,
    pub timeout_millis: u64,
    pub leader: Option<String>,
    pub members: Vec<String>,
}

impl RegisterResponse {
    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(kind),
            session: None,
            timeout_millis: 0,
            leader: None,
            members: Vec::new(),
        }
    }
}

/// Connection association request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub client: ClientId,
}

/// Connection association response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
    pub leader: Option<String>,
    pub members: Vec<String>,
}

/// Address replication request (issued by the leader on behalf of a
/// connecting client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub client: ClientId,
    pub address: String,
}

/// Address replication response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
}

impl AcceptResponse {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(kind),
        }
    }
}

/// Session keep-alive request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session: SessionId,
    /// Highest command sequence for which the client has received a response.
    pub command_sequence: u64,
    /// Highest event index the client has received.
    pub event_index: LogIndex,
}

/// Session keep-alive response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
    pub leader: Option<String>,
    pub members: Vec<String>,
}

impl KeepAliveResponse {
    /// Error responses still carry the leader address so a confused client
    /// can find its way back.
    pub fn error(kind: ErrorKind, leader: Option<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(kind),
            leader,
            members: Vec::new(),
        }
    }
}

/// Session unregister request (client-requested close).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub session: SessionId,
}

/// Session unregister response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
}

impl UnregisterResponse {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(kind),
        }
    }
}

/// Membership join request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub member: Member,
}

/// Membership join response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
    pub index: LogIndex,
    pub term: Term,
    pub timestamp: u64,
    pub members: Vec<Member>,
}

impl JoinResponse {
    pub fn ok(configuration: &Configuration) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            index: configuration.index,
            term: configuration.term,
            timestamp: configuration.timestamp,
            members: configuration.members.clone(),
        }
    }

    pub fn error(kind: Option<ErrorKind>) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: kind,
            index: LogIndex::ZERO,
            term: Term::ZERO,
            timestamp: 0,
            members: Vec::new(),
        }
    }
}

/// Membership leave request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub member: MemberId,
}

/// Membership leave response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
    pub index: LogIndex,
    pub members: Vec<Member>,
}

impl LeaveResponse {
    pub fn ok(index: LogIndex, members: Vec<Member>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            index,
            members,
        }
    }

    pub fn error(kind: Option<ErrorKind>) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: kind,
            index: LogIndex::ZERO,
            members: Vec::new(),
        }
    }
}

/// Membership reconfigure request (address, kind, or status change).
///
/// `index`/`term` reference the configuration the caller observed; `index`
/// zero means "unspecified".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    pub index: LogIndex,
    pub term: Term,
    pub member: Member,
}

/// Membership reconfigure response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigureResponse {
    pub status: ResponseStatus,
    pub error: Option<ErrorKind>,
    pub index: LogIndex,
    pub term: Term,
    pub timestamp: u64,
    pub members: Vec<Member>,
}

impl ReconfigureResponse {
    pub fn ok(configuration: &Configuration) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            index: configuration.index,
            term: configuration.term,
            timestamp: configuration.timestamp,
            members: configuration.members.clone(),
        }
    }

    pub fn error(kind: Option<ErrorKind>) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: kind,
            index: LogIndex::ZERO,
            term: Term::ZERO,
            timestamp: 0,
            members: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering() {
        assert!(Term(2) > Term(1));
        assert_eq!(Term(5).next(), Term(6));
    }

    #[test]
    fn test_log_index_ordering() {
        assert!(LogIndex(10) > LogIndex(5));
        assert_eq!(LogIndex(5).next(), LogIndex(6));
        assert_eq!(LogIndex(5).prev(), Some(LogIndex(4)));
        assert_eq!(LogIndex(0).prev(), None);
    }

    #[test]
    fn test_entry_accessors() {
        let entry = Entry::Initialize {
            term: Term(3),
            timestamp: 42,
        };
        assert_eq!(entry.term(), Term(3));
        assert_eq!(entry.timestamp(), 42);
    }
}
