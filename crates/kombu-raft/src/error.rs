//! Error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MemberId, SessionId};

/// Wire-level error kind carried in error responses.
///
/// Clients switch on this to decide whether to retry, re-register, or
/// surface an application failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The referenced session is not registered.
    UnknownSession,
    /// Stale or conflicting configuration change.
    Configuration,
    /// A linearizable query could not confirm leadership.
    Query,
    /// Replication failure, unexpected apply failure, or step-down.
    Internal,
    /// Application-defined failure surfaced verbatim from the state machine.
    Application(String),
}

/// Errors raised inside the leader role.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader (cannot serve the request).
    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<MemberId> },

    /// The leader stepped down while the operation was in flight.
    #[error("leader stepped down")]
    SteppedDown,

    /// Quorum unavailable (not enough replicas reachable).
    #[error("quorum unavailable (need {needed}, have {available})")]
    QuorumUnavailable { needed: usize, available: usize },

    /// Session id not present.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// Stale or conflicting configuration change.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Application failure from the state machine, surfaced by kind.
    #[error("service error: {kind}")]
    Service { kind: String },

    /// I/O error (transport, etc.).
    #[error("i/o error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Internal error (bug).
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl RaftError {
    /// Translate to the wire-level kind, unwrapping one layer of
    /// application failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RaftError::UnknownSession(_) => ErrorKind::UnknownSession,
            RaftError::Configuration { .. } => ErrorKind::Configuration,
            RaftError::Service { kind } => ErrorKind::Application(kind.clone()),
            _ => ErrorKind::Internal,
        }
    }
}

/// Result type for leader operations.
pub type Result<T> = std::result::Result<T, RaftError>;
