//! kombu-raft: the leader role of a session-oriented replicated state machine.
//!
//! Implements the leader side of a Raft-style server with:
//! - Log replication with conflict-hint backtracking and quorum commit tracking
//! - A leader no-op (initialize) entry gating commitment of prior-term entries
//! - Client sessions with per-session command sequencing and deduplication
//! - Three query consistency levels (sequential, lease-bounded, linearizable)
//! - Leader-only session expiry via replicated unregister entries
//! - One-at-a-time cluster membership changes with promotable joins
//!
//! The surrounding roles (follower, candidate, reserve, passive) are external
//! collaborators: the leader requests transitions through a hook on
//! [`ServerState`] and the embedding server swaps roles. Log persistence,
//! snapshotting, and elections live outside this crate.

pub mod config;
pub mod error;
pub mod types;
pub mod log;
pub mod transport;
pub mod cluster;
pub mod session;
pub mod fsm;
pub mod state;
pub mod appender;
pub mod leader;

pub use appender::Appender;
pub use cluster::{ClusterState, Configuration, Member, MemberKind, MemberStatus};
pub use config::ServerConfig;
pub use error::{ErrorKind, RaftError, Result};
pub use fsm::{ApplyOutcome, CoreStateMachine, Service, ServiceError, StateMachine};
pub use leader::LeaderRole;
pub use session::{ConnectionId, Session, SessionManager, SessionState};
pub use state::{Role, ServerState};
pub use types::*;
