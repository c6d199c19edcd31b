//! Shared server state: term/leader/commit bookkeeping and the role
//! transition hook.
//!
//! The leader role never owns the follower or candidate logic; when it must
//! give up leadership it records the change here and requests a transition.
//! The embedding server listens on the transition channel and swaps roles.
//! The minimal follower-side append/vote paths live here so a deposed
//! leader can delegate the triggering request instead of dropping it.

use crate::cluster::ClusterState;
use crate::config::ServerConfig;
use crate::fsm::StateMachine;
use crate::log::Log;
use crate::session::SessionManager;
use crate::transport::RaftTransport;
use crate::types::*;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Server role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Reserve,
    Passive,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
            Role::Reserve => write!(f, "reserve"),
            Role::Passive => write!(f, "passive"),
        }
    }
}

struct StateInner {
    term: Term,
    leader: Option<MemberId>,
    voted_for: Option<MemberId>,
    commit_index: LogIndex,
    role: Role,
}

/// State shared by the leader role and its collaborators.
pub struct ServerState {
    member_id: MemberId,
    config: ServerConfig,
    log: Log,
    cluster: Arc<ClusterState>,
    sessions: Arc<SessionManager>,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn RaftTransport>,
    inner: RwLock<StateInner>,
    transitions: mpsc::UnboundedSender<Role>,
}

impl ServerState {
    /// Build the shared state. Returns the receiving side of the transition
    /// hook; the embedding server drains it to swap roles.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        member_id: MemberId,
        config: ServerConfig,
        log: Log,
        cluster: Arc<ClusterState>,
        sessions: Arc<SessionManager>,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Role>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Self {
            member_id,
            config,
            log,
            cluster,
            sessions,
            state_machine,
            transport,
            inner: RwLock::new(StateInner {
                term: Term::ZERO,
                leader: None,
                voted_for: None,
                commit_index: LogIndex::ZERO,
                role: Role::Follower,
            }),
            transitions: tx,
        });
        (state, rx)
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn state_machine(&self) -> &Arc<dyn StateMachine> {
        &self.state_machine
    }

    pub fn transport(&self) -> &Arc<dyn RaftTransport> {
        &self.transport
    }

    pub fn term(&self) -> Term {
        self.inner.read().term
    }

    pub fn set_term(&self, term: Term) {
        let mut inner = self.inner.write();
        if term > inner.term {
            inner.term = term;
            inner.voted_for = None;
        }
    }

    pub fn leader(&self) -> Option<MemberId> {
        self.inner.read().leader.clone()
    }

    pub fn set_leader(&self, leader: Option<MemberId>) {
        self.inner.write().leader = leader;
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.read().commit_index
    }

    /// Advance the commit index; it never moves backwards.
    pub fn set_commit_index(&self, index: LogIndex) {
        let mut inner = self.inner.write();
        if index > inner.commit_index {
            inner.commit_index = index;
        }
    }

    pub fn role(&self) -> Role {
        self.inner.read().role
    }

    /// Record the role and notify the embedding server.
    pub fn transition(&self, role: Role) {
        {
            let mut inner = self.inner.write();
            if inner.role == role {
                return;
            }
            tracing::debug!(from = %inner.role, to = %role, "requesting role transition");
            inner.role = role;
        }
        let _ = self.transitions.send(role);
    }

    /// Adopt a greater term (or a newly-learned leader in the current term).
    /// Returns true when the caller must step down.
    pub fn update_term_and_leader(&self, term: Term, leader: Option<MemberId>) -> bool {
        let mut inner = self.inner.write();
        if term > inner.term || (term == inner.term && leader.is_some() && inner.leader.is_none()) {
            if term > inner.term {
                inner.term = term;
                inner.voted_for = None;
            }
            inner.leader = leader;
            true
        } else {
            false
        }
    }

    /// Step down after observing `term` from a peer response.
    pub fn step_down(&self, term: Term) {
        {
            let mut inner = self.inner.write();
            if term > inner.term {
                inner.term = term;
                inner.voted_for = None;
            }
            inner.leader = None;
        }
        self.transition(Role::Follower);
    }

    /// Follower-side AppendEntries handling, used by a deposed leader to
    /// delegate the request that unseated it.
    pub fn append_as_follower(&self, request: AppendRequest) -> AppendResponse {
        if request.term < self.term() {
            return AppendResponse {
                status: ResponseStatus::Ok,
                term: self.term(),
                succeeded: false,
                log_index: self.log.last_index(),
            };
        }

        {
            let mut inner = self.inner.write();
            if request.term > inner.term {
                inner.term = request.term;
                inner.voted_for = None;
            }
            inner.leader = Some(request.leader.clone());
        }

        // Consistency check against the entry preceding the batch.
        if request.prev_log_index != LogIndex::ZERO {
            let matches = self
                .log
                .get(request.prev_log_index)
                .map(|e| e.term() == request.prev_log_term)
                .unwrap_or(false);
            if !matches {
                let hint = request
                    .prev_log_index
                    .prev()
                    .unwrap_or(LogIndex::ZERO)
                    .min(self.log.last_index());
                return AppendResponse {
                    status: ResponseStatus::Ok,
                    term: self.term(),
                    succeeded: false,
                    log_index: hint,
                };
            }
        }

        if !request.entries.is_empty() {
            self.log.truncate(request.prev_log_index.next());
            for entry in request.entries {
                self.log.append(entry);
            }
        }

        let last = self.log.last_index();
        {
            let mut inner = self.inner.write();
            if request.commit_index > inner.commit_index {
                inner.commit_index = request.commit_index.min(last);
            }
        }

        AppendResponse {
            status: ResponseStatus::Ok,
            term: self.term(),
            succeeded: true,
            log_index: last,
        }
    }

    /// Follower-side vote handling, used by a deposed leader to delegate
    /// the vote request that unseated it.
    pub fn vote_as_follower(&self, request: VoteRequest) -> VoteResponse {
        let last_index = self.log.last_index();
        let last_term = self.log.last_term();

        let mut inner = self.inner.write();
        if request.term > inner.term {
            inner.term = request.term;
            inner.voted_for = None;
            inner.leader = None;
        }

        let mut voted = false;
        if request.term >= inner.term {
            let already_voted = inner
                .voted_for
                .as_ref()
                .map_or(false, |v| v != &request.candidate);
            if !already_voted {
                let log_ok = request.last_log_term > last_term
                    || (request.last_log_term == last_term
                        && request.last_log_index >= last_index);
                if log_ok {
                    voted = true;
                    inner.voted_for = Some(request.candidate.clone());
                }
            }
        }

        VoteResponse {
            status: ResponseStatus::Ok,
            term: inner.term,
            voted,
        }
    }
}
