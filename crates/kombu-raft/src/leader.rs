//! The leader role: RPC handlers, client operations, configuration
//! coordination, and session expiry.
//!
//! Handlers either return a response or, when the leader stepped down while
//! the request was in flight, `Err(SteppedDown)`: the role that replaces
//! this one owns the retry, and no response is emitted here. Queued
//! continuations hold only a weak reference to the role, so a closed leader
//! drops out of its own session queues instead of being kept alive by them.

use crate::appender::Appender;
use crate::cluster::{Configuration, Member, MemberKind, MemberStatus};
use crate::error::{ErrorKind, RaftError, Result};
use crate::fsm::ApplyOutcome;
use crate::session::{ConnectionId, Session, SessionState};
use crate::state::{Role, ServerState};
use crate::types::*;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot};

/// Server behavior while holding the leader role.
pub struct LeaderRole {
    state: Arc<ServerState>,
    appender: Arc<Appender>,
    this: Weak<LeaderRole>,
    open: AtomicBool,
    /// Index of an uncommitted configuration entry, or 0. Latched before
    /// replication begins so overlapping changes are rejected.
    configuring: AtomicU64,
    shutdown: broadcast::Sender<()>,
}

impl LeaderRole {
    /// Take leadership.
    ///
    /// Resets peer replication state, appends the initialize and
    /// configuration entries, starts the heartbeat driver, and arranges for
    /// the initialize entry to be applied once it commits. RPC handlers are
    /// bound immediately; [`LeaderRole::initializing`] reports readiness.
    pub fn open(state: Arc<ServerState>) -> Arc<Self> {
        state.transition(Role::Leader);
        state.set_leader(Some(state.member_id().clone()));
        state.cluster().reset_peers(state.log().last_index());

        let appender = Appender::new(state.clone());
        let (shutdown, _) = broadcast::channel(4);

        let leader = Arc::new_cyclic(|this| Self {
            state: state.clone(),
            appender: appender.clone(),
            this: this.clone(),
            open: AtomicBool::new(true),
            configuring: AtomicU64::new(0),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(appender.clone().run(shutdown.subscribe()));

        // A no-op entry authored in this term; entries from prior terms
        // cannot commit ahead of it.
        let term = state.term();
        let index = state.log().append(Entry::Initialize {
            term,
            timestamp: appender.time(),
        });
        assert_eq!(index, appender.index());
        tracing::debug!(%index, %term, "appended initialize entry");

        // Propagate the leader's view of the membership.
        let configure = leader.configure(state.cluster().members());
        tokio::spawn(async move {
            let _ = configure.await;
        });

        // Commit and apply the initialize entry; until then the leader is
        // initializing and configuration changes are refused.
        let this = leader.clone();
        tokio::spawn(async move {
            match this.appender.append_entries(Some(this.appender.index())).await {
                Ok(_) if this.is_open() => {
                    if let Err(e) = this.state.state_machine().apply(this.appender.index()) {
                        tracing::debug!(error = %e, "initialize entry failed to apply");
                    }
                }
                Err(_) if this.is_open() => {
                    this.state.set_leader(None);
                    this.state.transition(Role::Follower);
                }
                _ => {}
            }
        });

        leader
    }

    /// Relinquish the role: stop the heartbeat driver, cancel in-flight
    /// replication, and clear leadership if still held locally.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());
        self.appender.close();
        if self.state.leader().as_ref() == Some(self.state.member_id()) {
            self.state.set_leader(None);
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.state.role() == Role::Leader
    }

    pub fn appender(&self) -> &Arc<Appender> {
        &self.appender
    }

    /// Whether a configuration entry is awaiting commitment.
    pub fn configuring(&self) -> bool {
        self.configuring.load(Ordering::Acquire) != 0
    }

    /// Whether the leader's own initialize entry has yet to commit.
    /// Configuration changes are refused until then, which closes the
    /// single-server membership change race.
    pub fn initializing(&self) -> bool {
        self.state.commit_index() < self.appender.index()
    }

    fn arc(&self) -> Arc<Self> {
        self.this.upgrade().expect("leader role alive during handler")
    }

    // === peer RPCs =======================================================

    /// AppendEntries from a peer claiming leadership.
    pub fn append(&self, request: AppendRequest) -> AppendResponse {
        if self
            .state
            .update_term_and_leader(request.term, Some(request.leader.clone()))
        {
            // A greater term deposes this leader; handle the request the
            // way the follower role would and get out of the way.
            let response = self.state.append_as_follower(request);
            self.state.transition(Role::Follower);
            response
        } else if request.term < self.state.term() {
            AppendResponse {
                status: ResponseStatus::Ok,
                term: self.state.term(),
                succeeded: false,
                log_index: self.state.log().last_index(),
            }
        } else {
            // Same term: election safety makes two leaders impossible, but
            // defend by deferring to the peer anyway.
            self.state.set_leader(Some(request.leader.clone()));
            let response = self.state.append_as_follower(request);
            self.state.transition(Role::Follower);
            response
        }
    }

    pub fn vote(&self, request: VoteRequest) -> VoteResponse {
        if self.state.update_term_and_leader(request.term, None) {
            tracing::debug!(term = %request.term, "received a greater term");
            let response = self.state.vote_as_follower(request);
            self.state.transition(Role::Follower);
            response
        } else {
            VoteResponse {
                status: ResponseStatus::Ok,
                term: self.state.term(),
                voted: false,
            }
        }
    }

    pub fn poll(&self, _request: PollRequest) -> PollResponse {
        PollResponse {
            status: ResponseStatus::Ok,
            term: self.state.term(),
            accepted: false,
        }
    }

    // === client operations ==============================================

    /// Linearizable write.
    pub async fn command(&self, request: CommandRequest) -> Result<CommandResponse> {
        let Some(session) = self.state.sessions().session(request.session) else {
            return Ok(CommandResponse::error(ErrorKind::UnknownSession));
        };

        let (tx, rx) = oneshot::channel();
        self.sequence_command(request, session, tx);
        rx.await.map_err(|_| RaftError::SteppedDown)
    }

    /// Order the command by client sequence. Commands from the future queue
    /// in the session until the gap fills; duplicates run through and the
    /// state machine replays the stored response.
    fn sequence_command(
        &self,
        request: CommandRequest,
        session: Arc<Session>,
        tx: oneshot::Sender<CommandResponse>,
    ) {
        if request.sequence > session.next_request_sequence() {
            let weak = self.this.clone();
            let queued = session.clone();
            session.register_request(
                request.sequence,
                Box::new(move || {
                    if let Some(this) = weak.upgrade() {
                        this.apply_command(request, queued, tx);
                    }
                }),
            );
        } else {
            self.apply_command(request, session, tx);
        }
    }

    /// Append the command, kick replication, and advance the session's
    /// request cursor (which may release queued successors).
    fn apply_command(
        &self,
        request: CommandRequest,
        session: Arc<Session>,
        tx: oneshot::Sender<CommandResponse>,
    ) {
        if !self.is_open() {
            return;
        }

        let index = self.state.log().append(Entry::Command {
            term: self.state.term(),
            timestamp: now_millis(),
            session: request.session,
            sequence: request.sequence,
            command: request.command.clone(),
        });
        tracing::debug!(%index, session = %request.session, sequence = request.sequence, "appended command entry");

        let this = self.arc();
        tokio::spawn(async move {
            match this.appender.append_entries(Some(index)).await {
                Ok(_) => {
                    if !this.is_open() {
                        return;
                    }
                    let response = match this.state.state_machine().apply(index) {
                        Ok(ApplyOutcome::Value(bytes)) => CommandResponse::ok(index, bytes),
                        Ok(_) => CommandResponse::ok(index, Bytes::new()),
                        Err(e) => CommandResponse::error(e.kind()),
                    };
                    let _ = tx.send(response);
                }
                Err(_) => {
                    if this.is_open() {
                        let _ = tx.send(CommandResponse::error(ErrorKind::Internal));
                    }
                }
            }
        });

        let ready = session.set_request_sequence(request.sequence);
        for thunk in ready {
            thunk();
        }
    }

    /// Client query at the requested consistency level.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        match request.consistency.unwrap_or(Consistency::Linearizable) {
            // Lease-bounded queries gate exactly like sequential ones; lease
            // upkeep is the appender's concern, and this path only runs
            // while the leader believes itself current.
            Consistency::Sequential | Consistency::LinearizableLease => {
                self.query_local(request).await
            }
            Consistency::Linearizable => self.query_linearizable(request).await,
        }
    }

    async fn query_local(&self, request: QueryRequest) -> Result<QueryResponse> {
        let Some(session) = self.state.sessions().session(request.session) else {
            return Ok(QueryResponse::error(ErrorKind::UnknownSession));
        };

        let (tx, rx) = oneshot::channel();
        self.sequence_query(request, session, tx);
        rx.await.map_err(|_| RaftError::SteppedDown)
    }

    /// Gate the query on the session's applied command sequence.
    fn sequence_query(
        &self,
        request: QueryRequest,
        session: Arc<Session>,
        tx: oneshot::Sender<QueryResponse>,
    ) {
        if request.sequence > session.command_sequence() {
            tracing::debug!(session = %request.session, sequence = request.sequence, "queueing query behind session sequence");
            let weak = self.this.clone();
            session.register_sequence_query(
                request.sequence,
                Box::new(move || {
                    if let Some(this) = weak.upgrade() {
                        this.apply_query(request, tx);
                    }
                }),
            );
        } else {
            self.apply_query(request, tx);
        }
    }

    fn apply_query(&self, request: QueryRequest, tx: oneshot::Sender<QueryResponse>) {
        if !self.is_open() {
            return;
        }
        let response = match self
            .state
            .state_machine()
            .query(request.session, &request.query)
        {
            Ok(bytes) => QueryResponse::ok(self.state.state_machine().last_applied(), bytes),
            Err(e) => QueryResponse::error(e.kind()),
        };
        let _ = tx.send(response);
    }

    /// Linearizable queries prove leadership with a quorum round-trip
    /// before applying.
    async fn query_linearizable(&self, request: QueryRequest) -> Result<QueryResponse> {
        if self.state.sessions().session(request.session).is_none() {
            return Ok(QueryResponse::error(ErrorKind::UnknownSession));
        }

        // Reads are not served before this leader's initialize entry
        // commits.
        if self.initializing()
            && self
                .appender
                .append_entries(Some(self.appender.index()))
                .await
                .is_err()
        {
            return if self.is_open() {
                Ok(QueryResponse::error(ErrorKind::Query))
            } else {
                Err(RaftError::SteppedDown)
            };
        }

        match self.appender.append_entries(None).await {
            Ok(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                // The session may have expired while the round ran.
                let Some(session) = self.state.sessions().session(request.session) else {
                    return Ok(QueryResponse::error(ErrorKind::UnknownSession));
                };
                let (tx, rx) = oneshot::channel();
                self.sequence_query(request, session, tx);
                rx.await.map_err(|_| RaftError::SteppedDown)
            }
            Err(_) => {
                if self.is_open() {
                    Ok(QueryResponse::error(ErrorKind::Query))
                } else {
                    Err(RaftError::SteppedDown)
                }
            }
        }
    }

    // === session operations =============================================

    /// Create a session for a client.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let timeout_millis = self.state.config().session_timeout.as_millis() as u64;
        let index = self.state.log().append(Entry::Register {
            term: self.state.term(),
            timestamp: now_millis(),
            client: request.client,
            timeout_millis,
        });
        tracing::debug!(%index, client = %request.client, "appended register entry");

        let response = match self.appender.append_entries(Some(index)).await {
            Ok(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                match self.state.state_machine().apply(index) {
                    Ok(ApplyOutcome::Session(session)) => RegisterResponse {
                        status: ResponseStatus::Ok,
                        error: None,
                        session: Some(session),
                        timeout_millis,
                        leader: self.state.cluster().local_client_address(),
                        members: self.state.cluster().client_addresses(),
                    },
                    Ok(_) => RegisterResponse::error(ErrorKind::Internal),
                    Err(e) => RegisterResponse::error(e.kind()),
                }
            }
            Err(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                RegisterResponse::error(ErrorKind::Internal)
            }
        };

        self.check_sessions();
        Ok(response)
    }

    /// Associate a transport connection with a client and replicate the
    /// client's server address cluster-wide.
    pub async fn connect(
        &self,
        request: ConnectRequest,
        connection: ConnectionId,
    ) -> Result<ConnectResponse> {
        self.state
            .sessions()
            .register_connection(request.client, connection);

        // Replicate the association even when the client has no session
        // yet; a later registration picks the binding up.
        let accept = AcceptRequest {
            client: request.client,
            address: self.state.cluster().local_server_address().unwrap_or_default(),
        };
        let _ = self.accept(accept).await?;

        Ok(ConnectResponse {
            status: ResponseStatus::Ok,
            error: None,
            leader: self.state.cluster().local_client_address(),
            members: self.state.cluster().client_addresses(),
        })
    }

    /// Replicate the client's current server address.
    pub async fn accept(&self, request: AcceptRequest) -> Result<AcceptResponse> {
        let index = self.state.log().append(Entry::Connect {
            term: self.state.term(),
            timestamp: now_millis(),
            client: request.client,
            address: request.address.clone(),
        });
        tracing::debug!(%index, client = %request.client, address = %request.address, "appended connect entry");

        // The local index updates immediately; replication carries the
        // binding to peers.
        self.state
            .sessions()
            .register_address(request.client, request.address);

        let response = match self.appender.append_entries(Some(index)).await {
            Ok(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                match self.state.state_machine().apply(index) {
                    Ok(_) => AcceptResponse::ok(),
                    Err(e) => AcceptResponse::error(e.kind()),
                }
            }
            Err(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                AcceptResponse::error(ErrorKind::Internal)
            }
        };

        self.check_sessions();
        Ok(response)
    }

    /// Refresh a session's liveness.
    pub async fn keep_alive(&self, request: KeepAliveRequest) -> Result<KeepAliveResponse> {
        let index = self.state.log().append(Entry::KeepAlive {
            term: self.state.term(),
            timestamp: now_millis(),
            session: request.session,
            command_sequence: request.command_sequence,
            event_index: request.event_index,
        });
        tracing::debug!(%index, session = %request.session, "appended keep-alive entry");

        let leader = self.state.cluster().local_client_address();
        let response = match self.appender.append_entries(Some(index)).await {
            Ok(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                match self.state.state_machine().apply(index) {
                    Ok(_) => KeepAliveResponse {
                        status: ResponseStatus::Ok,
                        error: None,
                        leader,
                        members: self.state.cluster().client_addresses(),
                    },
                    Err(e) => KeepAliveResponse::error(e.kind(), leader),
                }
            }
            Err(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                KeepAliveResponse::error(ErrorKind::Internal, leader)
            }
        };

        self.check_sessions();
        Ok(response)
    }

    /// Close a session at the client's request.
    pub async fn unregister(&self, request: UnregisterRequest) -> Result<UnregisterResponse> {
        let index = self.state.log().append(Entry::Unregister {
            term: self.state.term(),
            timestamp: now_millis(),
            session: request.session,
            expired: false,
        });
        tracing::debug!(%index, session = %request.session, "appended unregister entry");

        let response = match self.appender.append_entries(Some(index)).await {
            Ok(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                match self.state.state_machine().apply(index) {
                    Ok(_) => UnregisterResponse::ok(),
                    Err(e) => UnregisterResponse::error(e.kind()),
                }
            }
            Err(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                UnregisterResponse::error(ErrorKind::Internal)
            }
        };

        self.check_sessions();
        Ok(response)
    }

    // === membership =====================================================

    /// Admit a member. Known members succeed idempotently with the current
    /// configuration.
    pub async fn join(&self, request: JoinRequest) -> Result<JoinResponse> {
        if self.configuring() || self.initializing() {
            return Ok(JoinResponse::error(None));
        }

        if self.state.cluster().member(&request.member.id).is_some() {
            return Ok(JoinResponse::ok(&self.state.cluster().configuration()));
        }

        let mut member = request.member;
        // Active joiners start promotable so a lagging newcomer cannot
        // shrink the effective quorum while it catches up.
        if member.kind == MemberKind::Active {
            member.kind = MemberKind::Promotable;
        }
        member.status = MemberStatus::Available;
        member.updated = now_millis();

        let mut members = self.state.cluster().members();
        members.push(member);

        match self.configure(members).await {
            Ok(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                Ok(JoinResponse::ok(&self.state.cluster().configuration()))
            }
            Err(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                Ok(JoinResponse::error(Some(ErrorKind::Internal)))
            }
        }
    }

    /// Remove a member. Unknown members succeed idempotently.
    pub async fn leave(&self, request: LeaveRequest) -> Result<LeaveResponse> {
        if self.configuring() || self.initializing() {
            return Ok(LeaveResponse::error(None));
        }

        if self.state.cluster().member(&request.member).is_none() {
            let configuration = self.state.cluster().configuration();
            return Ok(LeaveResponse::ok(configuration.index, configuration.members));
        }

        let members: Vec<Member> = self
            .state
            .cluster()
            .members()
            .into_iter()
            .filter(|m| m.id != request.member)
            .collect();

        match self.configure(members).await {
            Ok(index) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                Ok(LeaveResponse::ok(index, self.state.cluster().members()))
            }
            Err(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                Ok(LeaveResponse::error(Some(ErrorKind::Internal)))
            }
        }
    }

    /// Update a member's address, kind, or status.
    pub async fn reconfigure(&self, request: ReconfigureRequest) -> Result<ReconfigureResponse> {
        if self.configuring() || self.initializing() {
            return Ok(ReconfigureResponse::error(None));
        }

        let Some(existing) = self.state.cluster().member(&request.member.id) else {
            return Ok(ReconfigureResponse::error(Some(ErrorKind::Configuration)));
        };

        // Accept only requests referencing the configuration they observed,
        // unless the only changes requested are member kind or status.
        let current = self.state.cluster().configuration();
        let references_current =
            request.index == LogIndex::ZERO || request.index == current.index;
        let only_kind_or_status = request.member.server_address == existing.server_address
            && (request.member.client_address.is_none()
                || request.member.client_address == existing.client_address);
        if !references_current || (request.term != current.term && !only_kind_or_status) {
            return Ok(ReconfigureResponse::error(Some(ErrorKind::Configuration)));
        }

        let mut members = self.state.cluster().members();
        for m in &mut members {
            if m.id == request.member.id {
                if let Some(address) = request.member.client_address.clone() {
                    m.client_address = Some(address);
                }
                m.server_address = request.member.server_address.clone();
                m.kind = request.member.kind;
                m.status = request.member.status;
                m.updated = now_millis();
            }
        }

        match self.configure(members).await {
            Ok(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                Ok(ReconfigureResponse::ok(&self.state.cluster().configuration()))
            }
            Err(_) => {
                if !self.is_open() {
                    return Err(RaftError::SteppedDown);
                }
                Ok(ReconfigureResponse::error(Some(ErrorKind::Internal)))
            }
        }
    }

    /// Append and replicate a configuration built from `members`. The new
    /// membership drives replication targets from the moment it is
    /// appended, not from commitment.
    fn configure(&self, members: Vec<Member>) -> impl Future<Output = Result<LogIndex>> {
        let term = self.state.term();
        let timestamp = now_millis();
        let index = self.state.log().append(Entry::Configuration {
            term,
            timestamp,
            members: members.clone(),
        });
        tracing::debug!(%index, %term, "appended configuration entry");

        // Latch before replication begins: one change at a time.
        self.configuring.store(index.as_u64(), Ordering::Release);
        self.state.cluster().configure(
            Configuration {
                index,
                term,
                timestamp,
                members,
            },
            self.state.log().last_index(),
        );

        let this = self.arc();
        async move {
            let result = this.appender.append_entries(Some(index)).await;
            if this.is_open() {
                this.configuring.store(0, Ordering::Release);
            }
            result.map(|_| index)
        }
    }

    // === session reaping ================================================

    /// Expire sessions the state machine has marked unstable. Only the
    /// current leader authors expiry entries, so an election gap cannot
    /// mis-expire sessions by counting stale time. Runs after every
    /// session-affecting operation completes.
    fn check_sessions(&self) {
        if !self.is_open() {
            return;
        }

        let term = self.state.term();
        for session in self.state.sessions().sessions() {
            if session.state() == SessionState::Unstable && !session.is_unregistering() {
                tracing::debug!(session = %session.id(), "detected expired session");

                let index = self.state.log().append(Entry::Unregister {
                    term,
                    timestamp: now_millis(),
                    session: session.id(),
                    expired: true,
                });
                // Latch before replication so this leader cannot issue a
                // second expiry for the same session.
                session.set_unregistering();

                let this = self.arc();
                tokio::spawn(async move {
                    if this.appender.append_entries(Some(index)).await.is_ok() && this.is_open() {
                        if let Err(e) = this.state.state_machine().apply(index) {
                            tracing::debug!(%index, error = %e, "expiry unregister failed to apply");
                        }
                    }
                });
            }
        }
    }
}
