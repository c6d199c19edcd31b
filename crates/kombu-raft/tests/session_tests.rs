//! Session lifecycle scenarios: registration, keep-alive, leader-driven
//! expiry, and connection bindings.

use bytes::Bytes;
use kombu_raft::session::ConnectionId;
use kombu_raft::transport::{InMemoryTransport, PeerMessage, PeerReceiver};
use kombu_raft::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

struct EchoService;

impl Service for EchoService {
    fn command(
        &mut self,
        _session: SessionId,
        command: &Bytes,
    ) -> std::result::Result<Bytes, fsm::ServiceError> {
        Ok(command.clone())
    }

    fn query(
        &self,
        _session: SessionId,
        query: &Bytes,
    ) -> std::result::Result<Bytes, fsm::ServiceError> {
        Ok(query.clone())
    }
}

fn spawn_follower(mut rx: PeerReceiver) {
    tokio::spawn(async move {
        let mut log: Vec<Entry> = Vec::new();
        let mut term = Term::ZERO;

        while let Some(PeerMessage::Append {
            request,
            response_tx,
        }) = rx.recv().await
        {
            if request.term > term {
                term = request.term;
            }
            let prev = request.prev_log_index.as_u64() as usize;
            let consistent = prev == 0
                || (prev <= log.len() && log[prev - 1].term() == request.prev_log_term);
            let succeeded = request.term >= term && consistent;
            if succeeded {
                log.truncate(prev);
                log.extend(request.entries);
            }
            let _ = response_tx.send(AppendResponse {
                status: ResponseStatus::Ok,
                term,
                succeeded,
                log_index: LogIndex(log.len() as u64),
            });
        }
    });
}

struct Fixture {
    leader: Arc<LeaderRole>,
    log: kombu_raft::log::Log,
    sessions: Arc<SessionManager>,
}

/// Short session timeout so expiry is observable; heartbeats stay well
/// under the election timeout.
fn expiry_config() -> ServerConfig {
    ServerConfig {
        heartbeat_interval: Duration::from_millis(25),
        election_timeout: Duration::from_millis(200),
        session_timeout: Duration::from_millis(300),
        max_entries_per_append: 1000,
    }
}

fn fixture(peer_count: usize, config: ServerConfig) -> Fixture {
    let local = MemberId::new("n1");
    let mut members = vec![Member::new(
        local.clone(),
        MemberKind::Active,
        "n1:5000",
        Some("n1:5001".to_string()),
    )];

    let mut peer_txs = HashMap::new();
    for i in 0..peer_count {
        let id = MemberId::new(format!("n{}", i + 2));
        members.push(Member::new(
            id.clone(),
            MemberKind::Active,
            format!("{id}:5000"),
            Some(format!("{id}:5001")),
        ));
        let (tx, rx) = mpsc::channel(256);
        spawn_follower(rx);
        peer_txs.insert(id, tx);
    }

    let log = kombu_raft::log::Log::new();
    let sessions = Arc::new(SessionManager::new("n1:5000"));
    let fsm = Arc::new(CoreStateMachine::new(
        log.clone(),
        sessions.clone(),
        Box::new(EchoService),
    ));
    let cluster = Arc::new(ClusterState::new(local.clone(), Configuration::new(members)));
    let transport = Arc::new(InMemoryTransport::new(peer_txs));

    let (state, _transitions) = ServerState::new(
        local,
        config,
        log.clone(),
        cluster,
        sessions.clone(),
        fsm,
        transport,
    );
    state.set_term(Term(1));

    let leader = LeaderRole::open(state.clone());
    Fixture {
        leader,
        log,
        sessions,
    }
}

async fn await_ready(leader: &Arc<LeaderRole>) {
    timeout(Duration::from_secs(2), async {
        while leader.initializing() || leader.configuring() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("leader never finished initializing");
}

async fn register(f: &Fixture, client: ClientId) -> SessionId {
    let response = f
        .leader
        .register(RegisterRequest { client })
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    response.session.unwrap()
}

async fn await_until(mut cond: impl FnMut() -> bool, what: &str) {
    timeout(Duration::from_secs(3), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_register_returns_discovery_info() {
    let f = fixture(2, expiry_config());
    await_ready(&f.leader).await;

    let response = f
        .leader
        .register(RegisterRequest {
            client: ClientId::random(),
        })
        .await
        .unwrap();

    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.timeout_millis, 300);
    assert_eq!(response.leader.as_deref(), Some("n1:5001"));
    assert_eq!(response.members.len(), 3);

    // The session id is the register entry's log index.
    let session = response.session.unwrap();
    assert!(matches!(
        f.log.get(LogIndex(session.as_u64())),
        Some(Entry::Register { .. })
    ));
}

// --- S5 --------------------------------------------------------------------

#[tokio::test]
async fn test_leader_expires_silent_session() {
    let f = fixture(0, expiry_config());
    await_ready(&f.leader).await;

    let expired = Arc::new(AtomicUsize::new(0));
    let counter = expired.clone();
    f.sessions.on_expire(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let silent = register(&f, ClientId::random()).await;
    let session = f.sessions.session(silent).unwrap();

    // Let the session timeout lapse with no keep-alive, then complete any
    // session-affecting operation: its apply marks the silent session
    // unstable and the reaper runs after the response.
    sleep(Duration::from_millis(400)).await;
    let _ = register(&f, ClientId::random()).await;

    await_until(|| f.sessions.session(silent).is_none(), "session expiry").await;
    assert_eq!(session.state(), SessionState::Expired);
    assert_eq!(expired.load(Ordering::SeqCst), 1);

    // The expiry was authored by this leader as a committed unregister.
    let entries = f.log.get_range(LogIndex(1), f.log.last_index().next());
    let expirations = entries
        .iter()
        .filter(|e| matches!(e, Entry::Unregister { session: s, expired: true, .. } if *s == silent))
        .count();
    assert_eq!(expirations, 1);
}

#[tokio::test]
async fn test_keep_alive_prevents_expiry() {
    let f = fixture(0, expiry_config());
    await_ready(&f.leader).await;

    let session = register(&f, ClientId::random()).await;

    // Refresh liveness midway through the timeout window, twice.
    for _ in 0..2 {
        sleep(Duration::from_millis(200)).await;
        let response = f
            .leader
            .keep_alive(KeepAliveRequest {
                session,
                command_sequence: 0,
                event_index: LogIndex::ZERO,
            })
            .await
            .unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.leader.as_deref(), Some("n1:5001"));
    }

    // A session-affecting operation after the refreshes must not expire it.
    let _ = register(&f, ClientId::random()).await;
    sleep(Duration::from_millis(100)).await;
    assert!(f.sessions.session(session).is_some());
    assert_eq!(
        f.sessions.session(session).unwrap().state(),
        SessionState::Open
    );
}

#[tokio::test]
async fn test_keep_alive_unknown_session() {
    let f = fixture(0, expiry_config());
    await_ready(&f.leader).await;

    let response = f
        .leader
        .keep_alive(KeepAliveRequest {
            session: SessionId(404),
            command_sequence: 0,
            event_index: LogIndex::ZERO,
        })
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error, Some(ErrorKind::UnknownSession));
    // Even the error carries the leader so the client can recover.
    assert_eq!(response.leader.as_deref(), Some("n1:5001"));
}

#[tokio::test]
async fn test_client_unregister_closes_without_expiry() {
    let f = fixture(0, expiry_config());
    await_ready(&f.leader).await;

    let expired = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let e = expired.clone();
    let c = closed.clone();
    f.sessions.on_expire(move |_| {
        e.fetch_add(1, Ordering::SeqCst);
    });
    f.sessions.on_close(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    let id = register(&f, ClientId::random()).await;
    let session = f.sessions.session(id).unwrap();

    let response = f.leader.unregister(UnregisterRequest { session: id }).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);

    assert!(f.sessions.session(id).is_none());
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(expired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_connect_binds_and_replicates_address() {
    let f = fixture(2, expiry_config());
    await_ready(&f.leader).await;

    let client = ClientId::random();
    let id = register(&f, client).await;

    let response = f
        .leader
        .connect(ConnectRequest { client }, ConnectionId(7))
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.leader.as_deref(), Some("n1:5001"));
    assert_eq!(response.members.len(), 3);

    // The binding is visible locally and as a replicated connect entry.
    let session = f.sessions.session(id).unwrap();
    assert_eq!(session.connection(), Some(ConnectionId(7)));
    assert_eq!(session.address().as_deref(), Some("n1:5000"));
    assert!(f.sessions.has_connection(id));

    let entries = f.log.get_range(LogIndex(1), f.log.last_index().next());
    assert!(entries
        .iter()
        .any(|e| matches!(e, Entry::Connect { client: c, .. } if *c == client)));
}

#[tokio::test]
async fn test_connect_unknown_client_still_replicates() {
    let f = fixture(0, expiry_config());
    await_ready(&f.leader).await;

    // No session exists for this client; the address is replicated anyway
    // and a later registration picks the binding up.
    let client = ClientId::random();
    let response = f
        .leader
        .connect(ConnectRequest { client }, ConnectionId(3))
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);

    let entries = f.log.get_range(LogIndex(1), f.log.last_index().next());
    assert!(entries
        .iter()
        .any(|e| matches!(e, Entry::Connect { client: c, .. } if *c == client)));

    let id = register(&f, client).await;
    let session = f.sessions.session(id).unwrap();
    assert_eq!(session.connection(), Some(ConnectionId(3)));
    assert_eq!(session.address().as_deref(), Some("n1:5000"));
}

#[tokio::test]
async fn test_commands_refresh_nothing_but_dedup_survives_keep_alive() {
    let f = fixture(0, expiry_config());
    await_ready(&f.leader).await;
    let session = register(&f, ClientId::random()).await;

    let first = f
        .leader
        .command(CommandRequest {
            session,
            sequence: 1,
            command: Bytes::from("v1"),
        })
        .await
        .unwrap();
    assert_eq!(first.status, ResponseStatus::Ok);

    // The keep-alive acknowledges sequence 0, so the stored response for
    // sequence 1 must survive and still satisfy a duplicate.
    f.leader
        .keep_alive(KeepAliveRequest {
            session,
            command_sequence: 0,
            event_index: LogIndex::ZERO,
        })
        .await
        .unwrap();

    let duplicate = f
        .leader
        .command(CommandRequest {
            session,
            sequence: 1,
            command: Bytes::from("v1"),
        })
        .await
        .unwrap();
    assert_eq!(duplicate.result, first.result);
}
