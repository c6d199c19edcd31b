//! State machine seam and the session-aware core applicator.
//!
//! [`CoreStateMachine`] owns the session lifecycle: registration, liveness
//! accounting, unstable marking, and command deduplication. Application
//! semantics stay behind the [`Service`] seam, which a user supplies.
//!
//! Entries are applied strictly in log order. `apply(index)` catches the
//! applicator up through `index` and returns that entry's outcome; calling
//! it for an already-applied index replays the recorded outcome instead of
//! re-executing, which is what makes duplicate client commands idempotent.

use crate::error::{RaftError, Result};
use crate::log::Log;
use crate::session::{Session, SessionManager, SessionState};
use crate::types::{Entry, LogIndex, SessionId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of applying a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Entry applied, no value produced.
    None,
    /// A register entry produced a session.
    Session(SessionId),
    /// A command produced an application value.
    Value(Bytes),
}

/// Application-defined failure, surfaced to clients by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub kind: String,
}

impl ServiceError {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

impl From<ServiceError> for RaftError {
    fn from(e: ServiceError) -> Self {
        RaftError::Service { kind: e.kind }
    }
}

/// The deterministic application the cluster replicates.
pub trait Service: Send {
    /// Execute a command against application state.
    fn command(
        &mut self,
        session: SessionId,
        command: &Bytes,
    ) -> std::result::Result<Bytes, ServiceError>;

    /// Evaluate a read-only query against current application state.
    fn query(
        &self,
        session: SessionId,
        query: &Bytes,
    ) -> std::result::Result<Bytes, ServiceError>;
}

/// Applicator contract consumed by the leader.
pub trait StateMachine: Send + Sync {
    /// Apply the entry at `index`, first applying any earlier unapplied
    /// entries, and return the outcome of `index`.
    fn apply(&self, index: LogIndex) -> Result<ApplyOutcome>;

    /// Evaluate a query locally without replication.
    fn query(&self, session: SessionId, query: &Bytes) -> Result<Bytes>;

    /// Highest applied log index.
    fn last_applied(&self) -> LogIndex;
}

/// Session-aware state machine wrapping a user [`Service`].
pub struct CoreStateMachine {
    log: Log,
    sessions: Arc<SessionManager>,
    service: Mutex<Box<dyn Service>>,
    /// Serializes appliers; released continuations may re-enter reads, so
    /// the applied cursor itself is a separate atomic.
    apply_lock: Mutex<()>,
    last_applied: AtomicU64,
}

impl CoreStateMachine {
    pub fn new(log: Log, sessions: Arc<SessionManager>, service: Box<dyn Service>) -> Self {
        Self {
            log,
            sessions,
            service: Mutex::new(service),
            apply_lock: Mutex::new(()),
            last_applied: AtomicU64::new(0),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Mark sessions whose liveness clock lags `timestamp` by more than
    /// their timeout. Only the leader acts on the marking, by replicating an
    /// expiry unregister.
    fn suspect_sessions(&self, timestamp: u64) {
        for session in self.sessions.sessions() {
            if session.state() == SessionState::Open {
                let timeout = session.timeout().as_millis() as u64;
                if timestamp.saturating_sub(session.keep_alive_time()) > timeout {
                    tracing::debug!(session = %session.id(), "session missed its timeout, marking unstable");
                    session.set_state(SessionState::Unstable);
                }
            }
        }
    }

    fn apply_entry(&self, index: LogIndex, entry: &Entry) -> Result<ApplyOutcome> {
        match entry {
            Entry::Initialize { timestamp, .. } => {
                // A new leader's no-op resets every liveness clock so an
                // election gap cannot expire sessions spuriously.
                for session in self.sessions.sessions() {
                    session.touch(*timestamp);
                }
                Ok(ApplyOutcome::None)
            }

            Entry::Configuration { timestamp, .. } => {
                self.suspect_sessions(*timestamp);
                Ok(ApplyOutcome::None)
            }

            Entry::Register {
                client,
                timeout_millis,
                timestamp,
                ..
            } => {
                self.suspect_sessions(*timestamp);
                let id = SessionId(index.as_u64());
                let session = Arc::new(Session::new(
                    id,
                    *client,
                    Duration::from_millis(*timeout_millis),
                    *timestamp,
                ));
                self.sessions.register_session(session);
                Ok(ApplyOutcome::Session(id))
            }

            Entry::Connect {
                client,
                address,
                timestamp,
                ..
            } => {
                self.suspect_sessions(*timestamp);
                self.sessions.register_address(*client, address.clone());
                Ok(ApplyOutcome::None)
            }

            Entry::KeepAlive {
                session,
                command_sequence,
                event_index,
                timestamp,
                ..
            } => {
                self.suspect_sessions(*timestamp);
                let s = self
                    .sessions
                    .session(*session)
                    .ok_or(RaftError::UnknownSession(*session))?;
                s.keep_alive(*timestamp, *command_sequence, *event_index);
                Ok(ApplyOutcome::None)
            }

            Entry::Unregister {
                session,
                expired,
                timestamp,
                ..
            } => {
                self.suspect_sessions(*timestamp);
                let s = self
                    .sessions
                    .unregister_session(*session)
                    .ok_or(RaftError::UnknownSession(*session))?;
                if *expired {
                    s.set_state(SessionState::Expired);
                    self.sessions.notify_expired(*session);
                } else {
                    s.set_state(SessionState::Closed);
                    self.sessions.notify_closed(*session);
                }
                Ok(ApplyOutcome::None)
            }

            Entry::Command {
                session,
                sequence,
                command,
                timestamp,
                ..
            } => {
                self.suspect_sessions(*timestamp);
                let s = self
                    .sessions
                    .session(*session)
                    .ok_or(RaftError::UnknownSession(*session))?;

                // Resubmitted commands replay the stored response instead of
                // executing twice.
                if *sequence <= s.command_sequence() {
                    return match s.cached_result(*sequence) {
                        Some(Ok(bytes)) => Ok(ApplyOutcome::Value(bytes)),
                        Some(Err(kind)) => Err(RaftError::Service { kind }),
                        None => Ok(ApplyOutcome::Value(Bytes::new())),
                    };
                }

                let result = { self.service.lock().command(*session, command) };
                s.cache_result(
                    *sequence,
                    result
                        .as_ref()
                        .map(|b| b.clone())
                        .map_err(|e| e.kind.clone()),
                );

                // Advancing the command cursor releases queries gated at or
                // below this sequence; they run here, in apply order.
                let ready = s.set_command_sequence(*sequence);
                for thunk in ready {
                    thunk();
                }

                result.map(ApplyOutcome::Value).map_err(Into::into)
            }

            Entry::Query { .. } => Err(RaftError::Internal {
                reason: "query entries are never applied".to_string(),
            }),
        }
    }

    /// Reconstruct the outcome of an already-applied index.
    fn replay(&self, index: LogIndex, entry: &Entry) -> Result<ApplyOutcome> {
        match entry {
            Entry::Register { .. } => Ok(ApplyOutcome::Session(SessionId(index.as_u64()))),
            Entry::Command {
                session, sequence, ..
            } => {
                let s = self
                    .sessions
                    .session(*session)
                    .ok_or(RaftError::UnknownSession(*session))?;
                match s.cached_result(*sequence) {
                    Some(Ok(bytes)) => Ok(ApplyOutcome::Value(bytes)),
                    Some(Err(kind)) => Err(RaftError::Service { kind }),
                    None => Ok(ApplyOutcome::Value(Bytes::new())),
                }
            }
            _ => Ok(ApplyOutcome::None),
        }
    }
}

impl StateMachine for CoreStateMachine {
    fn apply(&self, index: LogIndex) -> Result<ApplyOutcome> {
        let _guard = self.apply_lock.lock();
        let mut last = LogIndex(self.last_applied.load(Ordering::Acquire));

        if index <= last {
            let entry = self.log.get(index).ok_or_else(|| RaftError::Internal {
                reason: format!("applied entry {index} missing from log"),
            })?;
            return self.replay(index, &entry);
        }

        while last < index {
            let next = last.next();
            let entry = self.log.get(next).ok_or_else(|| RaftError::Internal {
                reason: format!("gap in log at {next}"),
            })?;
            let result = self.apply_entry(next, &entry);
            last = next;
            self.last_applied.store(next.as_u64(), Ordering::Release);
            if next == index {
                return result;
            }
            if let Err(e) = result {
                tracing::debug!(index = %next, error = %e, "entry failed to apply");
            }
        }

        Err(RaftError::Internal {
            reason: format!("apply past end of log: {index}"),
        })
    }

    fn query(&self, session: SessionId, query: &Bytes) -> Result<Bytes> {
        self.service
            .lock()
            .query(session, query)
            .map_err(Into::into)
    }

    fn last_applied(&self) -> LogIndex {
        LogIndex(self.last_applied.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientId, Term};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Service whose command results differ on every invocation, making
    /// re-execution visible to dedup tests.
    struct CountingService {
        calls: usize,
    }

    impl Service for CountingService {
        fn command(
            &mut self,
            _session: SessionId,
            command: &Bytes,
        ) -> std::result::Result<Bytes, ServiceError> {
            self.calls += 1;
            Ok(Bytes::from(format!(
                "{}#{}",
                String::from_utf8_lossy(command),
                self.calls
            )))
        }

        fn query(
            &self,
            _session: SessionId,
            query: &Bytes,
        ) -> std::result::Result<Bytes, ServiceError> {
            Ok(query.clone())
        }
    }

    fn fixture() -> (Log, Arc<SessionManager>, CoreStateMachine) {
        let log = Log::new();
        let sessions = Arc::new(SessionManager::new("n1:5000"));
        let fsm = CoreStateMachine::new(
            log.clone(),
            sessions.clone(),
            Box::new(CountingService { calls: 0 }),
        );
        (log, sessions, fsm)
    }

    fn register(log: &Log, client: ClientId, timeout_millis: u64, timestamp: u64) -> LogIndex {
        log.append(Entry::Register {
            term: Term(1),
            timestamp,
            client,
            timeout_millis,
        })
    }

    fn command(log: &Log, session: SessionId, sequence: u64, timestamp: u64) -> LogIndex {
        log.append(Entry::Command {
            term: Term(1),
            timestamp,
            session,
            sequence,
            command: Bytes::from("put"),
        })
    }

    #[test]
    fn test_register_assigns_session_id_from_index() {
        let (log, sessions, fsm) = fixture();
        let index = register(&log, ClientId::random(), 5000, 10);

        let outcome = fsm.apply(index).unwrap();
        assert_eq!(outcome, ApplyOutcome::Session(SessionId(index.as_u64())));
        assert!(sessions.session(SessionId(index.as_u64())).is_some());
    }

    #[test]
    fn test_duplicate_command_replays_stored_result() {
        let (log, _sessions, fsm) = fixture();
        let reg = register(&log, ClientId::random(), 5000, 10);
        fsm.apply(reg).unwrap();
        let session = SessionId(reg.as_u64());

        let first = command(&log, session, 1, 20);
        let original = fsm.apply(first).unwrap();

        // Duplicate appended by a retransmitting client.
        let dup = command(&log, session, 1, 30);
        let replayed = fsm.apply(dup).unwrap();
        assert_eq!(original, replayed);
    }

    #[test]
    fn test_out_of_order_apply_calls_replay() {
        let (log, _sessions, fsm) = fixture();
        let reg = register(&log, ClientId::random(), 5000, 10);
        let session = SessionId(reg.as_u64());
        let c1 = command(&log, session, 1, 20);
        let c2 = command(&log, session, 2, 21);

        // Applying the later index first catches up through both.
        let second = fsm.apply(c2).unwrap();
        let first = fsm.apply(c1).unwrap();
        assert_eq!(fsm.last_applied(), c2);
        assert!(matches!(first, ApplyOutcome::Value(_)));
        assert!(matches!(second, ApplyOutcome::Value(_)));
        assert_ne!(first, second);
    }

    #[test]
    fn test_session_marked_unstable_after_timeout() {
        let (log, sessions, fsm) = fixture();
        let reg = register(&log, ClientId::random(), 100, 1000);
        fsm.apply(reg).unwrap();
        let session = sessions.session(SessionId(reg.as_u64())).unwrap();
        assert_eq!(session.state(), SessionState::Open);

        // A later registration carries a timestamp past the first session's
        // timeout window.
        let reg2 = register(&log, ClientId::random(), 5000, 2000);
        fsm.apply(reg2).unwrap();
        assert_eq!(session.state(), SessionState::Unstable);
    }

    #[test]
    fn test_initialize_refreshes_liveness() {
        let (log, sessions, fsm) = fixture();
        let reg = register(&log, ClientId::random(), 100, 1000);
        fsm.apply(reg).unwrap();
        let session = sessions.session(SessionId(reg.as_u64())).unwrap();

        let init = log.append(Entry::Initialize {
            term: Term(2),
            timestamp: 2000,
        });
        fsm.apply(init).unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.keep_alive_time(), 2000);
    }

    #[test]
    fn test_expired_unregister_fires_listener_once() {
        let (log, sessions, fsm) = fixture();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        sessions.on_expire(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let reg = register(&log, ClientId::random(), 100, 1000);
        fsm.apply(reg).unwrap();
        let id = SessionId(reg.as_u64());

        let unreg = log.append(Entry::Unregister {
            term: Term(1),
            timestamp: 2000,
            session: id,
            expired: true,
        });
        fsm.apply(unreg).unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(sessions.session(id).is_none());
    }

    #[test]
    fn test_query_entries_are_never_applied() {
        let (log, _sessions, fsm) = fixture();
        let q = log.append(Entry::Query {
            term: Term(1),
            timestamp: 10,
            session: SessionId(1),
            sequence: 1,
            index: LogIndex::ZERO,
            query: Bytes::from("peek"),
        });
        assert!(matches!(fsm.apply(q), Err(RaftError::Internal { .. })));
    }

    #[test]
    fn test_keep_alive_unknown_session_errors() {
        let (log, _sessions, fsm) = fixture();
        let ka = log.append(Entry::KeepAlive {
            term: Term(1),
            timestamp: 10,
            session: SessionId(42),
            command_sequence: 0,
            event_index: LogIndex::ZERO,
        });
        assert!(matches!(
            fsm.apply(ka),
            Err(RaftError::UnknownSession(SessionId(42)))
        ));
    }
}
