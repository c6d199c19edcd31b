//! Leader-side replication driver.
//!
//! A single driver task owns all outbound AppendEntries traffic: it wakes on
//! a heartbeat tick or when a caller registers interest, replicates to every
//! peer concurrently, advances the commit index, and completes waiters.
//! Serializing rounds through one task keeps per-peer progress updates
//! race-free without holding locks across network calls.
//!
//! Two kinds of waiters exist. A commit waiter (`Some(target)`) resolves
//! when the commit index reaches its target. A heartbeat waiter (`None`)
//! resolves when a full round registered after it collects acknowledgements
//! from a quorum in the current term; linearizable reads ride on these.

use crate::cluster::MemberKind;
use crate::error::{RaftError, Result};
use crate::state::{Role, ServerState};
use crate::types::*;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, oneshot, Notify};

struct Waiter {
    id: u64,
    target: Option<LogIndex>,
    tx: oneshot::Sender<Result<LogIndex>>,
}

/// Outcome of replicating to one peer within a round.
struct PeerRound {
    member: MemberId,
    /// Peer responded within the current term.
    acked: bool,
    /// Entries shipped or the peer's next index moved; another round may
    /// make further progress immediately.
    advanced: bool,
}

/// Replicates log entries to peers and tracks quorum commitment.
pub struct Appender {
    state: Arc<ServerState>,
    open: AtomicBool,
    /// Index of the first entry of this leader's term. Entries from prior
    /// terms never commit ahead of it.
    leader_index: LogIndex,
    started: Instant,
    waiters: Mutex<Vec<Waiter>>,
    waiter_seq: AtomicU64,
    notify: Notify,
}

impl Appender {
    pub fn new(state: Arc<ServerState>) -> Arc<Self> {
        let leader_index = state.log().last_index().next();
        Arc::new(Self {
            state,
            open: AtomicBool::new(true),
            leader_index,
            started: Instant::now(),
            waiters: Mutex::new(Vec::new()),
            waiter_seq: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Index of the leader's initialize entry.
    pub fn index(&self) -> LogIndex {
        self.leader_index
    }

    /// Leader clock used to timestamp entries (millis).
    pub fn time(&self) -> u64 {
        now_millis()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Schedule replication. With a target, the returned future resolves
    /// when the commit index reaches it; without one, when a heartbeat
    /// round acknowledges a quorum.
    pub async fn append_entries(&self, target: Option<LogIndex>) -> Result<LogIndex> {
        if !self.is_open() {
            return Err(RaftError::SteppedDown);
        }

        if let Some(t) = target {
            let commit = self.state.commit_index();
            if commit >= t {
                return Ok(commit);
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let id = self.waiter_seq.fetch_add(1, Ordering::SeqCst);
            self.waiters.lock().push(Waiter { id, target, tx });
        }
        if !self.is_open() {
            // close() may have drained the list before our push landed.
            self.fail_waiters();
        }
        self.notify.notify_one();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RaftError::SteppedDown),
        }
    }

    /// Cancel in-flight replication; outstanding futures complete with a
    /// step-down error.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::debug!("closing appender");
        }
        self.fail_waiters();
        self.notify.notify_one();
    }

    fn fail_waiters(&self) {
        let drained: Vec<Waiter> = self.waiters.lock().drain(..).collect();
        for waiter in drained {
            let _ = waiter.tx.send(Err(RaftError::SteppedDown));
        }
    }

    /// Heartbeat driver. Runs until shutdown, step-down, or close.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.state.config().heartbeat_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
                _ = shutdown.recv() => {
                    tracing::debug!("heartbeat driver shutting down");
                    break;
                }
            }

            if !self.is_open() || self.state.role() != Role::Leader {
                break;
            }

            // Keep rounds going while commit waiters are pending and peers
            // are still catching up; otherwise wait for the next tick.
            let mut rounds = 0;
            loop {
                let advanced = self.run_round().await;
                rounds += 1;
                if !self.is_open() {
                    break;
                }
                let pending_commit = self.waiters.lock().iter().any(|w| w.target.is_some());
                if !advanced || !pending_commit || rounds >= 64 {
                    break;
                }
            }

            if !self.is_open() {
                break;
            }
        }

        self.fail_waiters();
    }

    /// One full replication round. Returns true if any peer advanced.
    async fn run_round(&self) -> bool {
        let cluster = self.state.cluster();
        let members = cluster.remote_members();
        let hb_cutoff = self.waiter_seq.load(Ordering::SeqCst);

        let results = join_all(members.iter().map(|m| self.replicate_to(m))).await;
        if !self.is_open() {
            return false;
        }

        let acks = results
            .iter()
            .filter(|r| {
                r.acked
                    && cluster
                        .member(&r.member)
                        .map(|m| m.kind == MemberKind::Active)
                        .unwrap_or(false)
            })
            .count();
        let advanced = results.iter().any(|r| r.advanced);

        self.advance_commit();

        let quorum = cluster.quorum_size();
        let have_quorum = acks + 1 >= quorum;
        let commit = self.state.commit_index();

        {
            let mut waiters = self.waiters.lock();
            let mut kept = Vec::new();
            for waiter in waiters.drain(..) {
                match waiter.target {
                    Some(target) if commit >= target => {
                        let _ = waiter.tx.send(Ok(commit));
                    }
                    None if waiter.id < hb_cutoff => {
                        // The round either proves or disproves leadership
                        // for reads registered before it started.
                        let result = if have_quorum {
                            Ok(commit)
                        } else {
                            Err(RaftError::QuorumUnavailable {
                                needed: quorum,
                                available: acks + 1,
                            })
                        };
                        let _ = waiter.tx.send(result);
                    }
                    _ => kept.push(waiter),
                }
            }
            *waiters = kept;
        }

        // Liveness: heartbeat failures never step down directly, but a
        // quorum out of contact beyond the election timeout does.
        if !have_quorum {
            let window = self.state.config().election_timeout;
            let fresh = cluster.fresh_contact_count(window) + 1;
            if fresh < quorum && self.started.elapsed() > window {
                tracing::warn!(term = %self.state.term(), "lost contact with a quorum, stepping down");
                self.state.set_leader(None);
                self.state.transition(Role::Follower);
                self.close();
            }
        }

        advanced
    }

    async fn replicate_to(&self, member: &MemberId) -> PeerRound {
        let mut round = PeerRound {
            member: member.clone(),
            acked: false,
            advanced: false,
        };

        let cluster = self.state.cluster();
        let Some(peer) = cluster.peer(member) else {
            return round;
        };

        let log = self.state.log();
        let next_index = peer.next_index;
        let prev_log_index = next_index.prev().unwrap_or(LogIndex::ZERO);
        let prev_log_term = if prev_log_index == LogIndex::ZERO {
            Term::ZERO
        } else {
            log.get(prev_log_index).map(|e| e.term()).unwrap_or(Term::ZERO)
        };

        let last = log.last_index();
        let mut entries = if next_index <= last {
            log.get_range(next_index, last.next())
        } else {
            Vec::new()
        };
        let max = self.state.config().max_entries_per_append;
        if entries.len() > max {
            entries.truncate(max);
        }
        let sent = entries.len() as u64;

        let request = AppendRequest {
            term: self.state.term(),
            leader: self.state.member_id().clone(),
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: self.state.commit_index(),
        };

        match self.state.transport().append(member, request).await {
            Ok(response) => {
                if response.term > self.state.term() {
                    tracing::warn!(peer = %member, term = %response.term, "peer reported a greater term, stepping down");
                    self.state.step_down(response.term);
                    self.close();
                    return round;
                }

                round.acked = true;
                if response.succeeded {
                    let match_index = LogIndex(prev_log_index.as_u64() + sent);
                    cluster.record_success(member, match_index);
                    round.advanced = sent > 0;
                } else {
                    cluster.record_mismatch(member, response.log_index);
                    round.advanced = true;
                }
                round
            }
            Err(e) => {
                tracing::debug!(peer = %member, error = %e, "append to peer failed");
                round
            }
        }
    }

    /// Advance the commit index to the highest entry stored on a quorum,
    /// floored at this leader's initialize entry.
    fn advance_commit(&self) {
        let cluster = self.state.cluster();
        let quorum = cluster.quorum_size();

        let mut indexes = cluster.voting_match_indexes();
        indexes.push(self.state.log().last_index());
        if indexes.len() < quorum {
            return;
        }

        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = indexes[quorum - 1];

        if candidate >= self.leader_index && candidate > self.state.commit_index() {
            tracing::debug!(commit = %candidate, "commit index advanced");
            self.state.set_commit_index(candidate);
        }
    }
}
