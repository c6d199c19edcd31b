//! Cluster membership state and per-peer replication bookkeeping.
//!
//! The leader routes every peer lookup through [`ClusterState`] keyed by
//! [`MemberId`]; nothing holds owning references to peers, which keeps the
//! leader/appender/cluster relationship an indexed one instead of a cycle.

use crate::types::{LogIndex, MemberId, Term};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Member role within the cluster.
///
/// Only `Active` members vote and count toward quorum. `Promotable` members
/// receive replication but do not vote until promoted; `Reserve` and
/// `Passive` members follow at a distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    Active,
    Promotable,
    Reserve,
    Passive,
}

/// Member availability as observed by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Available,
    Unavailable,
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub kind: MemberKind,
    pub status: MemberStatus,
    /// Address peers use for replication.
    pub server_address: String,
    /// Address clients use, if the member accepts clients.
    pub client_address: Option<String>,
    /// Timestamp of the last update to this member (millis).
    pub updated: u64,
}

impl Member {
    pub fn new(
        id: MemberId,
        kind: MemberKind,
        server_address: impl Into<String>,
        client_address: Option<String>,
    ) -> Self {
        Self {
            id,
            kind,
            status: MemberStatus::Available,
            server_address: server_address.into(),
            client_address,
            updated: 0,
        }
    }
}

/// A versioned membership list. Exactly one configuration is committed at a
/// time; a second may be pending while its entry replicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub index: LogIndex,
    pub term: Term,
    pub timestamp: u64,
    pub members: Vec<Member>,
}

impl Configuration {
    pub fn new(members: Vec<Member>) -> Self {
        Self {
            index: LogIndex::ZERO,
            term: Term::ZERO,
            timestamp: 0,
            members,
        }
    }

    pub fn member(&self, id: &MemberId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id == id)
    }
}

/// Per-peer replication progress.
#[derive(Debug, Clone, Copy)]
pub struct PeerState {
    /// Index of the next entry to send.
    pub next_index: LogIndex,
    /// Highest index known to be stored on the peer.
    pub match_index: LogIndex,
    /// Last time the peer responded to an RPC, success or not.
    pub last_contact: Option<Instant>,
}

impl PeerState {
    fn reset(last_index: LogIndex) -> Self {
        Self {
            next_index: last_index.next(),
            match_index: LogIndex::ZERO,
            last_contact: None,
        }
    }
}

/// Cluster view shared by the leader and the appender.
pub struct ClusterState {
    local: MemberId,
    configuration: RwLock<Configuration>,
    peers: RwLock<HashMap<MemberId, PeerState>>,
}

impl ClusterState {
    pub fn new(local: MemberId, configuration: Configuration) -> Self {
        let peers = configuration
            .members
            .iter()
            .filter(|m| m.id != local)
            .map(|m| (m.id.clone(), PeerState::reset(LogIndex::ZERO)))
            .collect();
        Self {
            local,
            configuration: RwLock::new(configuration),
            peers: RwLock::new(peers),
        }
    }

    pub fn local_id(&self) -> &MemberId {
        &self.local
    }

    pub fn configuration(&self) -> Configuration {
        self.configuration.read().clone()
    }

    pub fn member(&self, id: &MemberId) -> Option<Member> {
        self.configuration.read().member(id).cloned()
    }

    pub fn members(&self) -> Vec<Member> {
        self.configuration.read().members.clone()
    }

    pub fn local_member(&self) -> Option<Member> {
        self.member(&self.local)
    }

    pub fn local_client_address(&self) -> Option<String> {
        self.local_member().and_then(|m| m.client_address)
    }

    pub fn local_server_address(&self) -> Option<String> {
        self.local_member().map(|m| m.server_address)
    }

    /// Client-facing addresses of all members that accept clients.
    pub fn client_addresses(&self) -> Vec<String> {
        self.configuration
            .read()
            .members
            .iter()
            .filter_map(|m| m.client_address.clone())
            .collect()
    }

    /// All members other than the local one, in configuration order.
    pub fn remote_members(&self) -> Vec<MemberId> {
        self.configuration
            .read()
            .members
            .iter()
            .filter(|m| m.id != self.local)
            .map(|m| m.id.clone())
            .collect()
    }

    /// Quorum size over voting (active) members.
    pub fn quorum_size(&self) -> usize {
        let voting = self
            .configuration
            .read()
            .members
            .iter()
            .filter(|m| m.kind == MemberKind::Active)
            .count();
        voting / 2 + 1
    }

    /// Install a new configuration and reconcile the peer map: new members
    /// start from a fresh replication state, removed members are dropped.
    pub fn configure(&self, configuration: Configuration, last_index: LogIndex) {
        let mut peers = self.peers.write();
        peers.retain(|id, _| configuration.member(id).is_some());
        for member in &configuration.members {
            if member.id != self.local {
                peers
                    .entry(member.id.clone())
                    .or_insert_with(|| PeerState::reset(last_index));
            }
        }
        *self.configuration.write() = configuration;
    }

    /// Reset every peer's replication state, done when taking leadership.
    pub fn reset_peers(&self, last_index: LogIndex) {
        let mut peers = self.peers.write();
        for state in peers.values_mut() {
            *state = PeerState::reset(last_index);
        }
    }

    pub fn peer(&self, id: &MemberId) -> Option<PeerState> {
        self.peers.read().get(id).copied()
    }

    /// Record a successful replication up to `match_index`.
    pub fn record_success(&self, id: &MemberId, match_index: LogIndex) {
        if let Some(state) = self.peers.write().get_mut(id) {
            if match_index > state.match_index {
                state.match_index = match_index;
            }
            state.next_index = match_index.next();
            state.last_contact = Some(Instant::now());
        }
    }

    /// Record a log-consistency rejection; back the peer's next index off
    /// toward the hint: `next := min(next - 1, hint + 1)`, floor 1.
    pub fn record_mismatch(&self, id: &MemberId, hint: LogIndex) {
        if let Some(state) = self.peers.write().get_mut(id) {
            let decremented = state.next_index.as_u64().saturating_sub(1);
            state.next_index = LogIndex(decremented.min(hint.as_u64() + 1).max(1));
            state.last_contact = Some(Instant::now());
        }
    }

    /// Match indexes of voting remote members, for commit computation.
    pub fn voting_match_indexes(&self) -> Vec<LogIndex> {
        let configuration = self.configuration.read();
        let peers = self.peers.read();
        configuration
            .members
            .iter()
            .filter(|m| m.kind == MemberKind::Active && m.id != self.local)
            .filter_map(|m| peers.get(&m.id).map(|p| p.match_index))
            .collect()
    }

    /// Number of voting remote members heard from within `window`.
    pub fn fresh_contact_count(&self, window: Duration) -> usize {
        let configuration = self.configuration.read();
        let peers = self.peers.read();
        configuration
            .members
            .iter()
            .filter(|m| m.kind == MemberKind::Active && m.id != self.local)
            .filter(|m| {
                peers
                    .get(&m.id)
                    .and_then(|p| p.last_contact)
                    .map(|t| t.elapsed() < window)
                    .unwrap_or(false)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, kind: MemberKind) -> Member {
        Member::new(
            MemberId::new(id),
            kind,
            format!("{id}:5000"),
            Some(format!("{id}:5001")),
        )
    }

    fn cluster(ids: &[&str]) -> ClusterState {
        let members = ids
            .iter()
            .map(|id| member(id, MemberKind::Active))
            .collect();
        ClusterState::new(MemberId::new(ids[0]), Configuration::new(members))
    }

    #[test]
    fn test_quorum_counts_only_active_members() {
        let state = cluster(&["n1", "n2", "n3"]);
        assert_eq!(state.quorum_size(), 2);

        let mut members = state.members();
        members.push(member("n4", MemberKind::Promotable));
        state.configure(
            Configuration {
                index: LogIndex(5),
                term: Term(1),
                timestamp: 0,
                members,
            },
            LogIndex(5),
        );
        // Promotable member does not change the quorum.
        assert_eq!(state.quorum_size(), 2);
        assert_eq!(state.remote_members().len(), 3);
    }

    #[test]
    fn test_configure_reconciles_peers() {
        let state = cluster(&["n1", "n2", "n3"]);
        assert!(state.peer(&MemberId::new("n2")).is_some());

        let members = vec![
            member("n1", MemberKind::Active),
            member("n3", MemberKind::Active),
            member("n4", MemberKind::Active),
        ];
        state.configure(
            Configuration {
                index: LogIndex(7),
                term: Term(1),
                timestamp: 0,
                members,
            },
            LogIndex(7),
        );

        assert!(state.peer(&MemberId::new("n2")).is_none());
        let n4 = state.peer(&MemberId::new("n4")).unwrap();
        assert_eq!(n4.next_index, LogIndex(8));
        assert_eq!(n4.match_index, LogIndex::ZERO);
    }

    #[test]
    fn test_record_mismatch_backs_off_toward_hint() {
        let state = cluster(&["n1", "n2"]);
        state.reset_peers(LogIndex(10));

        state.record_mismatch(&MemberId::new("n2"), LogIndex(3));
        assert_eq!(state.peer(&MemberId::new("n2")).unwrap().next_index, LogIndex(4));

        // Without a useful hint the backoff decrements by one.
        state.record_mismatch(&MemberId::new("n2"), LogIndex(10));
        assert_eq!(state.peer(&MemberId::new("n2")).unwrap().next_index, LogIndex(3));
    }
}
