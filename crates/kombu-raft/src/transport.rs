//! Transport abstraction for leader-to-peer RPC.
//!
//! The leader only ever originates one RPC: AppendEntries. Everything else
//! (client operations, votes, polls) arrives inbound and is dispatched by
//! the embedding server. Implementations handle connection management,
//! serialization, timeouts, and retries; the leader treats a returned error
//! as "no contact" and relies on the next heartbeat round.

use crate::error::Result;
use crate::types::{AppendRequest, AppendResponse, MemberId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Peer transport used by the appender.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Send an AppendEntries RPC (heartbeat or replication batch) to a peer.
    async fn append(&self, target: &MemberId, request: AppendRequest) -> Result<AppendResponse>;
}

/// Inbound message envelope for in-process peers.
#[derive(Debug)]
pub enum PeerMessage {
    Append {
        request: AppendRequest,
        response_tx: tokio::sync::oneshot::Sender<AppendResponse>,
    },
}

pub type PeerSender = tokio::sync::mpsc::Sender<PeerMessage>;
pub type PeerReceiver = tokio::sync::mpsc::Receiver<PeerMessage>;

/// In-memory transport for tests (local channels, no network).
///
/// Peers can be added and removed at runtime, which doubles as a partition
/// switch in tests: a removed peer is simply unreachable.
pub struct InMemoryTransport {
    peers: Arc<RwLock<HashMap<MemberId, PeerSender>>>,
}

impl InMemoryTransport {
    pub fn new(peers: HashMap<MemberId, PeerSender>) -> Self {
        Self {
            peers: Arc::new(RwLock::new(peers)),
        }
    }

    pub fn add_peer(&self, peer: MemberId, sender: PeerSender) {
        self.peers.write().insert(peer, sender);
    }

    pub fn remove_peer(&self, peer: &MemberId) {
        self.peers.write().remove(peer);
    }

    fn get_peer(&self, peer: &MemberId) -> Option<PeerSender> {
        self.peers.read().get(peer).cloned()
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn append(&self, target: &MemberId, request: AppendRequest) -> Result<AppendResponse> {
        let peer = self
            .get_peer(target)
            .ok_or_else(|| crate::error::RaftError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("peer not found: {target}"),
                ),
            })?;

        let (response_tx, response_rx) = tokio::sync::oneshot::channel();
        peer.send(PeerMessage::Append {
            request,
            response_tx,
        })
        .await
        .map_err(|e| crate::error::RaftError::Io {
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()),
        })?;

        response_rx.await.map_err(|e| crate::error::RaftError::Io {
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, e.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogIndex, ResponseStatus, Term};

    #[tokio::test]
    async fn test_in_memory_transport_append() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(10);
        let mut peers = HashMap::new();
        peers.insert(MemberId::new("n2"), tx);

        let transport = InMemoryTransport::new(peers);

        tokio::spawn(async move {
            if let Some(PeerMessage::Append {
                request: _,
                response_tx,
            }) = rx.recv().await
            {
                let _ = response_tx.send(AppendResponse {
                    status: ResponseStatus::Ok,
                    term: Term(1),
                    succeeded: true,
                    log_index: LogIndex(3),
                });
            }
        });

        let request = AppendRequest {
            term: Term(1),
            leader: MemberId::new("n1"),
            prev_log_index: LogIndex(3),
            prev_log_term: Term(1),
            entries: vec![],
            commit_index: LogIndex(2),
        };

        let response = transport
            .append(&MemberId::new("n2"), request)
            .await
            .unwrap();
        assert!(response.succeeded);
        assert_eq!(response.log_index, LogIndex(3));
    }

    #[tokio::test]
    async fn test_in_memory_transport_peer_not_found() {
        let transport = InMemoryTransport::new(HashMap::new());

        let request = AppendRequest {
            term: Term(1),
            leader: MemberId::new("n1"),
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            commit_index: LogIndex::ZERO,
        };

        let response = transport.append(&MemberId::new("unknown"), request).await;
        assert!(matches!(
            response.unwrap_err(),
            crate::error::RaftError::Io { .. }
        ));
    }
}
