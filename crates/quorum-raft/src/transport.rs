//! Transport abstraction for Raft RPC communication.
//!
//! Defines the `RaftTransport` trait that allows pluggable implementations:
//! - gRPC for real clusters (the `quorum-transport-grpc` crate)
//! - In-memory channels for tests and in-process clusters
//!
//! Both deliver inbound requests to a node as [`RpcMessage`]s on one inbox,
//! which the RPC handler loop drains.

use crate::error::{RaftError, Result};
use crate::types::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Transport abstraction for Raft RPC communication.
///
/// Errors mean "peer unreachable" (timeout, refused, dropped). The consensus
/// module never reads them as a vote or log-matching decision; it retries on
/// a later tick with backoff.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Send RequestVote RPC to a peer.
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    /// Send AppendEntries RPC to a peer (heartbeat when `entries` is empty).
    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    /// Send one InstallSnapshot chunk to a peer.
    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

/// RPC message envelope (tagged union of all RPC types)
#[derive(Debug)]
pub enum RpcMessage {
    RequestVote {
        request: RequestVoteRequest,
        response_tx: oneshot::Sender<RequestVoteResponse>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        response_tx: oneshot::Sender<AppendEntriesResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response_tx: oneshot::Sender<InstallSnapshotResponse>,
    },
}

pub type RpcSender = mpsc::Sender<RpcMessage>;
pub type RpcReceiver = mpsc::Receiver<RpcMessage>;

/// Creates a node's RPC inbox.
pub fn rpc_channel(capacity: usize) -> (RpcSender, RpcReceiver) {
    mpsc::channel(capacity)
}

pub(crate) fn unreachable(target: &NodeId, reason: impl std::fmt::Display) -> RaftError {
    RaftError::Io {
        source: std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("peer {} unreachable: {}", target, reason),
        ),
    }
}

/// In-memory transport (local channels, no network).
///
/// Removing a peer simulates a partition in one direction; tests cut both
/// directions by removing the peer on each side.
#[derive(Clone)]
pub struct InMemoryTransport {
    /// This node's ID
    local_id: NodeId,

    /// Inboxes of the other nodes
    peers: Arc<RwLock<HashMap<NodeId, RpcSender>>>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport.
    pub fn new(local_id: NodeId, peers: HashMap<NodeId, RpcSender>) -> Self {
        Self {
            local_id,
            peers: Arc::new(RwLock::new(peers)),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Add (or reconnect) a peer.
    pub fn add_peer(&self, peer_id: NodeId, sender: RpcSender) {
        self.peers.write().insert(peer_id, sender);
    }

    /// Remove a peer; later calls to it fail as unreachable.
    pub fn remove_peer(&self, peer_id: &NodeId) -> Option<RpcSender> {
        self.peers.write().remove(peer_id)
    }

    async fn call<Resp>(
        &self,
        target: &NodeId,
        make: impl FnOnce(oneshot::Sender<Resp>) -> RpcMessage,
    ) -> Result<Resp> {
        let peer = self
            .peers
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| unreachable(target, "not connected"))?;

        let (response_tx, response_rx) = oneshot::channel();
        peer.send(make(response_tx))
            .await
            .map_err(|e| unreachable(target, e))?;

        response_rx.await.map_err(|e| unreachable(target, e))
    }
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.call(target, |response_tx| RpcMessage::RequestVote {
            request,
            response_tx,
        })
        .await
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.call(target, |response_tx| RpcMessage::AppendEntries {
            request,
            response_tx,
        })
        .await
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(target, |response_tx| RpcMessage::InstallSnapshot {
            request,
            response_tx,
        })
        .await
    }
}
