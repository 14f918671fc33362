//! Raft transport over gRPC.

use crate::proto::{self, raft_service_client::RaftServiceClient};
use crate::MAX_MESSAGE_BYTES;
use quorum_raft::error::{RaftError, Result};
use quorum_raft::transport::RaftTransport;
use quorum_raft::types::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeId, RequestVoteRequest, RequestVoteResponse,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tonic::transport::{Channel, Endpoint};

/// gRPC-based Raft transport.
///
/// Connections are dialed on first use and cached per peer. A channel
/// reconnects on its own after the peer comes back, so a failed call never
/// evicts it.
pub struct GrpcTransport {
    local_id: NodeId,

    /// Peer addresses, every member except this node
    peers: HashMap<NodeId, SocketAddr>,

    clients: Arc<RwLock<HashMap<NodeId, RaftServiceClient<Channel>>>>,

    rpc_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(local_id: NodeId, peers: HashMap<NodeId, SocketAddr>, rpc_timeout: Duration) -> Self {
        Self {
            local_id,
            peers,
            clients: Arc::new(RwLock::new(HashMap::new())),
            rpc_timeout,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    async fn client(&self, target: &NodeId) -> Result<RaftServiceClient<Channel>> {
        if let Some(client) = self.clients.read().await.get(target) {
            return Ok(client.clone());
        }

        let addr = self
            .peers
            .get(target)
            .ok_or_else(|| unreachable(target, "unknown peer"))?;

        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| RaftError::ConfigError {
                reason: format!("invalid endpoint for {}: {}", target, e),
            })?
            .connect_timeout(self.rpc_timeout)
            .timeout(self.rpc_timeout)
            .tcp_nodelay(true);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| unreachable(target, format!("connect to {} failed: {}", addr, e)))?;
        tracing::debug!(peer = %target, %addr, "Connected to peer");

        let client = RaftServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES);

        self.clients
            .write()
            .await
            .entry(target.clone())
            .or_insert_with(|| client.clone());
        Ok(client)
    }
}

fn unreachable(target: &NodeId, reason: impl std::fmt::Display) -> RaftError {
    RaftError::Io {
        source: std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("peer {} unreachable: {}", target, reason),
        ),
    }
}

fn rpc_failed(target: &NodeId, rpc: &str, status: tonic::Status) -> RaftError {
    unreachable(target, format!("{} failed: {}", rpc, status))
}

#[tonic::async_trait]
impl RaftTransport for GrpcTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let mut client = self.client(target).await?;
        let response = client
            .request_vote(proto::RequestVoteRequest::from(request))
            .await
            .map_err(|e| rpc_failed(target, "RequestVote", e))?
            .into_inner();
        Ok(response.into())
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut client = self.client(target).await?;
        let response = client
            .append_entries(proto::AppendEntriesRequest::from(request))
            .await
            .map_err(|e| rpc_failed(target, "AppendEntries", e))?
            .into_inner();
        Ok(response.into())
    }

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut client = self.client(target).await?;
        let response = client
            .install_snapshot(proto::InstallSnapshotRequest::from(request))
            .await
            .map_err(|e| rpc_failed(target, "InstallSnapshot", e))?
            .into_inner();
        Ok(response.into())
    }
}
