//! Server side of the peer RPC service.
//!
//! Requests arrive over gRPC, are converted to Raft types and forwarded to
//! the local node's RPC inbox; the handler's reply goes back on the call.

use crate::proto::{self, raft_service_server::RaftService, raft_service_server::RaftServiceServer};
use crate::MAX_MESSAGE_BYTES;
use quorum_raft::transport::{RpcMessage, RpcSender};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// Forwards peer RPCs into a node's inbox.
pub struct PeerService {
    inbox: RpcSender,
}

impl PeerService {
    pub fn new(inbox: RpcSender) -> Self {
        Self { inbox }
    }

    /// Sends `msg` to the node and waits for the handler's reply.
    async fn dispatch<T>(&self, msg: RpcMessage, rx: oneshot::Receiver<T>) -> Result<T, Status> {
        self.inbox
            .send(msg)
            .await
            .map_err(|_| Status::unavailable("Raft node is shutting down"))?;
        rx.await
            .map_err(|_| Status::internal("Raft handler dropped the request"))
    }
}

#[tonic::async_trait]
impl RaftService for PeerService {
    async fn request_vote(
        &self,
        request: Request<proto::RequestVoteRequest>,
    ) -> Result<Response<proto::RequestVoteResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(term = req.term, candidate = %req.candidate_id, "RequestVote RPC");

        let (response_tx, rx) = oneshot::channel();
        let msg = RpcMessage::RequestVote {
            request: req.into(),
            response_tx,
        };
        let resp = self.dispatch(msg, rx).await?;
        Ok(Response::new(resp.into()))
    }

    async fn append_entries(
        &self,
        request: Request<proto::AppendEntriesRequest>,
    ) -> Result<Response<proto::AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(
            term = req.term,
            leader = %req.leader_id,
            entries = req.entries.len(),
            "AppendEntries RPC"
        );

        let (response_tx, rx) = oneshot::channel();
        let msg = RpcMessage::AppendEntries {
            request: req.into(),
            response_tx,
        };
        let resp = self.dispatch(msg, rx).await?;
        Ok(Response::new(resp.into()))
    }

    async fn install_snapshot(
        &self,
        request: Request<proto::InstallSnapshotRequest>,
    ) -> Result<Response<proto::InstallSnapshotResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(
            term = req.term,
            leader = %req.leader_id,
            offset = req.offset,
            done = req.done,
            "InstallSnapshot RPC"
        );

        let (response_tx, rx) = oneshot::channel();
        let msg = RpcMessage::InstallSnapshot {
            request: req.into(),
            response_tx,
        };
        let resp = self.dispatch(msg, rx).await?;
        Ok(Response::new(resp.into()))
    }
}

/// Peer RPC listener.
///
/// Binding is separate from serving so the caller learns the bound address
/// (port 0 in tests) before any Raft loop starts.
pub struct GrpcRpcServer {
    listener: TcpListener,
}

impl GrpcRpcServer {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown_rx` fires or its sender is dropped.
    pub async fn run(self, inbox: RpcSender, mut shutdown_rx: broadcast::Receiver<()>) {
        let service = RaftServiceServer::new(PeerService::new(inbox))
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES);

        let result = Server::builder()
            .tcp_nodelay(true)
            .add_service(service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), async move {
                let _ = shutdown_rx.recv().await;
                tracing::info!("RPC server shutting down");
            })
            .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "RPC server failed");
        }
    }
}
