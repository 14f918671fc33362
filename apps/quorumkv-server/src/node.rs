//! Server node composition.
//!
//! Wires together the Raft log, gRPC transport, RPC server and KV store.

use crate::config::{ConfigError, ServerConfig};
use crate::health::HealthStatus;
use crate::meter::TracingMeter;
use quorum_raft::{rpc_channel, KvStateMachine, KvStore, NodeId, Raft, RaftTransport, RpcSender};
use quorum_transport_grpc::{GrpcRpcServer, GrpcTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const RPC_INBOX_CAPACITY: usize = 1024;

/// Server node - main composition root.
pub struct Node {
    config: ServerConfig,

    /// Replicated KV store (owns the Raft node)
    store: KvStore,

    /// Peer RPC listener, consumed on start
    rpc_server: Option<GrpcRpcServer>,

    /// Inbox the RPC server feeds into
    rpc_inbox: RpcSender,

    local_addr: SocketAddr,

    shutdown_tx: broadcast::Sender<()>,

    /// RPC accept loop and health logger
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Create a new node from configuration.
    ///
    /// Opens (or recovers) storage under `data_dir` and binds the RPC
    /// listener. Nothing runs until [`Node::start`].
    pub async fn new(config: ServerConfig) -> Result<Self, NodeError> {
        tracing::info!("Initializing node: {}", config.node_id);

        let raft_dir = config.raft_dir();
        std::fs::create_dir_all(&raft_dir)
            .map_err(|e| NodeError::Initialization(format!("Failed to create raft dir: {}", e)))?;
        tracing::info!("WAL directory: {}", config.wal_dir().display());
        tracing::info!("Snapshot directory: {}", config.snapshot_dir().display());

        let node_id = NodeId::new(&config.node_id);
        let raft_config = config.raft_config();
        let membership = config.membership();
        let peers = config.peer_addrs()?;

        tracing::info!(
            members = membership.len(),
            peers = ?peers,
            "Cluster membership configured"
        );

        let addr: SocketAddr = config
            .rpc_addr
            .parse()
            .map_err(|e| NodeError::Initialization(format!("Invalid rpc_addr: {}", e)))?;
        let rpc_server = GrpcRpcServer::bind(addr)
            .await
            .map_err(|e| NodeError::Initialization(format!("Failed to bind {}: {}", addr, e)))?;
        let local_addr = rpc_server
            .local_addr()
            .map_err(|e| NodeError::Initialization(e.to_string()))?;

        let transport: Arc<dyn RaftTransport> = Arc::new(GrpcTransport::new(
            node_id.clone(),
            peers,
            raft_config.rpc_timeout,
        ));
        let (rpc_inbox, rpc_rx) = rpc_channel(RPC_INBOX_CAPACITY);

        let kv = KvStateMachine::new();
        let raft = Raft::open(
            node_id,
            raft_config,
            membership,
            &raft_dir,
            Box::new(kv.clone()),
            transport,
            rpc_rx,
            Arc::new(TracingMeter),
        )
        .await
        .map_err(|e| NodeError::Initialization(format!("Failed to open Raft: {}", e)))?;

        let status = raft.status();
        tracing::info!(
            term = %status.term,
            commit = %status.commit_index,
            last_log = %status.last_log_index,
            snapshot = %status.snapshot_index,
            "Recovered Raft state"
        );

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            config,
            store: KvStore::new(Arc::new(raft), kv),
            rpc_server: Some(rpc_server),
            rpc_inbox,
            local_addr,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Start the RPC server, the Raft loops and the periodic health log.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        let rpc_server = self
            .rpc_server
            .take()
            .ok_or_else(|| NodeError::Startup("node already started".to_string()))?;

        tracing::info!("Starting node");

        self.store
            .raft()
            .start()
            .map_err(|e| NodeError::Startup(format!("Failed to start Raft: {}", e)))?;

        let inbox = self.rpc_inbox.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            rpc_server.run(inbox, shutdown_rx).await;
        }));
        tracing::info!("RPC server started on {}", self.local_addr);

        let interval = std::time::Duration::from_secs(self.config.health_interval_secs.max(1));
        let store = self.store.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let health = health_of(&store);
                        if health.is_healthy() {
                            tracing::info!(
                                role = %health.role,
                                term = health.term,
                                commit = health.commit_index,
                                applied = health.last_applied,
                                leader = ?health.leader,
                                "Health: {}", health.status
                            );
                        } else {
                            tracing::warn!(
                                role = %health.role,
                                term = health.term,
                                details = %health.details,
                                "Health: {}", health.status
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }));

        Ok(())
    }

    /// Shutdown the node gracefully.
    ///
    /// Stops the RPC server and health logger, then the Raft loops; pending
    /// writes fail and the log is synced and closed.
    pub async fn shutdown(mut self) -> Result<(), NodeError> {
        tracing::info!("Shutting down node");

        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Node task ended abnormally");
            }
        }

        self.store
            .raft()
            .shutdown()
            .await
            .map_err(|e| NodeError::Shutdown(format!("Failed to shutdown Raft: {}", e)))?;

        tracing::info!("Node shutdown complete");
        Ok(())
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the RPC server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn health(&self) -> HealthStatus {
        health_of(&self.store)
    }
}

fn health_of(store: &KvStore) -> HealthStatus {
    let raft = store.raft();
    HealthStatus::from_status(
        &raft.status(),
        raft.since_leader_contact(),
        raft.config().max_follower_staleness,
    )
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),
}
