//! Main Raft consensus module - wires everything together.
//!
//! The Raft struct owns:
//! - RaftState (core state machine)
//! - Background tasks (election loop, one replication loop per peer, apply
//!   loop, RPC handler loop)
//! - Lifecycle (start/shutdown)
//!
//! On-disk layout under a node's data directory:
//! ```text
//! <data_dir>/hard_state      current term and vote
//! <data_dir>/wal/            Raft log segments
//! <data_dir>/snapshots/      state machine snapshots
//! ```

use crate::config::RaftConfig;
use crate::election::election_loop;
use crate::error::{RaftError, Result};
use crate::hard_state::HardStateStore;
use crate::log::RaftLog;
use crate::replication::{apply_loop, maybe_snapshot, peer_loop};
use crate::rpc_handler::rpc_handler_loop;
use crate::snapshot::{SnapshotStore, StateMachine};
use crate::state::{Leadership, Proposal, RaftState, RaftStatus, RaftStorage};
use crate::transport::{RaftTransport, RpcReceiver};
use crate::types::*;
use bytes::Bytes;
use parking_lot::Mutex;
use quorum_observe::Meter;
use quorum_wal::WalConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Main Raft consensus module.
///
/// Wraps RaftState and manages background tasks for election, replication
/// and apply.
pub struct Raft {
    /// Core state machine
    state: Arc<RaftState>,

    /// Transport for outgoing RPCs
    transport: Arc<dyn RaftTransport>,

    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,

    /// Inbound RPCs; taken by `start`
    rpc_rx: Mutex<Option<RpcReceiver>>,

    /// Spawned background tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Raft {
    /// Create a Raft node from already-opened storage.
    ///
    /// Restores the state machine from the newest snapshot. Nothing runs
    /// until [`Raft::start`].
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        node_id: NodeId,
        config: RaftConfig,
        membership: ClusterMembership,
        storage: RaftStorage,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
        rpc_rx: RpcReceiver,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        let state = RaftState::new(node_id, config, membership, storage, state_machine, meter).await?;
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            state: Arc::new(state),
            transport,
            shutdown_tx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open (or create) a node's storage under `data_dir` and build the node.
    ///
    /// Fails with `RaftError::Storage` if the log is corrupt beyond a torn tail.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        node_id: NodeId,
        config: RaftConfig,
        membership: ClusterMembership,
        data_dir: impl AsRef<Path>,
        state_machine: Box<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
        rpc_rx: RpcReceiver,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir).await?;

        let wal_config = WalConfig {
            dir: data_dir.join("wal"),
            node_id: node_id.tag(),
            ..Default::default()
        };
        let (log, recovery) = RaftLog::open_with_config(wal_config, meter.clone()).await?;
        if recovery.corruption_detected {
            tracing::warn!(
                node = %node_id,
                bytes_truncated = recovery.bytes_truncated,
                "Truncated torn tail of the Raft log"
            );
        }

        let storage = RaftStorage {
            log,
            hard_state: HardStateStore::open(data_dir).await?,
            snapshots: SnapshotStore::open(data_dir.join("snapshots"), config.snapshot_retain)
                .await?,
        };

        Self::new(
            node_id,
            config,
            membership,
            storage,
            state_machine,
            transport,
            rpc_rx,
            meter,
        )
        .await
    }

    /// Start the background tasks.
    ///
    /// Spawns the election loop, a replication loop per peer, the apply loop
    /// and the RPC handler loop.
    pub fn start(&self) -> Result<()> {
        let rpc_rx = self.rpc_rx.lock().take().ok_or_else(|| RaftError::Internal {
            reason: "Raft node already started".to_string(),
        })?;

        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(election_loop(
            self.state.clone(),
            self.transport.clone(),
            self.shutdown_tx.subscribe(),
        )));

        let peers: Vec<NodeId> = self
            .state
            .membership()
            .peers_of(self.state.node_id())
            .cloned()
            .collect();
        for peer in peers {
            tasks.push(tokio::spawn(peer_loop(
                self.state.clone(),
                peer,
                self.transport.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        tasks.push(tokio::spawn(apply_loop(
            self.state.clone(),
            self.shutdown_tx.subscribe(),
        )));

        tasks.push(tokio::spawn(rpc_handler_loop(
            self.state.clone(),
            rpc_rx,
            self.shutdown_tx.subscribe(),
        )));

        tracing::info!(
            node = %self.state.node_id(),
            members = self.state.membership().len(),
            "Raft node started"
        );
        Ok(())
    }

    /// Stop the background tasks, fail pending submits and close the log.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Raft task ended abnormally");
            }
        }

        self.state.fail_all_waiters();
        self.state.log_ref().close().await?;
        tracing::info!(node = %self.state.node_id(), "Raft node stopped");
        Ok(())
    }

    /// Propose a new command to be replicated.
    ///
    /// Appends it to the local log if this node is the leader. The returned
    /// proposal resolves with the apply result once the entry is committed
    /// and applied.
    pub async fn propose(&self, command: Bytes) -> Result<Proposal> {
        self.state.propose(command).await
    }

    /// Snapshot the state machine now and compact the log.
    ///
    /// Returns the snapshot index, or `None` if nothing was applied since
    /// the last snapshot.
    pub async fn create_snapshot(&self) -> Result<Option<LogIndex>> {
        maybe_snapshot(&self.state, true).await
    }

    /// Check if this node is the leader.
    pub fn is_leader(&self) -> bool {
        self.state.role() == Role::Leader
    }

    /// Get the current leader (if known).
    pub fn leader(&self) -> Option<NodeId> {
        self.state.leader()
    }

    pub fn node_id(&self) -> &NodeId {
        self.state.node_id()
    }

    pub fn config(&self) -> &RaftConfig {
        self.state.config()
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.commit_index()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.last_applied()
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }

    pub fn status(&self) -> RaftStatus {
        self.state.status()
    }

    /// Time since this node last heard from a leader.
    pub fn since_leader_contact(&self) -> Option<Duration> {
        self.state.since_leader_contact()
    }

    pub fn subscribe_leadership(&self) -> watch::Receiver<Leadership> {
        self.state.subscribe_leadership()
    }

    pub fn subscribe_commit(&self) -> watch::Receiver<LogIndex> {
        self.state.subscribe_commit()
    }

    pub fn subscribe_applied(&self) -> watch::Receiver<LogIndex> {
        self.state.subscribe_applied()
    }

    /// Shared core state, for inspection.
    pub fn state(&self) -> &Arc<RaftState> {
        &self.state
    }
}
