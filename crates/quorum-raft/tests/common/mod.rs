//! In-process cluster harness: every node has its own data directory, an
//! in-memory transport, and can be partitioned, crashed and restarted.

#![allow(dead_code)]

use quorum_observe::NoopMeter;
use quorum_raft::transport::{rpc_channel, InMemoryTransport, RaftTransport, RpcSender};
use quorum_raft::{ClusterMembership, KvStateMachine, KvStore, NodeId, Raft, RaftConfig, Role};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init()
        .ok();
}

/// Timeouts short enough for tests, with heartbeat well under election min.
pub fn fast_config() -> RaftConfig {
    RaftConfig {
        heartbeat_interval: Duration::from_millis(20),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        rpc_timeout: Duration::from_millis(50),
        replication_backoff_min: Duration::from_millis(20),
        replication_backoff_max: Duration::from_millis(100),
        submit_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub store: Option<KvStore>,
    pub kv: KvStateMachine,
    pub transport: InMemoryTransport,
    pub dir: TempDir,
}

impl TestNode {
    pub fn store(&self) -> &KvStore {
        self.store.as_ref().expect("node is down")
    }

    pub fn raft(&self) -> &Arc<Raft> {
        self.store().raft()
    }

    pub fn is_up(&self) -> bool {
        self.store.is_some()
    }
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub config: RaftConfig,
    membership: ClusterMembership,
    senders: HashMap<NodeId, RpcSender>,
}

impl TestCluster {
    /// Start an `n`-node, fully connected cluster.
    pub async fn new(n: usize, config: RaftConfig) -> Self {
        let ids: Vec<NodeId> = (1..=n).map(|i| NodeId::new(format!("n{}", i))).collect();
        let membership = ClusterMembership::new(ids.clone());

        let mut inboxes = HashMap::new();
        let mut senders: HashMap<NodeId, RpcSender> = HashMap::new();
        for id in &ids {
            let (tx, rx) = rpc_channel(256);
            inboxes.insert(id.clone(), rx);
            senders.insert(id.clone(), tx);
        }

        let mut nodes = Vec::new();
        for id in &ids {
            let peers = senders
                .iter()
                .filter(|(peer, _)| *peer != id)
                .map(|(peer, tx)| (peer.clone(), tx.clone()))
                .collect();
            nodes.push(TestNode {
                id: id.clone(),
                store: None,
                kv: KvStateMachine::new(),
                transport: InMemoryTransport::new(id.clone(), peers),
                dir: TempDir::new().unwrap(),
            });
        }

        let mut cluster = Self {
            nodes,
            config,
            membership,
            senders,
        };
        for i in 0..n {
            let rx = inboxes.remove(&ids[i]).unwrap();
            cluster.boot(i, rx).await;
        }
        cluster
    }

    async fn boot(&mut self, i: usize, rx: quorum_raft::RpcReceiver) {
        let kv = KvStateMachine::new();
        let node = &mut self.nodes[i];
        let transport: Arc<dyn RaftTransport> = Arc::new(node.transport.clone());
        let raft = Raft::open(
            node.id.clone(),
            self.config.clone(),
            self.membership.clone(),
            node.dir.path(),
            Box::new(kv.clone()),
            transport,
            rx,
            Arc::new(NoopMeter),
        )
        .await
        .unwrap();
        raft.start().unwrap();
        node.kv = kv.clone();
        node.store = Some(KvStore::new(Arc::new(raft), kv));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Index of the node that is leader in the highest term, if any.
    pub fn leader(&self) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_up() && n.raft().is_leader())
            .max_by_key(|(_, n)| n.raft().current_term())
            .map(|(i, _)| i)
    }

    /// Waits for a leader among the nodes in `among`.
    pub async fn wait_for_leader_among(&self, among: &[usize], within: Duration) -> usize {
        wait_until(within, || {
            among
                .iter()
                .copied()
                .find(|&i| self.nodes[i].is_up() && self.nodes[i].raft().is_leader())
        })
        .await
        .expect("no leader elected in time")
    }

    pub async fn wait_for_leader(&self, within: Duration) -> usize {
        let all: Vec<usize> = (0..self.len()).collect();
        self.wait_for_leader_among(&all, within).await
    }

    /// Cut every link between node `i` and the rest, both directions.
    pub fn isolate(&self, i: usize) {
        for (j, other) in self.nodes.iter().enumerate() {
            if j != i {
                other.transport.remove_peer(&self.nodes[i].id);
                self.nodes[i].transport.remove_peer(&other.id);
            }
        }
    }

    /// Cut every link in the cluster.
    pub fn partition_all(&self) {
        for i in 0..self.len() {
            self.isolate(i);
        }
    }

    /// Restore node `i`'s links to every other node.
    pub fn heal(&self, i: usize) {
        let me = &self.nodes[i];
        for (j, other) in self.nodes.iter().enumerate() {
            if j != i {
                other.transport.add_peer(me.id.clone(), self.senders[&me.id].clone());
                me.transport.add_peer(other.id.clone(), self.senders[&other.id].clone());
            }
        }
    }

    /// Restore every link.
    pub fn heal_all(&self) {
        for i in 0..self.len() {
            self.heal(i);
        }
    }

    /// Stop node `i`, keeping its data directory.
    pub async fn crash(&mut self, i: usize) {
        if let Some(store) = self.nodes[i].store.take() {
            store.raft().shutdown().await.unwrap();
        }
    }

    /// Restart a crashed node from its data directory with a fresh inbox.
    pub async fn restart(&mut self, i: usize) {
        let (tx, rx) = rpc_channel(256);
        let id = self.nodes[i].id.clone();
        for (j, other) in self.nodes.iter().enumerate() {
            if j != i {
                other.transport.add_peer(id.clone(), tx.clone());
            }
        }
        self.senders.insert(id, tx);
        self.boot(i, rx).await;
    }

    pub async fn shutdown(&mut self) {
        for i in 0..self.len() {
            self.crash(i).await;
        }
    }
}

/// Polls `check` every 10ms until it yields a value or `within` elapses.
pub async fn wait_until<T>(within: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if let Some(v) = check() {
            return Some(v);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// True when node roles say exactly one leader is up.
pub fn single_leader(cluster: &TestCluster) -> bool {
    cluster
        .nodes
        .iter()
        .filter(|n| n.is_up() && n.raft().status().role == Role::Leader)
        .count()
        == 1
}
