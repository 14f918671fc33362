//! Server configuration.
//!
//! Loads and validates configuration from YAML files or environment variables.

use quorum_raft::{ClusterMembership, NodeId, RaftConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
///
/// Example YAML:
/// ```yaml
/// node_id: "n1"
/// rpc_addr: "0.0.0.0:7447"
/// data_dir: "/var/lib/quorumkv"
/// cluster:
///   - { id: "n1", addr: "10.0.1.10:7447" }
///   - { id: "n2", addr: "10.0.1.11:7447" }
///   - { id: "n3", addr: "10.0.1.12:7447" }
/// raft:
///   heartbeat_ms: 50
///   election_timeout_min_ms: 150
///   election_timeout_max_ms: 300
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique node identifier; must appear in `cluster`
    pub node_id: String,

    /// Peer RPC listen address
    #[serde(default = "default_rpc_addr")]
    pub rpc_addr: String,

    /// Root of the WAL, hard state and snapshots
    pub data_dir: PathBuf,

    /// Every member of the cluster, this node included. Empty means a
    /// single-node cluster made of this node alone.
    #[serde(default)]
    pub cluster: Vec<PeerConfig>,

    /// Raft timing and snapshot knobs
    #[serde(default)]
    pub raft: RaftTuning,

    /// Seconds between periodic health log lines
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftTuning {
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,

    /// Applied entries between automatic snapshots
    #[serde(default = "default_snapshot_entry_count")]
    pub snapshot_entry_count: u64,

    #[serde(default = "default_snapshot_log_size_bytes")]
    pub snapshot_log_size_bytes: u64,

    /// Byte budget for the entries of one AppendEntries RPC
    #[serde(default = "default_max_append_bytes")]
    pub max_append_bytes: u64,
}

impl Default for RaftTuning {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            snapshot_entry_count: default_snapshot_entry_count(),
            snapshot_log_size_bytes: default_snapshot_log_size_bytes(),
            max_append_bytes: default_max_append_bytes(),
        }
    }
}

fn default_rpc_addr() -> String {
    "0.0.0.0:7447".to_string()
}

fn default_health_interval_secs() -> u64 {
    10
}

fn default_heartbeat_ms() -> u64 {
    50
}

fn default_election_timeout_min_ms() -> u64 {
    150
}

fn default_election_timeout_max_ms() -> u64 {
    300
}

fn default_rpc_timeout_ms() -> u64 {
    100
}

fn default_submit_timeout_ms() -> u64 {
    5000
}

fn default_max_append_bytes() -> u64 {
    1024 * 1024
}

fn default_snapshot_entry_count() -> u64 {
    100_000
}

fn default_snapshot_log_size_bytes() -> u64 {
    64 * 1024 * 1024
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - QUORUMKV_NODE_ID
    /// - QUORUMKV_RPC_ADDR
    /// - QUORUMKV_DATA_DIR
    /// - QUORUMKV_CLUSTER (comma-separated `id=host:port`)
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let node_id = std::env::var("QUORUMKV_NODE_ID")
            .map_err(|_| ConfigError::MissingField("QUORUMKV_NODE_ID".to_string()))?;

        let rpc_addr = std::env::var("QUORUMKV_RPC_ADDR").unwrap_or_else(|_| default_rpc_addr());

        let data_dir = std::env::var("QUORUMKV_DATA_DIR")
            .map_err(|_| ConfigError::MissingField("QUORUMKV_DATA_DIR".to_string()))?;

        let cluster = match std::env::var("QUORUMKV_CLUSTER") {
            Ok(list) => parse_cluster_list(&list)?,
            Err(_) => Vec::new(),
        };

        let config = ServerConfig {
            node_id,
            rpc_addr,
            data_dir: PathBuf::from(data_dir),
            cluster,
            raft: RaftTuning::default(),
            health_interval_secs: default_health_interval_secs(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::InvalidField(
                "node_id cannot be empty".to_string(),
            ));
        }

        self.rpc_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidField(format!("Invalid rpc_addr: {}", e)))?;

        if self.data_dir.exists() && !self.data_dir.is_dir() {
            return Err(ConfigError::InvalidField(
                "data_dir exists but is not a directory".to_string(),
            ));
        }

        if !self.cluster.is_empty() && !self.cluster.iter().any(|p| p.id == self.node_id) {
            return Err(ConfigError::InvalidField(format!(
                "node_id {} is not listed in cluster",
                self.node_id
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.cluster {
            if !seen.insert(peer.id.as_str()) {
                return Err(ConfigError::InvalidField(format!(
                    "duplicate cluster member {}",
                    peer.id
                )));
            }
            peer.addr.parse::<SocketAddr>().map_err(|e| {
                ConfigError::InvalidField(format!("Invalid address for {}: {}", peer.id, e))
            })?;
        }

        self.raft_config()
            .validate()
            .map_err(ConfigError::InvalidField)?;

        Ok(())
    }

    /// Raft configuration derived from the tuning section.
    pub fn raft_config(&self) -> RaftConfig {
        let t = &self.raft;
        RaftConfig {
            heartbeat_interval: Duration::from_millis(t.heartbeat_ms),
            election_timeout_min: Duration::from_millis(t.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(t.election_timeout_max_ms),
            rpc_timeout: Duration::from_millis(t.rpc_timeout_ms),
            submit_timeout: Duration::from_millis(t.submit_timeout_ms),
            snapshot_entry_count: t.snapshot_entry_count,
            snapshot_log_size_bytes: t.snapshot_log_size_bytes,
            max_append_bytes: t.max_append_bytes,
            ..RaftConfig::default()
        }
    }

    /// Cluster membership; this node alone when `cluster` is empty.
    pub fn membership(&self) -> ClusterMembership {
        if self.cluster.is_empty() {
            ClusterMembership::new([NodeId::new(&self.node_id)])
        } else {
            ClusterMembership::new(self.cluster.iter().map(|p| NodeId::new(&p.id)))
        }
    }

    /// Addresses of every other member.
    pub fn peer_addrs(&self) -> Result<HashMap<NodeId, SocketAddr>, ConfigError> {
        self.cluster
            .iter()
            .filter(|p| p.id != self.node_id)
            .map(|p| {
                let addr = p.addr.parse::<SocketAddr>().map_err(|e| {
                    ConfigError::InvalidField(format!("Invalid address for {}: {}", p.id, e))
                })?;
                Ok((NodeId::new(&p.id), addr))
            })
            .collect()
    }

    /// Get the Raft data directory.
    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    /// Log segments, as laid out by `Raft::open` under the Raft directory.
    pub fn wal_dir(&self) -> PathBuf {
        self.raft_dir().join("wal")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.raft_dir().join("snapshots")
    }
}

fn parse_cluster_list(list: &str) -> Result<Vec<PeerConfig>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let (id, addr) = item.split_once('=').ok_or_else(|| {
                ConfigError::InvalidField(format!("expected id=host:port, got {}", item))
            })?;
            Ok(PeerConfig {
                id: id.trim().to_string(),
                addr: addr.trim().to_string(),
            })
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(node_id: &str, cluster: Vec<PeerConfig>) -> ServerConfig {
        ServerConfig {
            node_id: node_id.to_string(),
            rpc_addr: default_rpc_addr(),
            data_dir: PathBuf::from("/tmp/quorumkv-test"),
            cluster,
            raft: RaftTuning::default(),
            health_interval_secs: default_health_interval_secs(),
        }
    }

    fn peer(id: &str, addr: &str) -> PeerConfig {
        PeerConfig {
            id: id.to_string(),
            addr: addr.to_string(),
        }
    }

    #[test]
    fn test_default_single_node() {
        let config = config("n1", Vec::new());
        assert!(config.validate().is_ok());
        assert_eq!(config.membership().len(), 1);
        assert!(config.peer_addrs().unwrap().is_empty());
        assert_eq!(
            config.raft_config().heartbeat_interval,
            Duration::from_millis(50)
        );
        assert_eq!(
            config.wal_dir(),
            PathBuf::from("/tmp/quorumkv-test/raft/wal")
        );
    }

    #[test]
    fn test_parse_yaml_cluster() {
        let yaml = r#"
node_id: "n2"
rpc_addr: "127.0.0.1:7002"
data_dir: "/tmp/quorumkv-n2"
cluster:
  - { id: "n1", addr: "127.0.0.1:7001" }
  - { id: "n2", addr: "127.0.0.1:7002" }
  - { id: "n3", addr: "127.0.0.1:7003" }
raft:
  heartbeat_ms: 20
"#;
        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.membership().len(), 3);
        assert_eq!(config.raft.heartbeat_ms, 20);
        assert_eq!(config.raft.election_timeout_min_ms, 150);

        let peers = config.peer_addrs().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(
            peers[&NodeId::new("n3")],
            "127.0.0.1:7003".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_invalid_rpc_addr() {
        let mut config = config("n1", Vec::new());
        config.rpc_addr = "invalid_addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_node_id() {
        assert!(config("", Vec::new()).validate().is_err());
    }

    #[test]
    fn test_node_missing_from_cluster() {
        let config = config(
            "n9",
            vec![peer("n1", "127.0.0.1:7001"), peer("n2", "127.0.0.1:7002")],
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidField(_))
        ));
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let config = config(
            "n1",
            vec![peer("n1", "127.0.0.1:7001"), peer("n1", "127.0.0.1:7002")],
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_must_be_below_election_timeout() {
        let mut config = config("n1", Vec::new());
        config.raft.heartbeat_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_cluster_list() {
        let peers = parse_cluster_list("n1=127.0.0.1:7001, n2=127.0.0.1:7002").unwrap();
        assert_eq!(
            peers,
            vec![peer("n1", "127.0.0.1:7001"), peer("n2", "127.0.0.1:7002")]
        );
        assert!(parse_cluster_list("n1@127.0.0.1:7001").is_err());
    }
}
