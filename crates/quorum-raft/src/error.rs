//! Raft error types.

use thiserror::Error;

use crate::types::{LogIndex, NodeId, Term};

/// Raft errors.
#[derive(Error, Debug)]
pub enum RaftError {
    /// Not the leader; `leader` is the known leader, if any, for redirects.
    #[error("Not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// The entry was appended but a quorum did not persist it in time.
    /// The entry stays in the log and may still commit.
    #[error("No quorum: entry {index} not committed after {elapsed_ms}ms")]
    NoQuorum { index: LogIndex, elapsed_ms: u64 },

    /// Waiting for commit timed out for a reason other than lost quorum.
    #[error("Commit timeout after {elapsed_ms}ms")]
    CommitTimeout { elapsed_ms: u64 },

    /// Follower log does not match the leader's at `index`.
    #[error("Log inconsistency at index {index} (expected term {expected_term}, got {actual_term:?})")]
    LogInconsistency {
        index: LogIndex,
        expected_term: Term,
        actual_term: Option<Term>,
    },

    /// Snapshot creation, transfer or install failed.
    #[error("Snapshot failed: {reason}")]
    SnapshotFailed { reason: String },

    /// Invalid configuration.
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    /// The node hit a durability failure and refuses writes.
    #[error("Node unhealthy: {reason}")]
    Unhealthy { reason: String },

    /// A follower read was refused because no leader was heard from recently.
    #[error("Stale read: no leader contact for {since_ms}ms")]
    StaleRead { since_ms: u64 },

    /// The node is shutting down.
    #[error("Node is shutting down")]
    Shutdown,

    /// I/O error (network, snapshot files).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },

    /// WAL error.
    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: quorum_wal::SegmentError,
    },

    /// Internal error (bug).
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl RaftError {
    /// True for consensus rejections a client may retry (possibly elsewhere).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. }
                | RaftError::NoQuorum { .. }
                | RaftError::CommitTimeout { .. }
                | RaftError::LogInconsistency { .. }
                | RaftError::StaleRead { .. }
        )
    }

    /// True for storage failures after which the node must stop accepting writes.
    pub fn is_durability_failure(&self) -> bool {
        matches!(self, RaftError::Storage { .. } | RaftError::Unhealthy { .. })
    }
}

/// Raft result type.
pub type Result<T> = std::result::Result<T, RaftError>;
