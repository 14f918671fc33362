//! Node health summary.

use quorum_raft::{RaftStatus, Role};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health status for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// "healthy", "degraded" or "unhealthy"
    pub status: String,

    pub node_id: String,

    /// Current Raft role
    pub role: Role,

    /// Current Raft term
    pub term: u64,

    pub commit_index: u64,

    pub last_applied: u64,

    /// Known leader, if any
    pub leader: Option<String>,

    /// Why the node is not healthy
    pub details: String,
}

impl HealthStatus {
    /// Classify a node from its Raft status.
    ///
    /// - unhealthy: the node hit a durability failure
    /// - degraded: no known leader, or a follower silent for longer than
    ///   `max_silence`
    /// - healthy: otherwise
    pub fn from_status(
        status: &RaftStatus,
        since_leader_contact: Option<Duration>,
        max_silence: Duration,
    ) -> Self {
        let (state, details) = if let Some(reason) = &status.failure {
            ("unhealthy", reason.clone())
        } else if status.role != Role::Leader && status.leader.is_none() {
            ("degraded", "no known leader".to_string())
        } else if status.role == Role::Follower
            && since_leader_contact.map_or(true, |since| since > max_silence)
        {
            ("degraded", "leader contact is stale".to_string())
        } else {
            ("healthy", String::new())
        };

        Self {
            status: state.to_string(),
            node_id: status.node_id.to_string(),
            role: status.role,
            term: status.term.as_u64(),
            commit_index: status.commit_index.as_u64(),
            last_applied: status.last_applied.as_u64(),
            leader: status.leader.as_ref().map(|l| l.to_string()),
            details,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_raft::{LogIndex, NodeId, Term};

    fn status(role: Role, leader: Option<&str>, failure: Option<&str>) -> RaftStatus {
        RaftStatus {
            node_id: NodeId::new("n1"),
            role,
            term: Term(3),
            leader: leader.map(NodeId::new),
            commit_index: LogIndex(7),
            last_applied: LogIndex(6),
            last_log_index: LogIndex(8),
            snapshot_index: LogIndex::ZERO,
            failure: failure.map(str::to_string),
        }
    }

    const SILENCE: Duration = Duration::from_secs(1);

    #[test]
    fn test_leader_is_healthy() {
        let health = HealthStatus::from_status(&status(Role::Leader, Some("n1"), None), None, SILENCE);
        assert!(health.is_healthy());
        assert_eq!(health.term, 3);
        assert_eq!(health.commit_index, 7);
        assert_eq!(health.last_applied, 6);
        assert_eq!(health.leader.as_deref(), Some("n1"));
    }

    #[test]
    fn test_follower_with_recent_contact_is_healthy() {
        let health = HealthStatus::from_status(
            &status(Role::Follower, Some("n2"), None),
            Some(Duration::from_millis(20)),
            SILENCE,
        );
        assert!(health.is_healthy());
    }

    #[test]
    fn test_leaderless_follower_is_degraded() {
        let health = HealthStatus::from_status(&status(Role::Follower, None, None), None, SILENCE);
        assert_eq!(health.status, "degraded");

        let stale = HealthStatus::from_status(
            &status(Role::Follower, Some("n2"), None),
            Some(Duration::from_secs(5)),
            SILENCE,
        );
        assert_eq!(stale.status, "degraded");
    }

    #[test]
    fn test_failed_node_is_unhealthy() {
        let health = HealthStatus::from_status(
            &status(Role::Leader, Some("n1"), Some("fsync failed")),
            None,
            SILENCE,
        );
        assert_eq!(health.status, "unhealthy");
        assert_eq!(health.details, "fsync failed");
    }

    #[test]
    fn test_serializes_to_yaml() {
        let health = HealthStatus::from_status(&status(Role::Leader, Some("n1"), None), None, SILENCE);
        let yaml = serde_yaml::to_string(&health).unwrap();
        assert!(yaml.contains("status: healthy"));
        assert!(yaml.contains("role: Leader"));
    }
}
