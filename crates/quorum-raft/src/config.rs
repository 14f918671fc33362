//! Raft configuration (timeouts, limits, snapshot triggers).

use std::time::Duration;

/// Raft configuration.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Heartbeat interval (leader → followers).
    ///
    /// Must be < election_timeout_min to prevent spurious elections.
    ///
    /// Default: 50ms
    pub heartbeat_interval: Duration,

    /// Minimum election timeout (follower → candidate).
    ///
    /// Randomized between [min, max] to reduce split votes.
    ///
    /// Default: 150ms
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    ///
    /// Default: 300ms
    pub election_timeout_max: Duration,

    /// Per-RPC timeout for peer calls.
    ///
    /// Default: 100ms
    pub rpc_timeout: Duration,

    /// Maximum number of entries per AppendEntries RPC.
    ///
    /// Default: 512 entries
    pub max_entries_per_append: usize,

    /// Byte budget per AppendEntries RPC, counted by entry size. A single
    /// entry over the budget is still sent on its own.
    ///
    /// Default: 1 MiB
    pub max_append_bytes: u64,

    /// Snapshot trigger: retained log size threshold (bytes).
    ///
    /// Default: 64 MiB
    pub snapshot_log_size_bytes: u64,

    /// Snapshot trigger: entries applied since the last snapshot.
    ///
    /// Default: 100,000 entries
    pub snapshot_entry_count: u64,

    /// InstallSnapshot chunk size (bytes).
    ///
    /// Default: 1 MiB
    pub snapshot_chunk_size: usize,

    /// Number of snapshot files kept on disk.
    ///
    /// Default: 1
    pub snapshot_retain: usize,

    /// Maximum committed entries applied per apply-loop pass.
    ///
    /// Default: 128 entries
    pub apply_batch_size: usize,

    /// Submit timeout used when the caller does not pass one.
    ///
    /// Default: 5000ms
    pub submit_timeout: Duration,

    /// Backoff bounds for a peer whose transport failed.
    ///
    /// Default: 50ms .. 1000ms
    pub replication_backoff_min: Duration,
    pub replication_backoff_max: Duration,

    /// How long a follower serves bounded-staleness reads without leader contact.
    ///
    /// Default: 1000ms
    pub max_follower_staleness: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            rpc_timeout: Duration::from_millis(100),

            max_entries_per_append: 512,
            max_append_bytes: 1024 * 1024,

            snapshot_log_size_bytes: 64 * 1024 * 1024,
            snapshot_entry_count: 100_000,
            snapshot_chunk_size: 1024 * 1024,
            snapshot_retain: 1,

            apply_batch_size: 128,
            submit_timeout: Duration::from_millis(5000),

            replication_backoff_min: Duration::from_millis(50),
            replication_backoff_max: Duration::from_millis(1000),

            max_follower_staleness: Duration::from_millis(1000),
        }
    }
}

impl RaftConfig {
    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be > 0".to_string());
        }

        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.rpc_timeout.is_zero() {
            return Err("rpc_timeout must be > 0".to_string());
        }

        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be > 0".to_string());
        }

        if self.max_append_bytes == 0 {
            return Err("max_append_bytes must be > 0".to_string());
        }

        if self.snapshot_entry_count == 0 || self.snapshot_log_size_bytes == 0 {
            return Err("snapshot thresholds must be > 0".to_string());
        }

        if self.snapshot_chunk_size == 0 {
            return Err("snapshot_chunk_size must be > 0".to_string());
        }

        if self.snapshot_retain == 0 {
            return Err("snapshot_retain must be >= 1".to_string());
        }

        if self.apply_batch_size == 0 {
            return Err("apply_batch_size must be > 0".to_string());
        }

        if self.replication_backoff_min > self.replication_backoff_max {
            return Err(format!(
                "replication_backoff_min ({:?}) must be <= replication_backoff_max ({:?})",
                self.replication_backoff_min, self.replication_backoff_max
            ));
        }

        Ok(())
    }

    /// Randomized election timeout in [election_timeout_min, election_timeout_max].
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(random_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_heartbeat_too_long() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(200),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_election_timeout_range() {
        let config = RaftConfig {
            election_timeout_min: Duration::from_millis(700),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_backoff_range() {
        let config = RaftConfig {
            replication_backoff_min: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_snapshot_threshold_rejected() {
        let config = RaftConfig {
            snapshot_entry_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_append_budget_rejected() {
        let config = RaftConfig {
            max_append_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_random_election_timeout_in_range() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout <= config.election_timeout_max);
        }
    }
}
