//! Randomized election timer.

use crate::config::RaftConfig;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Election deadline, pushed back by every valid message from a leader or
/// granted vote. Followers and candidates start an election when it passes;
/// leaders use the same cadence to check that a quorum is still reachable.
pub struct ElectionTimer {
    config: RaftConfig,
    deadline: Mutex<Instant>,
}

impl ElectionTimer {
    pub fn new(config: RaftConfig) -> Self {
        let deadline = Instant::now() + config.random_election_timeout();
        Self {
            config,
            deadline: Mutex::new(deadline),
        }
    }

    /// Pick a fresh randomized deadline.
    pub fn reset(&self) {
        *self.deadline.lock() = Instant::now() + self.config.random_election_timeout();
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Completes once the deadline passes without a reset in between.
    pub async fn expired(&self) {
        loop {
            let deadline = self.deadline();
            tokio::time::sleep_until(deadline).await;
            if self.deadline() <= Instant::now() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(5),
            election_timeout_min: Duration::from_millis(20),
            election_timeout_max: Duration::from_millis(40),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_expires_after_timeout() {
        let timer = ElectionTimer::new(fast_config());

        let start = Instant::now();
        tokio::time::timeout(Duration::from_secs(1), timer.expired())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_reset_postpones_expiry() {
        let timer = std::sync::Arc::new(ElectionTimer::new(fast_config()));

        let resetter = {
            let timer = timer.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    timer.reset();
                }
            })
        };

        let start = Instant::now();
        timer.expired().await;
        resetter.await.unwrap();
        // Last reset lands at >= 50ms, so expiry cannot come before 50ms + min.
        assert!(start.elapsed() >= Duration::from_millis(70));
    }
}
