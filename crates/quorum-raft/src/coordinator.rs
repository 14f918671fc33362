//! Write coordinator: the client-facing KV API of one node.
//!
//! Writes are proposed to Raft and acknowledged only once they are durable
//! on a quorum and applied on this node; the apply result comes back to the
//! caller. Reads are served from the local state machine.

use crate::error::{RaftError, Result};
use crate::kv::{KvCommand, KvStateMachine, DELETED};
use crate::raft::Raft;
use crate::state::{Leadership, Proposal, RaftStatus};
use crate::types::*;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Replicated key-value store on top of a Raft node.
#[derive(Clone)]
pub struct KvStore {
    raft: Arc<Raft>,
    kv: KvStateMachine,
}

impl KvStore {
    /// `kv` must share state with the state machine the node applies to.
    pub fn new(raft: Arc<Raft>, kv: KvStateMachine) -> Self {
        Self { raft, kv }
    }

    pub fn raft(&self) -> &Arc<Raft> {
        &self.raft
    }

    /// Replicate `command` and wait for its apply result.
    ///
    /// Errors:
    /// - `Unhealthy` if this node hit a durability failure
    /// - `NotLeader` if this node is not leader, another node becomes leader
    ///   while waiting, or the entry is overwritten by another leader
    /// - `NoQuorum` if `timeout` elapses with no other leader known, including
    ///   after a step-down for lost quorum; the entry stays in the log and may
    ///   commit later
    pub async fn submit(&self, command: Bytes, timeout: Option<Duration>) -> Result<Bytes> {
        if !self.raft.is_healthy() {
            return Err(RaftError::Unhealthy {
                reason: self
                    .raft
                    .status()
                    .failure
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        let timeout = timeout.unwrap_or(self.raft.config().submit_timeout);
        let started = Instant::now();
        let mut leadership = self.raft.subscribe_leadership();

        let Proposal {
            index,
            term,
            mut result,
        } = self.raft.propose(command).await?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                outcome = &mut result => {
                    return outcome.unwrap_or(Err(RaftError::Shutdown));
                }
                changed = leadership.changed() => {
                    if changed.is_err() {
                        return Err(RaftError::Shutdown);
                    }
                    let now = leadership.borrow_and_update().clone();
                    if let Some(leader) = self.other_leader(&now) {
                        tracing::debug!(index = %index, term = %term, leader = %leader, "Leadership lost while waiting for commit");
                        return Err(RaftError::NotLeader { leader: Some(leader) });
                    }
                }
                _ = &mut deadline => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    let now = leadership.borrow().clone();
                    return match self.other_leader(&now) {
                        Some(leader) => Err(RaftError::NotLeader { leader: Some(leader) }),
                        None => {
                            tracing::warn!(index = %index, elapsed_ms, "Entry not committed before timeout");
                            Err(RaftError::NoQuorum { index, elapsed_ms })
                        }
                    };
                }
            }
        }
    }

    /// A leader other than this node, if one is known.
    ///
    /// Stepping down without learning of another leader (quorum lost, or a
    /// candidacy of our own) leaves the entry able to commit, so the submit
    /// keeps waiting for its deadline.
    fn other_leader(&self, now: &Leadership) -> Option<NodeId> {
        now.leader
            .as_ref()
            .filter(|leader| *leader != self.raft.node_id())
            .cloned()
    }

    /// Replicate a `Set`.
    pub async fn set(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let command = KvCommand::set(key, value).serialize()?;
        self.submit(command, timeout).await?;
        Ok(())
    }

    /// Replicate a `Del`. Returns whether the key existed.
    pub async fn delete(&self, key: impl Into<Bytes>, timeout: Option<Duration>) -> Result<bool> {
        let command = KvCommand::del(key).serialize()?;
        let result = self.submit(command, timeout).await?;
        Ok(result.first() == Some(&DELETED))
    }

    /// Local read. On a follower this may lag the leader.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.kv.get(key)
    }

    /// Local read that refuses to serve from a follower that has not heard
    /// from a leader within `max_follower_staleness`.
    pub fn get_bounded(&self, key: &[u8]) -> Result<Option<Bytes>> {
        if self.raft.is_leader() {
            return Ok(self.kv.get(key));
        }
        let bound = self.raft.config().max_follower_staleness;
        match self.raft.since_leader_contact() {
            Some(since) if since <= bound => Ok(self.kv.get(key)),
            since => Err(RaftError::StaleRead {
                since_ms: since.map_or(u64::MAX, |d| d.as_millis() as u64),
            }),
        }
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.raft.leader()
    }

    pub fn is_healthy(&self) -> bool {
        self.raft.is_healthy()
    }

    pub fn status(&self) -> RaftStatus {
        self.raft.status()
    }
}
