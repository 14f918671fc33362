//! Raft node state (Follower, Candidate, Leader roles and transitions).
//!
//! The state machine handles:
//! - Role transitions (Follower → Candidate → Leader → Follower)
//! - RPC handling (RequestVote, AppendEntries, InstallSnapshot)
//! - Leader-side proposal and commit advancement
//! - Hand-off of apply results to waiting submitters
//!
//! # Persistent State (survives crashes)
//!
//! - `current_term` and `voted_for`: stored in the hard state file and made
//!   durable before any reply or request that depends on them
//! - `log`: Log entries (stored in RaftLog)
//!
//! # Volatile State (all servers)
//!
//! - `commit_index`: Index of highest log entry known to be committed
//! - `last_applied`: Index of highest log entry applied to state machine
//!
//! # Volatile State (leaders only)
//!
//! - `next_index[]`: For each follower, index of next log entry to send
//! - `match_index[]`: For each follower, index of highest log entry known to be replicated
//!
//! # Locking
//!
//! Every mutation of term, vote, role or log goes through the async consensus
//! lock, so handlers and the election task never observe a torn state. Lock
//! order is consensus lock, then state machine lock, then the log's writer
//! lock. The parking_lot locks are never held across an await.

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::hard_state::{HardState, HardStateStore};
use crate::log::RaftLog;
use crate::snapshot::{Snapshot, SnapshotStore, StateMachine};
use crate::timer::ElectionTimer;
use crate::types::*;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use quorum_observe::{Meter, RaftEvt, RaftKind, SnapEvt, SnapKind, VizEvent};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};

/// Term, role and known leader, published together on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Leadership {
    pub term: Term,
    pub role: Role,
    pub leader: Option<NodeId>,
}

/// Point-in-time view of a node, for health reporting and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub failure: Option<String>,
}

/// Volatile state (lost on crash, recomputed on recovery).
pub struct VolatileState {
    /// Current role (Follower, Candidate, or Leader)
    pub role: Role,

    /// Current leader (if known)
    pub leader_id: Option<NodeId>,

    /// Highest log index known to be committed (never decreases)
    pub commit_index: LogIndex,

    /// Highest log index applied to state machine
    pub last_applied: LogIndex,

    /// Leader-specific state (only valid when role == Leader)
    pub leader_state: Option<LeaderState>,

    /// Last time a valid leader message arrived (followers)
    pub last_leader_contact: Option<Instant>,
}

/// Leader-specific volatile state, tracked per follower.
pub struct LeaderState {
    /// Term this leadership belongs to
    pub term: Term,

    /// For each peer, index of next log entry to send
    pub next_index: HashMap<NodeId, LogIndex>,

    /// For each peer, index of highest log entry known to be replicated
    pub match_index: HashMap<NodeId, LogIndex>,

    /// For each peer, when it last answered any RPC
    pub last_contact: HashMap<NodeId, Instant>,

    /// Peers whose transport recently failed
    pub backoff: HashMap<NodeId, Backoff>,
}

/// Exponential retry delay for an unreachable peer.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub delay: Duration,
    pub retry_at: Instant,
}

struct Waiter {
    term: Term,
    tx: oneshot::Sender<Result<Bytes>>,
}

struct PendingInstall {
    index: LogIndex,
    term: Term,
    buf: Vec<u8>,
}

/// A leader-accepted command waiting to be committed and applied.
pub struct Proposal {
    pub index: LogIndex,
    pub term: Term,
    pub result: oneshot::Receiver<Result<Bytes>>,
}

/// Storage handed to a node at construction.
pub struct RaftStorage {
    pub log: RaftLog,
    pub hard_state: HardStateStore,
    pub snapshots: SnapshotStore,
}

/// Raft node state.
///
/// Encapsulates all Raft state and logic for a single node.
pub struct RaftState {
    node_id: NodeId,
    config: RaftConfig,
    membership: ClusterMembership,

    consensus: tokio::sync::Mutex<()>,
    persistent: RwLock<HardState>,
    hard_state: HardStateStore,
    volatile: RwLock<VolatileState>,

    log: RaftLog,
    snapshots: SnapshotStore,
    state_machine: tokio::sync::Mutex<Box<dyn StateMachine>>,

    timer: Arc<ElectionTimer>,
    waiters: Mutex<BTreeMap<LogIndex, Waiter>>,
    pending_install: Mutex<Option<PendingInstall>>,
    failure: RwLock<Option<String>>,

    commit_tx: watch::Sender<LogIndex>,
    applied_tx: watch::Sender<LogIndex>,
    last_log_tx: watch::Sender<LogIndex>,
    leadership_tx: watch::Sender<Leadership>,

    meter: Arc<dyn Meter>,
}

impl RaftState {
    /// Builds a node from its storage, restoring the state machine from the
    /// newest snapshot.
    ///
    /// Commit and applied indexes start at the snapshot index; the leader
    /// raises the commit index again and the apply loop replays from there.
    pub async fn new(
        node_id: NodeId,
        config: RaftConfig,
        membership: ClusterMembership,
        storage: RaftStorage,
        mut state_machine: Box<dyn StateMachine>,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|reason| RaftError::ConfigError { reason })?;
        if !membership.contains(&node_id) {
            return Err(RaftError::ConfigError {
                reason: format!("node {} is not a cluster member", node_id),
            });
        }

        let RaftStorage {
            log,
            hard_state,
            snapshots,
        } = storage;
        let persistent = hard_state.load().await?;

        let mut applied = LogIndex::ZERO;
        if let Some(snapshot) = snapshots.load_latest().await? {
            state_machine.restore(&snapshot.data)?;
            applied = snapshot.index();
            if log.term_at(applied) != Some(snapshot.term()) {
                // Crashed between saving an installed snapshot and rebasing the log.
                log.reset_to(applied, snapshot.term()).await?;
            }
            tracing::info!(
                node = %node_id,
                index = %applied,
                term = %snapshot.term(),
                "Restored state machine from snapshot"
            );
        }

        let (base, _) = log.snapshot_base();
        if base > applied {
            return Err(RaftError::SnapshotFailed {
                reason: format!(
                    "log is compacted through {} but no snapshot covers it (newest usable: {})",
                    base, applied
                ),
            });
        }

        let leadership = Leadership {
            term: persistent.current_term,
            role: Role::Follower,
            leader: None,
        };
        let last_index = log.last_index();

        tracing::info!(
            node = %node_id,
            term = %persistent.current_term,
            voted_for = ?persistent.voted_for,
            last_index = %last_index,
            "Raft state loaded"
        );

        Ok(Self {
            node_id,
            timer: Arc::new(ElectionTimer::new(config.clone())),
            config,
            membership,
            consensus: tokio::sync::Mutex::new(()),
            persistent: RwLock::new(persistent),
            hard_state,
            volatile: RwLock::new(VolatileState {
                role: Role::Follower,
                leader_id: None,
                commit_index: applied,
                last_applied: applied,
                leader_state: None,
                last_leader_contact: None,
            }),
            log,
            snapshots,
            state_machine: tokio::sync::Mutex::new(state_machine),
            waiters: Mutex::new(BTreeMap::new()),
            pending_install: Mutex::new(None),
            failure: RwLock::new(None),
            commit_tx: watch::channel(applied).0,
            applied_tx: watch::channel(applied).0,
            last_log_tx: watch::channel(last_index).0,
            leadership_tx: watch::channel(leadership).0,
            meter,
        })
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Get this node's ID.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn membership(&self) -> &ClusterMembership {
        &self.membership
    }

    /// Get the current role.
    pub fn role(&self) -> Role {
        self.volatile.read().role
    }

    /// Get the current term.
    pub fn current_term(&self) -> Term {
        self.persistent.read().current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.persistent.read().voted_for.clone()
    }

    /// Get the current leader (if known).
    pub fn leader(&self) -> Option<NodeId> {
        self.volatile.read().leader_id.clone()
    }

    /// Get the commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.volatile.read().commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.volatile.read().last_applied
    }

    /// Get a reference to the log.
    pub fn log_ref(&self) -> &RaftLog {
        &self.log
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Get a reference to the volatile state.
    pub fn volatile_state(&self) -> &RwLock<VolatileState> {
        &self.volatile
    }

    pub fn timer(&self) -> &Arc<ElectionTimer> {
        &self.timer
    }

    pub(crate) fn meter(&self) -> &Arc<dyn Meter> {
        &self.meter
    }

    /// Time since the last valid leader message, if one was ever received.
    pub fn since_leader_contact(&self) -> Option<Duration> {
        self.volatile
            .read()
            .last_leader_contact
            .map(|at| at.elapsed())
    }

    pub fn subscribe_commit(&self) -> watch::Receiver<LogIndex> {
        self.commit_tx.subscribe()
    }

    pub fn subscribe_applied(&self) -> watch::Receiver<LogIndex> {
        self.applied_tx.subscribe()
    }

    pub fn subscribe_last_log(&self) -> watch::Receiver<LogIndex> {
        self.last_log_tx.subscribe()
    }

    pub fn subscribe_leadership(&self) -> watch::Receiver<Leadership> {
        self.leadership_tx.subscribe()
    }

    /// Why this node refuses writes, if it does.
    pub fn failure(&self) -> Option<String> {
        self.failure.read().clone().or_else(|| self.log.failure())
    }

    pub fn is_healthy(&self) -> bool {
        self.failure().is_none()
    }

    pub(crate) fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(node = %self.node_id, reason = %reason, "Node marked unhealthy");
        self.failure.write().get_or_insert(reason);
    }

    pub fn status(&self) -> RaftStatus {
        let term = self.current_term();
        let volatile = self.volatile.read();
        RaftStatus {
            node_id: self.node_id.clone(),
            role: volatile.role,
            term,
            leader: volatile.leader_id.clone(),
            commit_index: volatile.commit_index,
            last_applied: volatile.last_applied,
            last_log_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_base().0,
            failure: self.failure(),
        }
    }

    fn emit_raft(&self, term: Term, kind: RaftKind) {
        self.meter.emit(VizEvent::Raft(RaftEvt {
            node: self.node_id.tag(),
            term: term.as_u64(),
            kind,
        }));
    }

    fn publish_leadership(&self) {
        let next = Leadership {
            term: self.current_term(),
            role: self.role(),
            leader: self.leader(),
        };
        self.leadership_tx.send_if_modified(|current| {
            if *current != next {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    // ---------------------------------------------------------------------
    // Term and role transitions (callers hold the consensus lock)
    // ---------------------------------------------------------------------

    /// Makes `state` durable, then visible.
    async fn persist(&self, state: HardState) -> Result<()> {
        if let Err(e) = self.hard_state.save(&state).await {
            self.mark_failed(format!("hard state write failed: {}", e));
            return Err(e);
        }
        *self.persistent.write() = state;
        Ok(())
    }

    /// Adopts a newer term: durable term bump, vote cleared, follower role.
    async fn adopt_term(&self, term: Term) -> Result<()> {
        self.persist(HardState {
            current_term: term,
            voted_for: None,
        })
        .await?;
        self.become_follower(None);
        Ok(())
    }

    fn become_follower(&self, leader: Option<NodeId>) {
        let was_leader = {
            let mut volatile = self.volatile.write();
            let was_leader = volatile.role == Role::Leader;
            volatile.role = Role::Follower;
            volatile.leader_state = None;
            volatile.leader_id = leader;
            was_leader
        };
        if was_leader {
            let term = self.current_term();
            tracing::info!(node = %self.node_id, term = %term, "Stepped down to follower");
            self.emit_raft(term, RaftKind::StepDown);
        }
        self.publish_leadership();
    }

    /// Steps down if `term` is newer than ours. Used by the leader and
    /// candidates when a response reveals a higher term.
    pub async fn observe_term(&self, term: Term) -> Result<()> {
        let _guard = self.consensus.lock().await;
        if term > self.current_term() {
            tracing::info!(node = %self.node_id, term = %term, "Observed higher term");
            self.adopt_term(term).await?;
        }
        Ok(())
    }

    /// Transition to candidate: increment the term and vote for ourselves.
    ///
    /// Returns the term and our last log position for the vote requests.
    pub async fn start_election(&self) -> Result<(Term, LogIndex, Term)> {
        let _guard = self.consensus.lock().await;
        if !self.is_healthy() {
            return Err(RaftError::Unhealthy {
                reason: self.failure().unwrap_or_default(),
            });
        }

        let term = self.current_term().next();
        self.persist(HardState {
            current_term: term,
            voted_for: Some(self.node_id.clone()),
        })
        .await?;
        {
            let mut volatile = self.volatile.write();
            volatile.role = Role::Candidate;
            volatile.leader_id = None;
            volatile.leader_state = None;
        }
        self.timer.reset();
        self.publish_leadership();
        self.emit_raft(term, RaftKind::VoteReq);

        let (last_index, last_term) = self.log.last_index_and_term();
        tracing::debug!(node = %self.node_id, term = %term, "Starting election");
        Ok((term, last_index, last_term))
    }

    /// Transition to leader after winning the election for `term`.
    ///
    /// Appends a no-op entry of the new term so earlier-term entries can
    /// commit. Returns false if the node moved on from that candidacy.
    pub async fn become_leader(&self, term: Term) -> Result<bool> {
        let _guard = self.consensus.lock().await;
        if self.current_term() != term || self.role() != Role::Candidate {
            return Ok(false);
        }

        let last_log_index = self.log.last_index();
        let now = Instant::now();
        {
            let mut volatile = self.volatile.write();
            volatile.role = Role::Leader;
            volatile.leader_id = Some(self.node_id.clone());

            let peers: Vec<NodeId> = self.membership.peers_of(&self.node_id).cloned().collect();
            volatile.leader_state = Some(LeaderState {
                term,
                next_index: peers
                    .iter()
                    .map(|p| (p.clone(), last_log_index.next()))
                    .collect(),
                match_index: peers.iter().map(|p| (p.clone(), LogIndex::ZERO)).collect(),
                last_contact: peers.iter().map(|p| (p.clone(), now)).collect(),
                backoff: HashMap::new(),
            });
        }
        self.publish_leadership();
        self.emit_raft(term, RaftKind::LeaderElected);
        tracing::info!(node = %self.node_id, term = %term, "Became leader");

        let index = self.append_as_leader(term, Bytes::new()).await?;
        tracing::debug!(node = %self.node_id, index = %index, "Appended leader no-op");
        Ok(true)
    }

    /// Leader steps down if it has not heard from a quorum within the
    /// election timeout.
    pub async fn check_quorum(&self) {
        let _guard = self.consensus.lock().await;
        let lost = {
            let volatile = self.volatile.read();
            let Some(ls) = volatile.leader_state.as_ref() else {
                return;
            };
            let window = self.config.election_timeout_max;
            let reachable = ls
                .last_contact
                .iter()
                .filter(|(_, at)| at.elapsed() <= window)
                .map(|(id, _)| id)
                .chain(std::iter::once(&self.node_id));
            !self.membership.has_quorum(reachable)
        };
        if lost {
            tracing::warn!(
                node = %self.node_id,
                term = %self.current_term(),
                "Lost contact with quorum; stepping down"
            );
            self.become_follower(None);
        }
    }

    // ---------------------------------------------------------------------
    // RPC handlers
    // ---------------------------------------------------------------------

    /// Handle RequestVote RPC.
    ///
    /// At most one vote per term, and only for a candidate whose log is at
    /// least as up-to-date as ours. The vote is durable before we answer.
    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let _guard = self.consensus.lock().await;

        if request.term > self.current_term() {
            self.adopt_term(request.term).await?;
        }

        let hs = self.persistent.read().clone();
        let (last_log_index, last_log_term) = self.log.last_index_and_term();
        let log_ok = (request.last_log_term, request.last_log_index) >= (last_log_term, last_log_index);
        let free = hs
            .voted_for
            .as_ref()
            .map_or(true, |id| id == &request.candidate_id);
        let vote_granted = request.term == hs.current_term && free && log_ok;

        if vote_granted {
            if hs.voted_for.is_none() {
                self.persist(HardState {
                    current_term: hs.current_term,
                    voted_for: Some(request.candidate_id.clone()),
                })
                .await?;
            }
            self.timer.reset();
            self.emit_raft(
                hs.current_term,
                RaftKind::VoteGranted {
                    to: request.candidate_id.tag(),
                },
            );
        }

        tracing::debug!(
            node = %self.node_id,
            candidate = %request.candidate_id,
            term = %request.term,
            granted = vote_granted,
            "Handled vote request"
        );

        Ok(RequestVoteResponse {
            term: hs.current_term,
            vote_granted,
        })
    }

    /// Records a valid message from the leader of the current term.
    fn accept_leader(&self, leader: &NodeId) {
        let changed = {
            let mut volatile = self.volatile.write();
            volatile.last_leader_contact = Some(Instant::now());
            volatile.role != Role::Follower || volatile.leader_id.as_ref() != Some(leader)
        };
        if changed {
            if self.role() == Role::Leader {
                tracing::warn!(
                    node = %self.node_id,
                    other = %leader,
                    "Another leader in the same term; stepping down"
                );
            }
            self.become_follower(Some(leader.clone()));
        }
        self.timer.reset();
    }

    /// Handle AppendEntries RPC.
    ///
    /// Invoked by leader to replicate log entries and as a heartbeat.
    /// Entries are durable before a success response is returned.
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let _guard = self.consensus.lock().await;

        let current_term = self.current_term();
        if request.term < current_term {
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                match_index: LogIndex::ZERO,
                conflict_index: None,
            });
        }
        if request.term > current_term {
            self.adopt_term(request.term).await?;
        }
        let term = request.term;
        self.accept_leader(&request.leader_id);

        let reject = |conflict_index: LogIndex| AppendEntriesResponse {
            term,
            success: false,
            match_index: LogIndex::ZERO,
            conflict_index: Some(conflict_index),
        };

        // Consistency check. Anything at or below our snapshot base is
        // committed, so it matches the leader by definition.
        let (base_index, _) = self.log.snapshot_base();
        let mut entries = request.entries;
        let mut prev = request.prev_log_index;
        if prev < base_index {
            entries.retain(|e| e.index > base_index);
            prev = base_index;
        } else {
            match self.log.term_at(prev) {
                None => return Ok(reject(self.log.last_index().next())),
                Some(t) if t != request.prev_log_term => {
                    return Ok(reject(self.log.first_index_of_term_at(prev)));
                }
                Some(_) => {}
            }
        }

        let match_index = entries.last().map(|e| e.index).unwrap_or(prev);

        // Skip entries we already hold; cut the log at the first conflict.
        let mut start = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index() {
                        return Err(RaftError::Internal {
                            reason: format!(
                                "leader {} asked to overwrite committed entry {}",
                                request.leader_id, entry.index
                            ),
                        });
                    }
                    self.log.truncate_suffix(entry.index).await?;
                    self.fail_waiters_from(entry.index, Some(request.leader_id.clone()));
                    start = i;
                    break;
                }
                None => {
                    start = i;
                    break;
                }
            }
        }
        if start < entries.len() {
            entries.drain(..start);
            self.log.append(entries).await?;
        }

        let target = request.leader_commit.min(match_index);
        self.advance_commit_to(target);

        Ok(AppendEntriesResponse {
            term,
            success: true,
            match_index,
            conflict_index: None,
        })
    }

    /// Handle one InstallSnapshot chunk.
    ///
    /// Chunks are buffered until `done`; an offset of 0 restarts the buffer
    /// and an unexpected offset is answered with what we hold so the leader
    /// can restart.
    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let _guard = self.consensus.lock().await;

        let current_term = self.current_term();
        if request.term < current_term {
            return Ok(InstallSnapshotResponse {
                term: current_term,
                bytes_stored: 0,
            });
        }
        if request.term > current_term {
            self.adopt_term(request.term).await?;
        }
        let term = request.term;
        self.accept_leader(&request.leader_id);

        let complete = {
            let mut pending = self.pending_install.lock();
            if request.offset == 0 {
                *pending = Some(PendingInstall {
                    index: request.last_included_index,
                    term: request.last_included_term,
                    buf: Vec::new(),
                });
            }
            let stored = match pending.as_mut() {
                Some(p)
                    if p.index == request.last_included_index
                        && p.term == request.last_included_term
                        && p.buf.len() as u64 == request.offset =>
                {
                    p.buf.extend_from_slice(&request.data);
                    p.buf.len() as u64
                }
                Some(p) if p.index == request.last_included_index => {
                    return Ok(InstallSnapshotResponse {
                        term,
                        bytes_stored: p.buf.len() as u64,
                    });
                }
                _ => {
                    return Ok(InstallSnapshotResponse {
                        term,
                        bytes_stored: 0,
                    });
                }
            };
            if !request.done {
                return Ok(InstallSnapshotResponse {
                    term,
                    bytes_stored: stored,
                });
            }
            pending.take().map(|p| p.buf).unwrap_or_default()
        };

        let bytes_stored = complete.len() as u64;
        let snapshot = match Snapshot::decode(&complete) {
            Ok(s) if s.index() == request.last_included_index => s,
            Ok(_) | Err(_) => {
                tracing::warn!(
                    node = %self.node_id,
                    index = %request.last_included_index,
                    "Discarding invalid snapshot transfer"
                );
                return Ok(InstallSnapshotResponse {
                    term,
                    bytes_stored: 0,
                });
            }
        };

        self.install_snapshot(snapshot, bytes_stored).await?;

        Ok(InstallSnapshotResponse { term, bytes_stored })
    }

    /// Persists `snapshot`, restores the state machine from it and rebases the log.
    async fn install_snapshot(&self, snapshot: Snapshot, bytes: u64) -> Result<()> {
        let index = snapshot.index();
        let term = snapshot.term();

        let mut sm = self.state_machine.lock().await;
        if index <= self.last_applied() {
            tracing::debug!(node = %self.node_id, index = %index, "Snapshot already covered locally");
            return Ok(());
        }

        self.snapshots.save(&snapshot).await?;
        sm.restore(&snapshot.data)?;

        if self.log.term_at(index) == Some(term) {
            self.log.truncate_prefix(index).await?;
        } else {
            self.log.reset_to(index, term).await?;
            self.fail_waiters_from(LogIndex::ZERO, self.leader());
        }

        {
            let mut volatile = self.volatile.write();
            volatile.last_applied = index;
            if index > volatile.commit_index {
                volatile.commit_index = index;
            }
        }
        drop(sm);
        self.commit_tx.send_replace(self.commit_index());
        self.applied_tx.send_replace(index);

        self.meter.emit(VizEvent::Snapshot(SnapEvt {
            node: self.node_id.tag(),
            index: index.as_u64(),
            kind: SnapKind::Installed { bytes },
        }));
        tracing::info!(node = %self.node_id, index = %index, term = %term, bytes, "Installed snapshot");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Leader side
    // ---------------------------------------------------------------------

    /// Appends `command` at the next index if this node is leader.
    ///
    /// The returned proposal resolves once the entry is applied, or fails if
    /// it is overwritten by another leader's entry.
    pub async fn propose(&self, command: Bytes) -> Result<Proposal> {
        if let Some(reason) = self.failure() {
            return Err(RaftError::Unhealthy { reason });
        }

        let _guard = self.consensus.lock().await;
        if self.role() != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader(),
            });
        }
        let term = self.current_term();

        // Register before the write so the apply loop cannot miss it.
        let expected = self.log.last_index().next();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(expected, Waiter { term, tx });

        match self.append_as_leader(term, command).await {
            Ok(index) if index == expected => Ok(Proposal {
                index,
                term,
                result: rx,
            }),
            Ok(index) => {
                self.waiters.lock().remove(&expected);
                Err(RaftError::Internal {
                    reason: format!("proposal landed at {} instead of {}", index, expected),
                })
            }
            Err(e) => {
                self.waiters.lock().remove(&expected);
                Err(e)
            }
        }
    }

    /// Durable local append as leader, then wake replication.
    async fn append_as_leader(&self, term: Term, command: Bytes) -> Result<LogIndex> {
        let index = self.log.append_command(term, command).await?;
        self.last_log_tx.send_replace(index);
        if self.membership.len() == 1 {
            self.advance_commit_index();
        }
        Ok(index)
    }

    /// Leader commit rule: highest index stored on a quorum whose entry is
    /// from the current term.
    ///
    /// Returns true if the commit index advanced.
    pub fn advance_commit_index(&self) -> bool {
        let candidate = {
            let volatile = self.volatile.read();
            let Some(ls) = volatile.leader_state.as_ref() else {
                return false;
            };
            let mut matched: Vec<LogIndex> = ls.match_index.values().copied().collect();
            matched.push(self.log.last_index());
            matched.sort_unstable_by(|a, b| b.cmp(a));

            let quorum = self.membership.quorum();
            let Some(n) = matched.get(quorum - 1).copied() else {
                return false;
            };
            if n <= volatile.commit_index || self.log.term_at(n) != Some(ls.term) {
                return false;
            }
            (n, ls.term)
        };

        let (index, term) = candidate;
        if self.advance_commit_to(index) {
            self.emit_raft(
                term,
                RaftKind::CommitAdvanced {
                    index: index.as_u64(),
                },
            );
            true
        } else {
            false
        }
    }

    /// Raises the commit index to `index` (never lowers it).
    fn advance_commit_to(&self, index: LogIndex) -> bool {
        let advanced = {
            let mut volatile = self.volatile.write();
            if index > volatile.commit_index {
                volatile.commit_index = index;
                true
            } else {
                false
            }
        };
        if advanced {
            self.commit_tx.send_replace(index);
        }
        advanced
    }

    // ---------------------------------------------------------------------
    // Apply hand-off
    // ---------------------------------------------------------------------

    pub(crate) async fn lock_state_machine(
        &self,
    ) -> tokio::sync::MutexGuard<'_, Box<dyn StateMachine>> {
        self.state_machine.lock().await
    }

    /// Records that `entry` was applied and hands its result to the submitter.
    pub(crate) fn finish_apply(&self, entry: &LogEntry, result: Result<Bytes>) {
        self.volatile.write().last_applied = entry.index;
        self.applied_tx.send_replace(entry.index);

        let waiter = self.waiters.lock().remove(&entry.index);
        if let Some(w) = waiter {
            let outcome = if w.term == entry.term {
                result
            } else {
                Err(RaftError::NotLeader {
                    leader: self.leader(),
                })
            };
            let _ = w.tx.send(outcome);
        }
    }

    /// Fails every submitter waiting on an index >= `from`.
    fn fail_waiters_from(&self, from: LogIndex, leader: Option<NodeId>) {
        let failed = self.waiters.lock().split_off(&from);
        for (_, w) in failed {
            let _ = w.tx.send(Err(RaftError::NotLeader {
                leader: leader.clone(),
            }));
        }
    }

    /// Fails every pending submitter with `Shutdown`.
    pub(crate) fn fail_all_waiters(&self) {
        let all = std::mem::take(&mut *self.waiters.lock());
        for (_, w) in all {
            let _ = w.tx.send(Err(RaftError::Shutdown));
        }
    }

    #[cfg(test)]
    pub(crate) async fn set_term_for_test(&self, term: Term) {
        self.persist(HardState {
            current_term: term,
            voted_for: None,
        })
        .await
        .unwrap();
    }
}
