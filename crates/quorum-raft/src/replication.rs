//! Log replication for Raft.
//!
//! - Leader sends AppendEntries RPCs to replicate log entries
//! - AppendEntries also serves as heartbeat (prevents elections)
//! - Leader tracks next_index and match_index for each follower
//! - Followers whose next entry was compacted receive the latest snapshot
//! - Committed entries are applied to the state machine in index order
//!
//! Each peer gets its own task, woken by the heartbeat tick and by every
//! leader append, so a slow or unreachable follower never delays the others.

use crate::error::{RaftError, Result};
use crate::snapshot::Snapshot;
use crate::state::{Backoff, RaftState};
use crate::transport::RaftTransport;
use crate::types::*;
use quorum_observe::{obs_count, SnapEvt, SnapKind, VizEvent};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Outcome of one replication round to a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Not leader anymore; nothing was sent.
    Idle,
    /// Follower holds everything the leader had when the round started.
    CaughtUp,
    /// Follower is still behind; send another round right away.
    More,
    /// Peer is unreachable and in backoff.
    Backoff,
}

/// Replicate to a single follower.
///
/// Sends one AppendEntries RPC with entries starting from
/// `next_index[follower]`, or the latest snapshot if those entries were
/// compacted. Updates next_index and match_index based on the response and
/// advances the commit index on success.
pub async fn replicate_to_follower(
    state: &Arc<RaftState>,
    follower: &NodeId,
    transport: &Arc<dyn RaftTransport>,
) -> Result<Progress> {
    let (term, next_idx) = {
        let volatile = state.volatile_state().read();
        let Some(leader_state) = volatile.leader_state.as_ref() else {
            return Ok(Progress::Idle);
        };
        if let Some(backoff) = leader_state.backoff.get(follower) {
            if Instant::now() < backoff.retry_at {
                return Ok(Progress::Backoff);
            }
        }
        let next_idx = leader_state
            .next_index
            .get(follower)
            .copied()
            .unwrap_or(LogIndex(1));
        (leader_state.term, next_idx)
    };

    let log = state.log_ref();
    let (base_index, _) = log.snapshot_base();
    if next_idx <= base_index {
        return send_snapshot(state, follower, transport, term).await;
    }

    // Get prev_log info for consistency check
    let prev_log_index = next_idx.prev().unwrap_or(LogIndex::ZERO);
    let Some(prev_log_term) = log.term_at(prev_log_index) else {
        // Compacted since the check above, or next_index ran past our end.
        let last = log.last_index();
        if let Some(ls) = state.volatile_state().write().leader_state.as_mut() {
            if next_idx > last.next() {
                ls.next_index.insert(follower.clone(), last.next());
            }
        }
        return Ok(Progress::More);
    };

    let entries = log.read_batch(
        next_idx,
        state.config().max_entries_per_append,
        state.config().max_append_bytes,
    );
    let sent_through = entries.last().map(|e| e.index).unwrap_or(prev_log_index);

    let request = AppendEntriesRequest {
        term,
        leader_id: state.node_id().clone(),
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit: state.commit_index(),
    };

    let response = match timeout(
        state.config().rpc_timeout,
        transport.append_entries(follower, request),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::debug!(follower = %follower, error = %e, "AppendEntries failed");
            record_backoff(state, follower, term);
            return Ok(Progress::Backoff);
        }
        Err(_) => {
            tracing::debug!(follower = %follower, "AppendEntries timed out");
            record_backoff(state, follower, term);
            return Ok(Progress::Backoff);
        }
    };

    if response.term > term {
        state.observe_term(response.term).await?;
        return Ok(Progress::Idle);
    }

    let caught_up = {
        let mut volatile = state.volatile_state().write();
        let Some(leader_state) = volatile.leader_state.as_mut().filter(|ls| ls.term == term)
        else {
            return Ok(Progress::Idle);
        };
        leader_state
            .last_contact
            .insert(follower.clone(), Instant::now());
        leader_state.backoff.remove(follower);

        if response.success {
            let matched = leader_state
                .match_index
                .entry(follower.clone())
                .or_insert(LogIndex::ZERO);
            *matched = (*matched).max(sent_through);
            let matched = *matched;
            leader_state
                .next_index
                .insert(follower.clone(), matched.next());
            Some(matched)
        } else {
            // Skip back past the conflicting term in one step.
            let hint = response.conflict_index.unwrap_or(prev_log_index);
            let new_next = hint.min(prev_log_index).max(LogIndex(1));
            tracing::debug!(
                follower = %follower,
                rejected = %next_idx,
                retry_from = %new_next,
                "Follower rejected AppendEntries"
            );
            leader_state.next_index.insert(follower.clone(), new_next);
            None
        }
    };

    match caught_up {
        Some(matched) => {
            state.advance_commit_index();
            if matched < log.last_index() {
                Ok(Progress::More)
            } else {
                Ok(Progress::CaughtUp)
            }
        }
        None => Ok(Progress::More),
    }
}

/// Streams the latest snapshot to a follower in chunks.
async fn send_snapshot(
    state: &Arc<RaftState>,
    follower: &NodeId,
    transport: &Arc<dyn RaftTransport>,
    term: Term,
) -> Result<Progress> {
    let Some((snapshot, raw)) = state.snapshots().load_latest_raw().await? else {
        return Err(RaftError::SnapshotFailed {
            reason: format!(
                "follower {} needs compacted entries but no snapshot is stored",
                follower
            ),
        });
    };
    let index = snapshot.index();
    let chunk_size = state.config().snapshot_chunk_size;

    tracing::info!(
        follower = %follower,
        index = %index,
        bytes = raw.len(),
        "Sending snapshot to follower"
    );

    let mut offset = 0usize;
    loop {
        let end = (offset + chunk_size).min(raw.len());
        let done = end == raw.len();
        let request = InstallSnapshotRequest {
            term,
            leader_id: state.node_id().clone(),
            last_included_index: index,
            last_included_term: snapshot.term(),
            offset: offset as u64,
            data: raw.slice(offset..end),
            done,
        };

        let response = match timeout(
            state.config().rpc_timeout,
            transport.install_snapshot(follower, request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::debug!(follower = %follower, error = %e, "InstallSnapshot failed");
                record_backoff(state, follower, term);
                return Ok(Progress::Backoff);
            }
            Err(_) => {
                tracing::debug!(follower = %follower, "InstallSnapshot timed out");
                record_backoff(state, follower, term);
                return Ok(Progress::Backoff);
            }
        };

        if response.term > term {
            state.observe_term(response.term).await?;
            return Ok(Progress::Idle);
        }
        mark_contact(state, follower, term);

        if response.bytes_stored != end as u64 {
            tracing::warn!(
                follower = %follower,
                expected = end,
                stored = response.bytes_stored,
                "Follower lost snapshot transfer position; restarting later"
            );
            record_backoff(state, follower, term);
            return Ok(Progress::Backoff);
        }

        if done {
            break;
        }
        offset = end;
    }

    {
        let mut volatile = state.volatile_state().write();
        if let Some(ls) = volatile.leader_state.as_mut().filter(|ls| ls.term == term) {
            let matched = ls
                .match_index
                .entry(follower.clone())
                .or_insert(LogIndex::ZERO);
            *matched = (*matched).max(index);
            ls.next_index.insert(follower.clone(), index.next());
        }
    }
    state.advance_commit_index();
    tracing::info!(follower = %follower, index = %index, "Follower installed snapshot");
    Ok(Progress::More)
}

fn mark_contact(state: &RaftState, follower: &NodeId, term: Term) {
    let mut volatile = state.volatile_state().write();
    if let Some(ls) = volatile.leader_state.as_mut().filter(|ls| ls.term == term) {
        ls.last_contact.insert(follower.clone(), Instant::now());
        ls.backoff.remove(follower);
    }
}

/// Doubles the peer's retry delay within the configured bounds.
fn record_backoff(state: &RaftState, follower: &NodeId, term: Term) {
    let config = state.config();
    let mut volatile = state.volatile_state().write();
    if let Some(ls) = volatile.leader_state.as_mut().filter(|ls| ls.term == term) {
        let delay = match ls.backoff.get(follower) {
            Some(b) => (b.delay * 2).min(config.replication_backoff_max),
            None => config.replication_backoff_min,
        };
        ls.backoff.insert(
            follower.clone(),
            Backoff {
                delay,
                retry_at: Instant::now() + delay,
            },
        );
    }
}

/// Replication loop for one follower.
///
/// Runs for the node's lifetime and only sends while this node is leader:
/// a round on every heartbeat tick (empty AppendEntries when the follower is
/// caught up) and immediately whenever the leader appends.
pub async fn peer_loop(
    state: Arc<RaftState>,
    follower: NodeId,
    transport: Arc<dyn RaftTransport>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut log_rx = state.subscribe_last_log();
    let mut ticker = interval(state.config().heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = log_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!(follower = %follower, "Replication loop shutting down");
                break;
            }
        }

        if state.role() != Role::Leader {
            continue;
        }

        loop {
            match replicate_to_follower(&state, &follower, &transport).await {
                Ok(Progress::More) => {
                    if !matches!(shutdown_rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)) {
                        return;
                    }
                }
                Ok(_) => break,
                Err(e) => {
                    tracing::warn!(follower = %follower, error = %e, "Replication round failed");
                    break;
                }
            }
        }
    }
}

/// Apply loop - applies committed entries to the state machine.
///
/// Woken by every commit index change. After each pass it checks the
/// snapshot triggers.
pub async fn apply_loop(state: Arc<RaftState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut commit_rx = state.subscribe_commit();

    loop {
        if state.is_healthy() {
            match apply_committed(&state).await {
                Ok(_) => {
                    if let Err(e) = maybe_snapshot(&state, false).await {
                        tracing::error!(error = %e, "Snapshot failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "Apply failed"),
            }
        }

        tokio::select! {
            changed = commit_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Apply loop shutting down");
                break;
            }
        }
    }
}

/// Applies every committed entry not yet applied, in batches.
///
/// Returns the number of entries applied.
pub async fn apply_committed(state: &RaftState) -> Result<usize> {
    let batch = state.config().apply_batch_size;
    let mut applied = 0;

    loop {
        let mut sm = state.lock_state_machine().await;
        let last_applied = state.last_applied();
        let commit_index = state.commit_index();
        if commit_index <= last_applied {
            return Ok(applied);
        }

        let entries = state.log_ref().read_from(last_applied.next(), batch);
        if entries.first().map(|e| e.index) != Some(last_applied.next()) {
            return Err(RaftError::Internal {
                reason: format!(
                    "committed entry {} missing from the log (commit {})",
                    last_applied.next(),
                    commit_index
                ),
            });
        }

        let mut batch_applied = 0u64;
        for entry in entries.into_iter().take_while(|e| e.index <= commit_index) {
            let result = sm.apply(entry.index, &entry.command);
            if let Err(e) = &result {
                state.mark_failed(format!("state machine failed at {}: {}", entry.index, e));
                return Err(RaftError::Internal {
                    reason: format!("apply of entry {} failed", entry.index),
                });
            }
            state.finish_apply(&entry, result);
            applied += 1;
            batch_applied += 1;
        }
        obs_count!(state.meter(), "raft_entries_applied_total", &[], batch_applied);
    }
}

/// Takes a snapshot if a trigger fired (or `force`), then compacts the log.
///
/// Holds the state machine lock throughout so the captured state and its
/// applied index agree. Returns the snapshot index if one was taken.
pub async fn maybe_snapshot(state: &RaftState, force: bool) -> Result<Option<LogIndex>> {
    let config = state.config();
    let log = state.log_ref();

    let sm = state.lock_state_machine().await;
    let applied = state.last_applied();
    let (base, _) = log.snapshot_base();
    if applied <= base {
        return Ok(None);
    }
    if !force {
        let since = applied.as_u64() - base.as_u64();
        if since < config.snapshot_entry_count
            && log.retained_bytes() < config.snapshot_log_size_bytes
        {
            return Ok(None);
        }
    }

    let term = log.term_at(applied).ok_or_else(|| RaftError::Internal {
        reason: format!("applied entry {} missing from the log", applied),
    })?;

    let node = state.node_id().tag();
    state.meter().emit(VizEvent::Snapshot(SnapEvt {
        node,
        index: applied.as_u64(),
        kind: SnapKind::Start,
    }));

    let snapshot = Snapshot::new(applied, term, state.membership().clone(), sm.snapshot()?);
    let bytes = state.snapshots().save(&snapshot).await?;
    log.truncate_prefix(applied).await?;
    drop(sm);

    state.meter().emit(VizEvent::Snapshot(SnapEvt {
        node,
        index: applied.as_u64(),
        kind: SnapKind::Done { bytes },
    }));
    tracing::info!(
        node = %state.node_id(),
        index = %applied,
        term = %term,
        bytes,
        "Created snapshot and compacted log"
    );
    Ok(Some(applied))
}
