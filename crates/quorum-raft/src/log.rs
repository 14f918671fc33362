//! Raft log storage backed by quorum-wal.
//!
//! Provides:
//! - Persistent, fsync'd append of entry batches
//! - An in-memory index of the retained log, rebuilt by replay on startup
//! - Durable suffix truncation (conflict resolution) and prefix truncation
//!   (compaction) through marker records
//! - A snapshot base `(index, term)` so consistency checks still work for the
//!   last compacted entry
//! - Whole-segment garbage collection after compaction

use crate::error::{RaftError, Result};
use crate::types::{LogEntry, LogIndex, Term};
use bytes::Bytes;
use parking_lot::RwLock;
use quorum_observe::{Meter, NoopMeter};
use quorum_wal::{FsyncPolicy, Position, Record, RecoveryInfo, Wal, WalConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// In-memory view of the retained log.
#[derive(Debug, Default)]
struct LogInner {
    entries: BTreeMap<LogIndex, LogEntry>,
    /// Last index covered by a snapshot (entries <= base are gone).
    base_index: LogIndex,
    base_term: Term,
    /// Base inferred during replay from the first retained entry; its term is
    /// unknown until the matching Compact marker is seen.
    base_provisional: bool,
    bytes: u64,
}

impl LogInner {
    fn last_index(&self) -> LogIndex {
        self.entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.base_index)
    }

    fn last_term(&self) -> Term {
        self.entries
            .values()
            .next_back()
            .map(|e| e.term)
            .unwrap_or(self.base_term)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == LogIndex::ZERO {
            return Some(Term::ZERO);
        }
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.entries.get(&index).map(|e| e.term)
    }

    fn insert(&mut self, entry: LogEntry) {
        self.bytes += entry.size_hint();
        if let Some(old) = self.entries.insert(entry.index, entry) {
            self.bytes -= old.size_hint();
        }
    }

    fn drop_from(&mut self, from: LogIndex) {
        let removed = self.entries.split_off(&from);
        self.bytes -= removed.values().map(LogEntry::size_hint).sum::<u64>();
    }

    fn drop_through(&mut self, upto: LogIndex, term: Term) {
        let kept = self.entries.split_off(&upto.next());
        let removed = std::mem::replace(&mut self.entries, kept);
        self.bytes -= removed.values().map(LogEntry::size_hint).sum::<u64>();
        if upto > self.base_index || (upto == self.base_index && self.base_provisional) {
            self.base_index = upto;
            self.base_term = term;
            self.base_provisional = false;
        }
    }
}

/// Raft log backed by quorum-wal.
///
/// All writes go through a single async writer lock, so indexes are assigned
/// and persisted in one order. Readers use the in-memory index, which is only
/// updated after the corresponding WAL batch has been fsync'd; they always
/// observe a durable, consistent prefix.
pub struct RaftLog {
    wal: Wal,
    writer: tokio::sync::Mutex<SegmentIndex>,
    inner: RwLock<LogInner>,
    failure: RwLock<Option<String>>,
}

/// Highest entry index written into each WAL segment (for compaction GC).
#[derive(Debug, Default)]
struct SegmentIndex {
    max_index: BTreeMap<u64, u64>,
}

impl SegmentIndex {
    fn note(&mut self, pos: Position, index: u64) {
        let slot = self.max_index.entry(pos.segment_id).or_insert(0);
        *slot = (*slot).max(index);
    }

    /// First segment that still holds an entry above `upto`.
    fn first_needed(&self, upto: u64, active: u64) -> u64 {
        self.max_index
            .iter()
            .find(|(_, max)| **max > upto)
            .map(|(seg, _)| *seg)
            .unwrap_or(active)
            .min(active)
    }

    fn forget_before(&mut self, segment_id: u64) {
        self.max_index = self.max_index.split_off(&segment_id);
    }
}

impl RaftLog {
    /// Opens a Raft log in `path` with default WAL settings.
    pub async fn open(path: impl Into<PathBuf>) -> Result<(Self, RecoveryInfo)> {
        let config = WalConfig {
            dir: path.into(),
            ..Default::default()
        };
        Self::open_with_config(config, Arc::new(NoopMeter)).await
    }

    /// Opens a Raft log with an explicit WAL configuration.
    ///
    /// Recovery truncates a torn tail; mid-stream corruption aborts with
    /// `RaftError::Storage`.
    pub async fn open_with_config(
        config: WalConfig,
        meter: Arc<dyn Meter>,
    ) -> Result<(Self, RecoveryInfo)> {
        if config.fsync_policy != FsyncPolicy::Always {
            tracing::warn!(
                dir = %config.dir.display(),
                "Raft log opened without fsync on append; durability is not guaranteed"
            );
        }

        let (wal, recovery_info) = Wal::open_with_meter(config, meter).await?;

        let log = Self {
            wal,
            writer: tokio::sync::Mutex::new(SegmentIndex::default()),
            inner: RwLock::new(LogInner::default()),
            failure: RwLock::new(None),
        };

        log.replay().await?;

        tracing::info!(
            first = %log.first_index(),
            last = %log.last_index(),
            base = %log.snapshot_base().0,
            torn_bytes = recovery_info.bytes_truncated,
            "Recovered Raft log"
        );

        Ok((log, recovery_info))
    }

    /// Rebuilds the in-memory index by applying every WAL record in order.
    async fn replay(&self) -> Result<()> {
        let records = self.wal.read_all().await?;
        let mut segments = self.writer.lock().await;
        let mut inner = self.inner.write();

        for (record, pos) in records {
            match record {
                Record::Entry {
                    index,
                    term,
                    command,
                } => {
                    let index = LogIndex(index);
                    let expected = inner.last_index().next();
                    if inner.entries.is_empty() && index > expected {
                        // Earlier segments were collected; a later Compact marker
                        // re-establishes the real base.
                        inner.base_index = LogIndex(index.0 - 1);
                        inner.base_term = Term::ZERO;
                        inner.base_provisional = true;
                    } else if index < expected {
                        inner.drop_from(index);
                    } else if index > expected {
                        return Err(RaftError::Internal {
                            reason: format!(
                                "log gap during replay: expected {}, found {} at segment {} offset {}",
                                expected, index, pos.segment_id, pos.offset
                            ),
                        });
                    }
                    segments.note(pos, index.0);
                    inner.insert(LogEntry::new(Term(term), index, command));
                }
                Record::Truncate { from } => inner.drop_from(LogIndex(from)),
                Record::Compact { upto, term } => inner.drop_through(LogIndex(upto), Term(term)),
            }
        }

        if inner.base_provisional {
            return Err(RaftError::Internal {
                reason: format!(
                    "no compaction marker for log base {} after replay",
                    inner.base_index
                ),
            });
        }
        Ok(())
    }

    fn check_healthy(&self) -> Result<()> {
        match self.failure.read().as_ref() {
            Some(reason) => Err(RaftError::Unhealthy {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Writes records durably, marking the log failed on any storage error.
    async fn write(&self, records: &[Record]) -> Result<Vec<Position>> {
        match self.wal.append_batch(records).await {
            Ok(positions) => Ok(positions),
            Err(e) => {
                tracing::error!(error = %e, "Raft log write failed; refusing further writes");
                *self.failure.write() = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Appends entries that must directly follow the current last index.
    ///
    /// Returns once the whole batch has been fsync'd. Either every entry is
    /// durable and visible, or none is visible.
    pub async fn append(&self, entries: Vec<LogEntry>) -> Result<LogIndex> {
        self.check_healthy()?;
        let mut segments = self.writer.lock().await;

        let Some(first) = entries.first() else {
            return Ok(self.last_index());
        };
        let expected = self.last_index().next();
        if first.index != expected || !is_contiguous(&entries) {
            return Err(RaftError::Internal {
                reason: format!(
                    "non-contiguous append: expected {}, got {}",
                    expected, first.index
                ),
            });
        }

        let records: Vec<Record> = entries
            .iter()
            .map(|e| Record::entry(e.index.0, e.term.0, e.command.clone()))
            .collect();
        let positions = self.write(&records).await?;

        let last = entries.last().map(|e| e.index).unwrap_or(expected);
        for (pos, e) in positions.iter().zip(&entries) {
            segments.note(*pos, e.index.0);
        }
        let mut inner = self.inner.write();
        for entry in entries {
            inner.insert(entry);
        }

        Ok(last)
    }

    /// Appends one command at the next index in `term` (leader path).
    ///
    /// Index assignment and the write happen under the writer lock, so
    /// concurrent callers get distinct, arrival-ordered indexes.
    pub async fn append_command(&self, term: Term, command: Bytes) -> Result<LogIndex> {
        self.check_healthy()?;
        let mut segments = self.writer.lock().await;

        let index = self.last_index().next();
        let positions = self
            .write(&[Record::entry(index.0, term.0, command.clone())])
            .await?;
        segments.note(positions[0], index.0);
        self.inner
            .write()
            .insert(LogEntry::new(term, index, command));

        Ok(index)
    }

    /// Get a log entry by index.
    pub fn get(&self, index: LogIndex) -> Option<LogEntry> {
        self.inner.read().entries.get(&index).cloned()
    }

    /// Entries in `[from_index, to_index)`.
    pub fn get_range(&self, from_index: LogIndex, to_index: LogIndex) -> Vec<LogEntry> {
        if from_index >= to_index {
            return Vec::new();
        }
        self.inner
            .read()
            .entries
            .range(from_index..to_index)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Up to `max` entries starting at `from_index`.
    pub fn read_from(&self, from_index: LogIndex, max: usize) -> Vec<LogEntry> {
        self.inner
            .read()
            .entries
            .range(from_index..)
            .take(max)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Entries from `from_index` on, at most `max_entries` of them and no more
    /// than `max_bytes` by [`LogEntry::size_hint`]. The first entry is always
    /// included so an oversized entry still makes progress.
    pub fn read_batch(&self, from_index: LogIndex, max_entries: usize, max_bytes: u64) -> Vec<LogEntry> {
        let inner = self.inner.read();
        let mut bytes = 0u64;
        let mut batch = Vec::new();
        for entry in inner.entries.range(from_index..).map(|(_, e)| e).take(max_entries) {
            bytes += entry.size_hint();
            if bytes > max_bytes && !batch.is_empty() {
                break;
            }
            batch.push(entry.clone());
        }
        batch
    }

    /// Term of the entry at `index`, including the snapshot base.
    ///
    /// `None` if the index is compacted away (below the base) or past the end.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.inner.read().term_at(index)
    }

    /// Last log index (the snapshot base if no entries are retained).
    pub fn last_index(&self) -> LogIndex {
        self.inner.read().last_index()
    }

    /// Term of the last log entry (the snapshot base term if none are retained).
    pub fn last_term(&self) -> Term {
        self.inner.read().last_term()
    }

    /// `(last_index, last_term)` read under one lock.
    pub fn last_index_and_term(&self) -> (LogIndex, Term) {
        let inner = self.inner.read();
        (inner.last_index(), inner.last_term())
    }

    /// First index still held in the log.
    pub fn first_index(&self) -> LogIndex {
        self.inner.read().base_index.next()
    }

    /// `(last_included_index, last_included_term)` of the compacted prefix.
    pub fn snapshot_base(&self) -> (LogIndex, Term) {
        let inner = self.inner.read();
        (inner.base_index, inner.base_term)
    }

    /// First index of the run of entries sharing `index`'s term.
    pub fn first_index_of_term_at(&self, index: LogIndex) -> LogIndex {
        let inner = self.inner.read();
        let Some(term) = inner.entries.get(&index).map(|e| e.term) else {
            return index;
        };
        inner
            .entries
            .range(..=index)
            .rev()
            .take_while(|(_, e)| e.term == term)
            .last()
            .map(|(i, _)| *i)
            .unwrap_or(index)
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Approximate bytes held by retained entries.
    pub fn retained_bytes(&self) -> u64 {
        self.inner.read().bytes
    }

    /// Durably removes every entry with index >= `from_index`.
    ///
    /// Used to discard a conflicting suffix after a leader change. Refuses to
    /// cut into the snapshot base.
    pub async fn truncate_suffix(&self, from_index: LogIndex) -> Result<()> {
        self.check_healthy()?;
        let _segments = self.writer.lock().await;

        let (base, last) = {
            let inner = self.inner.read();
            (inner.base_index, inner.last_index())
        };
        if from_index <= base {
            return Err(RaftError::LogInconsistency {
                index: from_index,
                expected_term: Term::ZERO,
                actual_term: None,
            });
        }
        if from_index > last {
            return Ok(());
        }

        self.write(&[Record::Truncate { from: from_index.0 }]).await?;
        self.inner.write().drop_from(from_index);

        tracing::debug!(from = %from_index, previous_last = %last, "Truncated log suffix");
        Ok(())
    }

    /// Durably discards every entry with index <= `upto`.
    ///
    /// `upto` must be a retained entry (or the current base). Whole WAL
    /// segments made redundant are deleted.
    pub async fn truncate_prefix(&self, upto: LogIndex) -> Result<()> {
        self.check_healthy()?;
        let mut segments = self.writer.lock().await;

        let term = {
            let inner = self.inner.read();
            if upto <= inner.base_index {
                return Ok(());
            }
            inner.term_at(upto).ok_or_else(|| RaftError::Internal {
                reason: format!("cannot compact through {}: entry not in log", upto),
            })?
        };

        self.write(&[Record::Compact {
            upto: upto.0,
            term: term.0,
        }])
        .await?;
        self.inner.write().drop_through(upto, term);

        self.collect_segments(&mut segments, upto.0).await
    }

    /// Replaces the whole log with an empty log based at `(index, term)`.
    ///
    /// Used when a follower installs a snapshot its log does not already cover.
    pub async fn reset_to(&self, index: LogIndex, term: Term) -> Result<()> {
        self.check_healthy()?;
        let mut segments = self.writer.lock().await;

        self.write(&[
            Record::Compact {
                upto: index.0,
                term: term.0,
            },
            Record::Truncate {
                from: index.0 + 1,
            },
        ])
        .await?;
        {
            let mut inner = self.inner.write();
            inner.drop_from(LogIndex(0));
            inner.base_index = index;
            inner.base_term = term;
            inner.base_provisional = false;
        }

        self.collect_segments(&mut segments, u64::MAX).await
    }

    async fn collect_segments(&self, segments: &mut SegmentIndex, upto: u64) -> Result<()> {
        let active = self.wal.current_position().await.segment_id;
        let keep_from = segments.first_needed(upto, active);
        let deleted = self
            .wal
            .delete_segments_before(Position {
                segment_id: keep_from,
                offset: 0,
            })
            .await?;
        segments.forget_before(keep_from);

        if deleted > 0 {
            tracing::debug!(deleted, keep_from, "Collected WAL segments");
        }
        Ok(())
    }

    /// Reason the log stopped accepting writes, if it did.
    pub fn failure(&self) -> Option<String> {
        self.failure.read().clone()
    }

    /// Sync the log to disk.
    pub async fn sync(&self) -> Result<()> {
        self.wal.sync().await?;
        Ok(())
    }

    /// Flush and finalize the WAL. Further writes are not allowed.
    pub async fn close(&self) -> Result<()> {
        let _segments = self.writer.lock().await;
        self.wal.close().await?;
        *self.failure.write() = Some("log closed".to_string());
        Ok(())
    }
}

fn is_contiguous(entries: &[LogEntry]) -> bool {
    entries.windows(2).all(|w| w[1].index == w[0].index.next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(term: u64, index: u64, cmd: &str) -> LogEntry {
        LogEntry::new(Term(term), LogIndex(index), Bytes::from(cmd.to_string()))
    }

    fn small_segments(dir: &TempDir) -> WalConfig {
        WalConfig {
            dir: dir.path().to_path_buf(),
            max_segment_size: 4096,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();

        assert_eq!(log.last_index(), LogIndex::ZERO);
        assert_eq!(log.last_term(), Term::ZERO);

        let last = log
            .append(vec![entry(1, 1, "a"), entry(1, 2, "b"), entry(2, 3, "c")])
            .await
            .unwrap();

        assert_eq!(last, LogIndex(3));
        assert_eq!(log.get(LogIndex(2)).unwrap().command, Bytes::from("b"));
        assert_eq!(log.last_term(), Term(2));
        assert_eq!(log.get_range(LogIndex(1), LogIndex(3)).len(), 2);
        assert_eq!(log.read_from(LogIndex(2), 10).len(), 2);
    }

    #[tokio::test]
    async fn test_append_rejects_gap() {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();

        assert!(log.append(vec![entry(1, 2, "x")]).await.is_err());
        assert!(log
            .append(vec![entry(1, 1, "x"), entry(1, 3, "y")])
            .await
            .is_err());
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_append_command_assigns_sequential_indexes() {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
        let log = Arc::new(log);

        let mut handles = Vec::new();
        for i in 0..20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append_command(Term(1), Bytes::from(format!("c{}", i)))
                    .await
                    .unwrap()
            }));
        }

        let mut indexes = Vec::new();
        for h in handles {
            indexes.push(h.await.unwrap().0);
        }
        indexes.sort_unstable();
        assert_eq!(indexes, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reopen_replays_entries() {
        let temp_dir = TempDir::new().unwrap();
        {
            let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
            log.append((1..=10).map(|i| entry(1, i, "v")).collect())
                .await
                .unwrap();
        }

        let (log, info) = RaftLog::open(temp_dir.path()).await.unwrap();
        assert_eq!(info.valid_records, 10);
        assert_eq!(log.last_index(), LogIndex(10));
        assert_eq!(log.len(), 10);
    }

    #[tokio::test]
    async fn test_truncate_suffix_is_durable() {
        let temp_dir = TempDir::new().unwrap();
        {
            let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
            log.append((1..=5).map(|i| entry(1, i, "old")).collect())
                .await
                .unwrap();
            log.truncate_suffix(LogIndex(3)).await.unwrap();
            assert_eq!(log.last_index(), LogIndex(2));
            log.append(vec![entry(2, 3, "new")]).await.unwrap();
        }

        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
        assert_eq!(log.last_index(), LogIndex(3));
        assert_eq!(log.get(LogIndex(3)).unwrap().term, Term(2));
        assert!(log.get(LogIndex(4)).is_none());
    }

    #[tokio::test]
    async fn test_truncate_prefix_keeps_base_term() {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
        log.append(vec![entry(1, 1, "a"), entry(2, 2, "b"), entry(3, 3, "c")])
            .await
            .unwrap();

        log.truncate_prefix(LogIndex(2)).await.unwrap();

        assert!(log.get(LogIndex(1)).is_none());
        assert_eq!(log.first_index(), LogIndex(3));
        assert_eq!(log.snapshot_base(), (LogIndex(2), Term(2)));
        assert_eq!(log.term_at(LogIndex(2)), Some(Term(2)));
        assert_eq!(log.term_at(LogIndex(1)), None);
        assert!(log.truncate_suffix(LogIndex(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_compaction_survives_restart_and_collects_segments() {
        let temp_dir = TempDir::new().unwrap();
        let payload = "x".repeat(200);
        {
            let (log, _) = RaftLog::open_with_config(small_segments(&temp_dir), Arc::new(NoopMeter))
                .await
                .unwrap();
            for i in 1..=100 {
                log.append(vec![entry(1, i, &payload)]).await.unwrap();
            }
            let before = std::fs::read_dir(temp_dir.path()).unwrap().count();
            log.truncate_prefix(LogIndex(90)).await.unwrap();
            let after = std::fs::read_dir(temp_dir.path()).unwrap().count();
            assert!(after < before, "expected segment GC ({} -> {})", before, after);
            log.close().await.unwrap();
        }

        let (log, _) = RaftLog::open_with_config(small_segments(&temp_dir), Arc::new(NoopMeter))
            .await
            .unwrap();
        assert_eq!(log.snapshot_base(), (LogIndex(90), Term(1)));
        assert_eq!(log.first_index(), LogIndex(91));
        assert_eq!(log.last_index(), LogIndex(100));
        assert_eq!(log.len(), 10);
    }

    #[tokio::test]
    async fn test_compaction_below_last_index_survives_restart() {
        // Eight entries per 4 KiB segment, so each compaction point below ends
        // a segment and collection leaves the marker after the retained entries.
        let payload = "y".repeat(500);
        for upto in [8u64, 16, 24] {
            let temp_dir = TempDir::new().unwrap();
            {
                let (log, _) =
                    RaftLog::open_with_config(small_segments(&temp_dir), Arc::new(NoopMeter))
                        .await
                        .unwrap();
                for i in 1..=30 {
                    log.append(vec![entry(i / 4 + 1, i, &payload)]).await.unwrap();
                }
                log.truncate_prefix(LogIndex(upto)).await.unwrap();
                log.close().await.unwrap();
            }

            let (log, _) = RaftLog::open_with_config(small_segments(&temp_dir), Arc::new(NoopMeter))
                .await
                .unwrap();
            assert_eq!(
                log.snapshot_base(),
                (LogIndex(upto), Term(upto / 4 + 1)),
                "base after compacting through {}",
                upto
            );
            assert_eq!(log.first_index(), LogIndex(upto + 1));
            assert_eq!(log.last_index(), LogIndex(30));
            assert_eq!(log.len(), (30 - upto) as usize);
            assert_eq!(log.get(LogIndex(30)).unwrap().term, Term(30 / 4 + 1));
        }
    }

    #[tokio::test]
    async fn test_reset_to_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        {
            let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
            log.append((1..=3).map(|i| entry(1, i, "v")).collect())
                .await
                .unwrap();
            log.reset_to(LogIndex(50), Term(4)).await.unwrap();
            assert!(log.is_empty());
            assert_eq!(log.last_index(), LogIndex(50));
            assert_eq!(log.last_term(), Term(4));
            log.append(vec![entry(5, 51, "after")]).await.unwrap();
        }

        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
        assert_eq!(log.snapshot_base(), (LogIndex(50), Term(4)));
        assert_eq!(log.last_index(), LogIndex(51));
        assert!(log.get(LogIndex(3)).is_none());
    }

    #[tokio::test]
    async fn test_read_batch_respects_byte_budget() {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
        let payload = "z".repeat(1000);
        log.append((1..=10).map(|i| entry(1, i, &payload)).collect())
            .await
            .unwrap();
        let per_entry = log.get(LogIndex(1)).unwrap().size_hint();

        let batch = log.read_batch(LogIndex(1), 512, 3 * per_entry);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2].index, LogIndex(3));

        // The count limit still applies under a generous budget.
        assert_eq!(log.read_batch(LogIndex(4), 2, u64::MAX).len(), 2);

        // An entry larger than the budget goes out alone.
        let single = log.read_batch(LogIndex(5), 512, 10);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].index, LogIndex(5));

        assert!(log.read_batch(LogIndex(11), 512, u64::MAX).is_empty());
    }

    #[tokio::test]
    async fn test_first_index_of_term() {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
        log.append(vec![
            entry(1, 1, "a"),
            entry(2, 2, "b"),
            entry(2, 3, "c"),
            entry(2, 4, "d"),
        ])
        .await
        .unwrap();

        assert_eq!(log.first_index_of_term_at(LogIndex(4)), LogIndex(2));
        assert_eq!(log.first_index_of_term_at(LogIndex(1)), LogIndex(1));
    }

    #[tokio::test]
    async fn test_closed_log_refuses_writes() {
        let temp_dir = TempDir::new().unwrap();
        let (log, _) = RaftLog::open(temp_dir.path()).await.unwrap();
        log.close().await.unwrap();

        let err = log.append(vec![entry(1, 1, "a")]).await.unwrap_err();
        assert!(err.is_durability_failure());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Append(u8),
            TruncateSuffix(u8),
            Compact(u8),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (1u8..8).prop_map(Op::Append),
                1 => any::<u8>().prop_map(Op::TruncateSuffix),
                1 => any::<u8>().prop_map(Op::Compact),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            /// Whatever was acknowledged before a crash is exactly what replay returns.
            #[test]
            fn prop_replay_matches_acknowledged_state(ops in prop::collection::vec(op(), 1..30)) {
                let rt = tokio::runtime::Runtime::new().unwrap();
                rt.block_on(async move {
                    let temp_dir = TempDir::new().unwrap();
                    let payload = "p".repeat(300);
                    let mut term = 1u64;
                    let expected = {
                        let (log, _) =
                            RaftLog::open_with_config(small_segments(&temp_dir), Arc::new(NoopMeter))
                                .await
                                .unwrap();
                        for op in ops {
                            match op {
                                Op::Append(n) => {
                                    let start = log.last_index().0 + 1;
                                    let batch = (start..start + n as u64)
                                        .map(|i| entry(term, i, &payload))
                                        .collect();
                                    log.append(batch).await.unwrap();
                                }
                                Op::TruncateSuffix(k) => {
                                    let (first, last) = (log.first_index().0, log.last_index().0);
                                    if last >= first {
                                        let from = first + (k as u64 % (last - first + 1));
                                        log.truncate_suffix(LogIndex(from)).await.unwrap();
                                        term += 1;
                                    }
                                }
                                Op::Compact(k) => {
                                    // Stop short of the last index so retained entries
                                    // precede the marker on disk.
                                    let (first, last) = (log.first_index().0, log.last_index().0);
                                    if last > first {
                                        let upto = first + (k as u64 % (last - first));
                                        log.truncate_prefix(LogIndex(upto)).await.unwrap();
                                    }
                                }
                            }
                        }
                        let snapshot = (
                            log.snapshot_base(),
                            log.read_from(LogIndex(0), usize::MAX),
                        );
                        drop(log);
                        snapshot
                    };

                    let (log, _) = RaftLog::open_with_config(small_segments(&temp_dir), Arc::new(NoopMeter))
                        .await
                        .unwrap();
                    assert_eq!(log.snapshot_base(), expected.0);
                    assert_eq!(log.read_from(LogIndex(0), usize::MAX), expected.1);
                });
            }
        }
    }
}
