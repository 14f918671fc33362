//! WAL segment file management with size-based rotation.
//!
//! Segments are numbered sequentially (000000.wal, 000001.wal, ...) and rotated
//! when the next batch would push the active segment past `max_segment_size`.

use crate::record::{BatchHeader, Record, RecordError};
use bytes::BytesMut;
use quorum_observe::{Meter, VizEvent, WalEvt, WalKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024; // 64 MiB

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Record error: {0}")]
    Record(#[from] RecordError),
    #[error("Segment not found: {0}")]
    NotFound(u64),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A damaged record that is not a torn tail. Never repaired automatically.
    #[error("Corrupt WAL segment {segment:06}.wal at offset {offset}: {reason}")]
    Corruption {
        segment: u64,
        offset: u64,
        reason: String,
    },
}

/// Position in the WAL (segment ID + byte offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub segment_id: u64,
    pub offset: u64,
}

/// Fsync policy applied after each append call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// fsync after every append call. Required for the Raft log.
    #[default]
    Always,
    /// Leave flushing to the OS. Only suitable for tests.
    Os,
}

/// Configuration for segment behavior.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Maximum size of a segment in bytes before rotation.
    pub max_segment_size: u64,
    /// Directory to store segment files.
    pub dir: PathBuf,
    /// Fsync policy for durability.
    pub fsync_policy: FsyncPolicy,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_segment_size: DEFAULT_SEGMENT_SIZE,
            dir: PathBuf::from("wal"),
            fsync_policy: FsyncPolicy::default(),
        }
    }
}

/// A single WAL segment file.
struct SegmentFile {
    id: u64,
    file: File,
    size: u64,
}

impl SegmentFile {
    /// Opens an existing segment for appending, or creates it.
    async fn open(dir: &Path, id: u64) -> Result<Self, SegmentError> {
        let path = segment_path(dir, id);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(&path)
            .await?;

        let size = file.metadata().await?.len();
        if size > 0 {
            file.seek(std::io::SeekFrom::End(0)).await?;
        }

        Ok(Self { id, file, size })
    }

    /// Writes pre-encoded records in one call and returns the starting offset.
    async fn write_encoded(&mut self, encoded: &[u8]) -> Result<u64, SegmentError> {
        let offset = self.size;
        self.file.write_all(encoded).await?;
        self.size += encoded.len() as u64;
        Ok(offset)
    }

    fn would_exceed(&self, bytes: usize, max_size: u64) -> bool {
        self.size > 0 && self.size + bytes as u64 > max_size
    }

    async fn flush(&mut self) -> Result<(), SegmentError> {
        self.file.flush().await?;
        Ok(())
    }

    async fn sync(&mut self) -> Result<(), SegmentError> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    /// Truncates to the written size and syncs data and metadata.
    async fn finalize(&mut self) -> Result<(), SegmentError> {
        self.file.flush().await?;
        self.file.set_len(self.size).await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

/// Manages WAL segments with automatic rotation.
///
/// All appends go through the `current` lock, which makes this the single
/// writer for the directory.
pub struct SegmentManager {
    config: SegmentConfig,
    current: Mutex<SegmentFile>,
    meter: Arc<dyn Meter>,
    node_id: u32,
}

impl SegmentManager {
    /// Creates a segment manager appending to the highest-numbered segment.
    pub async fn new(
        config: SegmentConfig,
        meter: Arc<dyn Meter>,
        node_id: u32,
    ) -> Result<Self, SegmentError> {
        tokio::fs::create_dir_all(&config.dir).await?;

        let latest_id = list_segment_ids(&config.dir)
            .await?
            .last()
            .copied()
            .unwrap_or(0);
        let segment = SegmentFile::open(&config.dir, latest_id).await?;
        sync_dir(&config.dir).await?;

        Ok(Self {
            config,
            current: Mutex::new(segment),
            meter,
            node_id,
        })
    }

    /// Deletes all segments with an id lower than `position.segment_id`.
    ///
    /// The active segment is never deleted. Returns the number of segments removed.
    pub async fn delete_segments_before(&self, position: Position) -> Result<u64, SegmentError> {
        use quorum_observe::obs_timed;

        obs_timed!(self.meter, "wal_gc_latency_ms", &[], {
            self.delete_segments_before_impl(position).await
        })
    }

    async fn delete_segments_before_impl(&self, position: Position) -> Result<u64, SegmentError> {
        let current_id = self.current.lock().await.id;
        let cutoff = position.segment_id.min(current_id);

        let mut deleted_count = 0u64;
        for id in list_segment_ids(&self.config.dir).await? {
            if id >= cutoff {
                break;
            }
            tokio::fs::remove_file(segment_path(&self.config.dir, id)).await?;
            deleted_count += 1;

            self.meter.emit(VizEvent::Wal(WalEvt {
                node: self.node_id,
                seg: id,
                kind: WalKind::SegmentGc,
            }));
            self.meter
                .counter("wal_segments_deleted_total", &[])
                .inc(1);
        }

        if deleted_count > 0 {
            sync_dir(&self.config.dir).await?;
        }

        let remaining = list_segment_ids(&self.config.dir).await?.len();
        self.meter
            .gauge("wal_segment_count", &[])
            .set(remaining as i64);

        Ok(deleted_count)
    }

    /// Appends a single record. See [`SegmentManager::append_batch`].
    pub async fn append(&self, record: &Record) -> Result<Position, SegmentError> {
        let positions = self.append_batch(std::slice::from_ref(record)).await?;
        Ok(positions[0])
    }

    /// Appends a batch of records with a single write and a single fsync.
    ///
    /// The whole batch lands in one segment; rotation happens before the write
    /// if the batch would not fit. Batches of more than one record are framed
    /// by a [`BatchHeader`], so recovery never keeps a prefix of a batch.
    pub async fn append_batch(&self, records: &[Record]) -> Result<Vec<Position>, SegmentError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut body = BytesMut::new();
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            offsets.push(body.len() as u64);
            record.encode_into(&mut body);
        }

        let buf = if records.len() > 1 {
            let mut framed = BytesMut::with_capacity(body.len() + 24);
            BatchHeader {
                count: records.len() as u64,
                len: body.len() as u64,
            }
            .encode_into(&mut framed);
            let header_len = framed.len() as u64;
            for offset in &mut offsets {
                *offset += header_len;
            }
            framed.extend_from_slice(&body);
            framed
        } else {
            body
        };

        let mut current = self.current.lock().await;

        if current.would_exceed(buf.len(), self.config.max_segment_size) {
            self.rotate(&mut current).await?;
        }

        let base = current.write_encoded(&buf).await?;
        let segment_id = current.id;

        self.apply_fsync_policy(&mut current).await?;

        Ok(offsets
            .into_iter()
            .map(|offset| Position {
                segment_id,
                offset: base + offset,
            })
            .collect())
    }

    /// Flushes userspace buffers to the OS (no fsync).
    pub async fn flush(&self) -> Result<(), SegmentError> {
        self.current.lock().await.flush().await
    }

    /// Syncs the active segment to disk.
    pub async fn sync(&self) -> Result<(), SegmentError> {
        let mut current = self.current.lock().await;
        self.fsync_with_timing(&mut current).await
    }

    async fn rotate(&self, current: &mut SegmentFile) -> Result<(), SegmentError> {
        let old_size = current.size;
        let old_id = current.id;
        current.finalize().await?;

        self.meter.emit(VizEvent::Wal(WalEvt {
            node: self.node_id,
            seg: old_id,
            kind: WalKind::SegmentRoll { bytes: old_size },
        }));

        *current = SegmentFile::open(&self.config.dir, old_id + 1).await?;
        sync_dir(&self.config.dir).await?;

        tracing::debug!(
            segment = old_id + 1,
            previous_bytes = old_size,
            "Rotated WAL segment"
        );

        Ok(())
    }

    async fn apply_fsync_policy(&self, current: &mut SegmentFile) -> Result<(), SegmentError> {
        match self.config.fsync_policy {
            FsyncPolicy::Always => self.fsync_with_timing(current).await,
            FsyncPolicy::Os => current.flush().await,
        }
    }

    async fn fsync_with_timing(&self, current: &mut SegmentFile) -> Result<(), SegmentError> {
        let start = Instant::now();
        current.sync().await?;
        let elapsed_ms = start.elapsed().as_millis() as u32;

        self.meter.emit(VizEvent::Wal(WalEvt {
            node: self.node_id,
            seg: current.id,
            kind: WalKind::Fsync { ms: elapsed_ms },
        }));

        Ok(())
    }

    /// Opens a reader over one segment starting at `position.offset`.
    pub async fn read_from(&self, position: Position) -> Result<SegmentReader, SegmentError> {
        let path = segment_path(&self.config.dir, position.segment_id);
        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SegmentError::NotFound(position.segment_id)
            } else {
                SegmentError::Io(e)
            }
        })?;

        // Only bytes written through this manager are visible for the active segment.
        let logical_end = {
            let current = self.current.lock().await;
            (current.id == position.segment_id).then_some(current.size)
        };

        Ok(SegmentReader {
            file,
            position: position.offset,
            segment_id: position.segment_id,
            logical_end,
            buffer: Vec::new(),
        })
    }

    /// Returns the current write position.
    pub async fn current_position(&self) -> Position {
        let current = self.current.lock().await;
        Position {
            segment_id: current.id,
            offset: current.size,
        }
    }

    /// Ids of every segment file on disk, ascending.
    pub async fn segment_ids(&self) -> Result<Vec<u64>, SegmentError> {
        list_segment_ids(&self.config.dir).await
    }

    /// Finalizes the active segment. Called on close.
    pub async fn finalize_current(&self) -> Result<(), SegmentError> {
        self.current.lock().await.finalize().await
    }
}

/// Sequential reader over the records of one segment.
pub struct SegmentReader {
    file: File,
    position: u64,
    segment_id: u64,
    logical_end: Option<u64>,
    buffer: Vec<u8>,
}

impl SegmentReader {
    const READ_CHUNK: usize = 64 * 1024;

    /// Reads the next record, or `None` at the end of the segment.
    ///
    /// A trailing partial record is reported as the end of the segment; recovery
    /// has already removed torn tails before readers are created.
    pub async fn next_record(&mut self) -> Result<Option<(Record, Position)>, SegmentError> {
        loop {
            if let Some(end) = self.logical_end {
                if self.position >= end {
                    return Ok(None);
                }
            }

            if BatchHeader::starts(&self.buffer) {
                match BatchHeader::decode(&self.buffer) {
                    Ok((_header, size)) => {
                        self.buffer.drain(..size);
                        self.position += size as u64;
                        continue;
                    }
                    Err(RecordError::Incomplete) => {}
                    Err(e) => return Err(SegmentError::Record(e)),
                }
            } else if !self.buffer.is_empty() {
                match Record::decode(&self.buffer) {
                    Ok((record, size)) => {
                        let pos = Position {
                            segment_id: self.segment_id,
                            offset: self.position,
                        };
                        self.buffer.drain(..size);
                        self.position += size as u64;
                        return Ok(Some((record, pos)));
                    }
                    Err(RecordError::Incomplete) => {}
                    Err(e) => return Err(SegmentError::Record(e)),
                }
            }

            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    async fn fill(&mut self) -> Result<bool, SegmentError> {
        let read_at = self.position + self.buffer.len() as u64;
        let mut want = Self::READ_CHUNK;
        if let Some(end) = self.logical_end {
            if read_at >= end {
                return Ok(false);
            }
            want = want.min((end - read_at) as usize);
        }

        self.file.seek(std::io::SeekFrom::Start(read_at)).await?;
        let mut chunk = vec![0u8; want];
        let n = self.file.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(true)
    }
}

/// Generates the path for a segment file.
pub(crate) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.wal", id))
}

/// Lists segment ids in a directory, ascending.
pub(crate) async fn list_segment_ids(dir: &Path) -> Result<Vec<u64>, SegmentError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut ids = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if let Some(id) = parse_segment_id_from_path(&entry.path()) {
            ids.push(id);
        }
    }

    ids.sort_unstable();
    Ok(ids)
}

/// Parses a segment ID from a .wal file path.
fn parse_segment_id_from_path(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != "wal" {
        return None;
    }

    path.file_stem()?.to_str()?.parse::<u64>().ok()
}

/// Makes file creations, renames and removals in `dir` durable.
pub(crate) async fn sync_dir(dir: &Path) -> Result<(), SegmentError> {
    #[cfg(unix)]
    {
        File::open(dir).await?.sync_all().await?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
