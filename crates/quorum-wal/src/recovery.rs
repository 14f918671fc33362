//! WAL recovery with torn-tail truncation and fatal mid-stream corruption.
//!
//! Recovery scans every segment in id order and validates each record:
//! - a partial record or partial batch at the end of the last segment is a
//!   torn write and is truncated away (temp file + fsync + rename). A batch
//!   with any missing or damaged record is dropped whole;
//! - a checksum failure at the end of the last segment, with nothing valid
//!   after it, is also treated as a torn write;
//! - any other damage is reported as [`SegmentError::Corruption`] and the
//!   directory is left untouched.

use crate::record::{BatchHeader, Record, RecordError};
use crate::segment::{list_segment_ids, segment_path, sync_dir, Position, SegmentError};
use quorum_observe::{Meter, VizEvent, WalEvt, WalKind};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Result of WAL recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// Total number of valid records recovered.
    pub valid_records: u64,
    /// Number of segments scanned.
    pub segments_scanned: u64,
    /// Bytes removed from the tail of the last segment.
    pub bytes_truncated: u64,
    /// Position just past the last valid record.
    pub last_valid_position: Option<Position>,
    /// Whether a torn tail was found and truncated.
    pub corruption_detected: bool,
}

/// Recovers WAL segments from a directory.
pub async fn recover(
    wal_dir: &Path,
    meter: Arc<dyn Meter>,
    node_id: u32,
) -> Result<RecoveryInfo, SegmentError> {
    let segments = list_segment_ids(wal_dir).await?;
    let last = segments.last().copied();

    let mut info = RecoveryInfo::default();

    for segment_id in segments {
        let is_last = Some(segment_id) == last;
        let seg = recover_segment(wal_dir, segment_id, is_last, meter.clone(), node_id).await?;

        info.valid_records += seg.valid_records;
        info.segments_scanned += 1;
        info.bytes_truncated += seg.bytes_truncated;

        if seg.bytes_truncated > 0 {
            info.corruption_detected = true;
        }

        if seg.valid_records > 0 {
            info.last_valid_position = Some(Position {
                segment_id,
                offset: seg.valid_len,
            });
        }
    }

    if info.corruption_detected {
        tracing::warn!(
            dir = %wal_dir.display(),
            bytes_truncated = info.bytes_truncated,
            "Discarded torn tail of WAL"
        );
    }

    Ok(info)
}

struct SegmentRecoveryInfo {
    valid_records: u64,
    valid_len: u64,
    bytes_truncated: u64,
}

async fn recover_segment(
    wal_dir: &Path,
    segment_id: u64,
    is_last: bool,
    meter: Arc<dyn Meter>,
    node_id: u32,
) -> Result<SegmentRecoveryInfo, SegmentError> {
    let path = segment_path(wal_dir, segment_id);
    let buffer = tokio::fs::read(&path).await?;

    let scan = scan_valid_records(&buffer);

    if let Some(damage) = scan.damage {
        let torn_tail = is_last && damage.may_be_torn_tail(&buffer);
        if !torn_tail {
            return Err(SegmentError::Corruption {
                segment: segment_id,
                offset: damage.offset,
                reason: damage.reason,
            });
        }

        truncate_segment_atomically(&path, &buffer, scan.valid_len).await?;
        sync_dir(wal_dir).await?;

        meter.emit(VizEvent::Wal(WalEvt {
            node: node_id,
            seg: segment_id,
            kind: WalKind::CorruptionTruncated,
        }));
    }

    Ok(SegmentRecoveryInfo {
        valid_records: scan.valid_records,
        valid_len: scan.valid_len,
        bytes_truncated: buffer.len() as u64 - scan.valid_len,
    })
}

struct Scan {
    valid_records: u64,
    valid_len: u64,
    damage: Option<Damage>,
}

struct Damage {
    offset: u64,
    reason: String,
    /// Byte offset just past the damaged record, when its framing was readable.
    next: Option<usize>,
    incomplete: bool,
}

impl Damage {
    /// A crash mid-append leaves either a short record or a full-length record
    /// whose bytes never reached disk. In both cases no valid record follows.
    fn may_be_torn_tail(&self, buffer: &[u8]) -> bool {
        if self.incomplete {
            return true;
        }
        let rest = match self.next {
            Some(next) if next <= buffer.len() => &buffer[next..],
            _ => &buffer[self.offset as usize..],
        };
        !contains_valid_record(rest)
    }
}

/// How far past unreadable framing recovery searches byte by byte for an
/// intact record before accepting the damage as a torn tail.
const RESYNC_WINDOW: usize = 32 * 1024;

fn scan_valid_records(buffer: &[u8]) -> Scan {
    let mut offset = 0usize;
    let mut valid_records = 0u64;

    while offset < buffer.len() {
        let step = if BatchHeader::starts(&buffer[offset..]) {
            decode_batch(&buffer[offset..])
        } else {
            Record::decode(&buffer[offset..]).map(|(_, size)| (1, size))
        };

        match step {
            Ok((records, size)) => {
                valid_records += records;
                offset += size;
            }
            Err(e) => {
                let incomplete = matches!(e, RecordError::Incomplete);
                let next = framed_len(&buffer[offset..]).ok().map(|n| offset + n);
                return Scan {
                    valid_records,
                    valid_len: offset as u64,
                    damage: Some(Damage {
                        offset: offset as u64,
                        reason: e.to_string(),
                        next,
                        incomplete,
                    }),
                };
            }
        }
    }

    Scan {
        valid_records,
        valid_len: offset as u64,
        damage: None,
    }
}

/// Validates a whole batch: header, then exactly `count` records filling `len`
/// bytes. Returns the record count and the bytes the batch occupies.
fn decode_batch(data: &[u8]) -> Result<(u64, usize), RecordError> {
    let (header, header_len) = BatchHeader::decode(data)?;
    let len = usize::try_from(header.len).map_err(|_| RecordError::Incomplete)?;
    let end = header_len
        .checked_add(len)
        .ok_or(RecordError::Incomplete)?;
    if data.len() < end {
        return Err(RecordError::Incomplete);
    }

    let mut body = &data[header_len..end];
    let mut count = 0u64;
    while !body.is_empty() {
        let (_, size) = Record::decode(body).map_err(|e| match e {
            // A record cut by the declared length means the header lied.
            RecordError::Incomplete => RecordError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "batch length splits a record",
            )),
            other => other,
        })?;
        body = &body[size..];
        count += 1;
    }

    if count != header.count {
        return Err(RecordError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("batch declares {} records, holds {}", header.count, count),
        )));
    }
    Ok((count, end))
}

/// Bytes the frame at the start of `data` declares, batch body included.
fn framed_len(data: &[u8]) -> Result<usize, RecordError> {
    if BatchHeader::starts(data) {
        let (header, header_len) = BatchHeader::decode(data)?;
        let len = usize::try_from(header.len).map_err(|_| RecordError::Incomplete)?;
        header_len.checked_add(len).ok_or(RecordError::Incomplete)
    } else {
        Record::framed_len(data)
    }
}

/// Whether any intact record follows a damaged one.
///
/// Walks the frame boundaries that are still readable, then falls back to a
/// byte-wise search bounded by [`RESYNC_WINDOW`].
fn contains_valid_record(data: &[u8]) -> bool {
    if follows_readable_frames(data) {
        return true;
    }
    let window = data.len().min(RESYNC_WINDOW);
    (0..window).any(|start| data[start] != 0 && is_intact_frame(&data[start..]))
}

fn follows_readable_frames(mut data: &[u8]) -> bool {
    while !data.is_empty() {
        if is_intact_frame(data) {
            return true;
        }
        match framed_len(data) {
            Ok(n) if n > 0 && n <= data.len() => data = &data[n..],
            _ => return false,
        }
    }
    false
}

fn is_intact_frame(data: &[u8]) -> bool {
    if BatchHeader::starts(data) {
        BatchHeader::decode(data).is_ok()
    } else {
        Record::decode(data).is_ok()
    }
}

/// Atomically truncates a segment file using temp file + rename.
async fn truncate_segment_atomically(
    path: &Path,
    buffer: &[u8],
    valid_len: u64,
) -> Result<(), SegmentError> {
    let temp_path = path.with_extension("wal.tmp");

    let mut temp_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)
        .await?;

    temp_file.write_all(&buffer[..valid_len as usize]).await?;
    temp_file.sync_all().await?;
    drop(temp_file);

    tokio::fs::rename(&temp_path, path).await?;

    Ok(())
}
