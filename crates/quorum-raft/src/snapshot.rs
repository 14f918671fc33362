//! Snapshots: the state machine trait, the on-disk container and the store.
//!
//! Container layout:
//! ```text
//! [magic "QKVSNAP"][version: u8][meta_len: u32 LE][bincode SnapshotMetadata]
//! [data_len: u64 LE][data][crc32c: u32 LE over everything before]
//! ```
//! The encoded container is also what InstallSnapshot streams to followers,
//! so the receiver verifies the checksum before restoring anything.

use crate::error::{RaftError, Result};
use crate::types::{ClusterMembership, LogIndex, Term};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

const MAGIC: &[u8; 7] = b"QKVSNAP";
const VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

/// A replicated state machine.
///
/// Must be deterministic: the same command sequence yields the same state and
/// the same results on every replica.
pub trait StateMachine: Send + Sync {
    /// Apply a committed command at `index` and return its result.
    ///
    /// Entries at or below [`StateMachine::last_applied`] must be ignored.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Bytes>;

    /// Serialize the full state (including the applied index).
    fn snapshot(&self) -> Result<Bytes>;

    /// Replace the full state with a serialized snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> Result<()>;

    /// Highest index applied so far.
    fn last_applied(&self) -> LogIndex;
}

/// Snapshot metadata (describes snapshot contents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Last log index included in snapshot
    pub last_included_index: LogIndex,

    /// Term of last_included_index
    pub last_included_term: Term,

    /// Membership at snapshot time
    pub membership: ClusterMembership,

    /// Creation timestamp (Unix milliseconds)
    pub created_at_ms: u64,
}

/// State machine contents at a log index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Bytes,
}

impl Snapshot {
    pub fn new(
        last_included_index: LogIndex,
        last_included_term: Term,
        membership: ClusterMembership,
        data: Bytes,
    ) -> Self {
        let created_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            metadata: SnapshotMetadata {
                last_included_index,
                last_included_term,
                membership,
                created_at_ms,
            },
            data,
        }
    }

    pub fn index(&self) -> LogIndex {
        self.metadata.last_included_index
    }

    pub fn term(&self) -> Term {
        self.metadata.last_included_term
    }

    /// Encode into the versioned, checksummed container.
    pub fn encode(&self) -> Result<Bytes> {
        let meta = bincode::serialize(&self.metadata)?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + meta.len() + 8 + self.data.len() + 4);
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u32_le(meta.len() as u32);
        buf.put_slice(&meta);
        buf.put_u64_le(self.data.len() as u64);
        buf.put_slice(&self.data);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        Ok(buf.freeze())
    }

    /// Decode and verify a container produced by [`Snapshot::encode`].
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let fail = |reason: String| RaftError::SnapshotFailed { reason };

        if raw.len() < HEADER_LEN + 8 + 4 {
            return Err(fail(format!("snapshot too short ({} bytes)", raw.len())));
        }
        if &raw[..MAGIC.len()] != MAGIC {
            return Err(fail("bad snapshot magic".to_string()));
        }
        let version = raw[MAGIC.len()];
        if version != VERSION {
            return Err(fail(format!("unsupported snapshot version {}", version)));
        }

        let (body, tail) = raw.split_at(raw.len() - 4);
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let actual = crc32c::crc32c(body);
        if stored != actual {
            return Err(fail(format!(
                "snapshot checksum mismatch: stored {:08x}, computed {:08x}",
                stored, actual
            )));
        }

        let mut at = MAGIC.len() + 1;
        let meta_len = u32::from_le_bytes(read_array(body, at)?) as usize;
        at += 4;
        let meta_bytes = body
            .get(at..at + meta_len)
            .ok_or_else(|| fail("truncated snapshot metadata".to_string()))?;
        let metadata: SnapshotMetadata = bincode::deserialize(meta_bytes)?;
        at += meta_len;

        let data_len = u64::from_le_bytes(read_array(body, at)?) as usize;
        at += 8;
        if body.len() != at + data_len {
            return Err(fail(format!(
                "snapshot data length {} does not match container ({} bytes left)",
                data_len,
                body.len().saturating_sub(at)
            )));
        }

        Ok(Self {
            metadata,
            data: Bytes::copy_from_slice(&body[at..]),
        })
    }
}

fn read_array<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N]> {
    buf.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| RaftError::SnapshotFailed {
            reason: format!("truncated snapshot header at offset {}", at),
        })
}

/// Snapshot files in one directory, newest by `(index, term)` wins.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    /// Opens (creating if needed) a snapshot directory keeping `retain` files.
    pub async fn open(dir: impl Into<PathBuf>, retain: usize) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(index: LogIndex, term: Term) -> String {
        format!("snapshot-{:020}-{:020}.snap", index.0, term.0)
    }

    /// Durably writes `snapshot`, then prunes older files.
    ///
    /// Returns the encoded size in bytes.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<u64> {
        let raw = snapshot.encode()?;
        let name = Self::file_name(snapshot.index(), snapshot.term());
        let tmp = self.dir.join(format!("{}.tmp", name));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&raw).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.dir.join(&name)).await?;
        crate::hard_state::sync_dir(&self.dir).await?;

        tracing::info!(
            index = %snapshot.index(),
            term = %snapshot.term(),
            bytes = raw.len(),
            "Saved snapshot"
        );

        self.prune().await?;
        Ok(raw.len() as u64)
    }

    /// Newest snapshot that decodes cleanly.
    ///
    /// Corrupt files are skipped with a warning; the log still holds the data
    /// they covered or a newer snapshot supersedes them.
    pub async fn load_latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.load_latest_raw().await?.map(|(snapshot, _)| snapshot))
    }

    /// Like [`SnapshotStore::load_latest`] but also returns the encoded container.
    pub async fn load_latest_raw(&self) -> Result<Option<(Snapshot, Bytes)>> {
        for (_, _, path) in self.list().await?.into_iter().rev() {
            let raw = Bytes::from(tokio::fs::read(&path).await?);
            match Snapshot::decode(&raw) {
                Ok(snapshot) => return Ok(Some((snapshot, raw))),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot");
                }
            }
        }
        Ok(None)
    }

    /// Metadata of the newest valid snapshot.
    pub async fn latest_meta(&self) -> Result<Option<SnapshotMetadata>> {
        Ok(self.load_latest().await?.map(|s| s.metadata))
    }

    /// Snapshot files sorted ascending by `(index, term)`.
    async fn list(&self) -> Result<Vec<(u64, u64, PathBuf)>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some((index, term)) = parse_file_name(&path) {
                out.push((index, term, path));
            }
        }
        out.sort();
        Ok(out)
    }

    async fn prune(&self) -> Result<()> {
        let files = self.list().await?;
        if files.len() <= self.retain {
            return Ok(());
        }
        let excess = files.len() - self.retain;
        for (index, _, path) in files.into_iter().take(excess) {
            tokio::fs::remove_file(&path).await?;
            tracing::debug!(index, path = %path.display(), "Pruned old snapshot");
        }
        Ok(())
    }
}

fn parse_file_name(path: &Path) -> Option<(u64, u64)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_prefix("snapshot-")?.strip_suffix(".snap")?;
    let (index, term) = stem.split_once('-')?;
    Some((index.parse().ok()?, term.parse().ok()?))
}
