//! Persistent term and vote.
//!
//! Layout of the `hard_state` file:
//! ```text
//! [u32 LE payload_len][bincode HardState][u32 LE crc32c(payload)]
//! ```
//! Writes go to a temp file that is fsync'd and renamed over the old one, so
//! a crash leaves either the previous or the new state, never a mix.

use crate::error::Result;
use crate::types::{NodeId, Term};
use serde::{Deserialize, Serialize};
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const FILE_NAME: &str = "hard_state";
const TMP_NAME: &str = "hard_state.tmp";

/// State that must be durable before a node replies to any RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Stores [`HardState`] in a single checksummed file.
#[derive(Debug, Clone)]
pub struct HardStateStore {
    dir: PathBuf,
}

impl HardStateStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        // Leftover from a crash mid-save; the real file is still intact.
        let _ = tokio::fs::remove_file(dir.join(TMP_NAME)).await;
        Ok(Self { dir })
    }

    fn path(&self) -> PathBuf {
        self.dir.join(FILE_NAME)
    }

    /// Loads the stored state. A missing file means a fresh node (term 0, no vote).
    ///
    /// A checksum mismatch is an error: the node must not forget a vote.
    pub async fn load(&self) -> Result<HardState> {
        let data = match tokio::fs::read(self.path()).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HardState::default()),
            Err(e) => return Err(e.into()),
        };
        decode(&data).map_err(|reason| {
            IoError::new(
                ErrorKind::InvalidData,
                format!("{}: {}", self.path().display(), reason),
            )
            .into()
        })
    }

    /// Durably replaces the stored state.
    pub async fn save(&self, state: &HardState) -> Result<()> {
        let payload = bincode::serialize(state)?;
        let mut buf = Vec::with_capacity(payload.len() + 8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());

        let tmp = self.dir.join(TMP_NAME);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, self.path()).await?;
        sync_dir(&self.dir).await?;

        tracing::trace!(term = %state.current_term, voted_for = ?state.voted_for, "Persisted hard state");
        Ok(())
    }
}

fn decode(data: &[u8]) -> std::result::Result<HardState, String> {
    if data.len() < 8 {
        return Err(format!("file too short ({} bytes)", data.len()));
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() != len + 8 {
        return Err(format!("length mismatch: header {}, file {}", len, data.len()));
    }
    let payload = &data[4..4 + len];
    let tail = &data[4 + len..];
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    let actual = crc32c::crc32c(payload);
    if stored != actual {
        return Err(format!(
            "checksum mismatch: stored {:08x}, computed {:08x}",
            stored, actual
        ));
    }
    bincode::deserialize(payload).map_err(|e| e.to_string())
}

#[cfg(unix)]
pub(crate) async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
pub(crate) async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_fresh_state() {
        let dir = TempDir::new().unwrap();
        let store = HardStateStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), HardState::default());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let state = HardState {
            current_term: Term(7),
            voted_for: Some(NodeId::new("n2")),
        };
        {
            let store = HardStateStore::open(dir.path()).await.unwrap();
            store.save(&state).await.unwrap();
        }

        let store = HardStateStore::open(dir.path()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), state);
        assert!(!dir.path().join(TMP_NAME).exists());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_latest() {
        let dir = TempDir::new().unwrap();
        let store = HardStateStore::open(dir.path()).await.unwrap();
        for t in 1..=5 {
            store
                .save(&HardState {
                    current_term: Term(t),
                    voted_for: None,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.load().await.unwrap().current_term, Term(5));
    }

    #[tokio::test]
    async fn test_corruption_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = HardStateStore::open(dir.path()).await.unwrap();
        store
            .save(&HardState {
                current_term: Term(3),
                voted_for: Some(NodeId::new("n1")),
            })
            .await
            .unwrap();

        let path = dir.path().join(FILE_NAME);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[5] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(FILE_NAME), [1u8, 2, 3]).unwrap();
        let store = HardStateStore::open(dir.path()).await.unwrap();
        assert!(store.load().await.is_err());
    }
}
