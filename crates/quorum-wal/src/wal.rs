//! High-level WAL API.
//!
//! Wraps recovery and the segment manager behind one handle that the Raft log
//! owns exclusively.

use crate::record::Record;
use crate::recovery::{self, RecoveryInfo};
use crate::segment::{FsyncPolicy, Position, SegmentConfig, SegmentError, SegmentManager, SegmentReader};
use quorum_observe::{Meter, NoopMeter};
use std::path::PathBuf;
use std::sync::Arc;

const MIN_SEGMENT_SIZE: u64 = 4 * 1024;

/// Configuration for the WAL.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory to store WAL segments.
    pub dir: PathBuf,
    /// Maximum size of a segment before rotation (default: 64 MiB).
    pub max_segment_size: u64,
    /// Fsync policy (default: `Always`).
    pub fsync_policy: FsyncPolicy,
    /// Node tag for observability events.
    pub node_id: u32,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("wal"),
            max_segment_size: 64 * 1024 * 1024,
            fsync_policy: FsyncPolicy::Always,
            node_id: 0,
        }
    }
}

impl WalConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), SegmentError> {
        if self.max_segment_size < MIN_SEGMENT_SIZE {
            return Err(SegmentError::InvalidConfig(format!(
                "max_segment_size must be at least {} bytes",
                MIN_SEGMENT_SIZE
            )));
        }
        if self.dir.as_os_str().is_empty() {
            return Err(SegmentError::InvalidConfig(
                "dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Write-ahead log with recovery and rotation.
///
/// # Example
///
/// ```no_run
/// use quorum_wal::{Record, Wal, WalConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (wal, _recovery) = Wal::open(WalConfig::default()).await?;
///     wal.append_batch(&[Record::entry(1, 1, b"SET k v".as_slice())]).await?;
///     wal.close().await?;
///     Ok(())
/// }
/// ```
pub struct Wal {
    manager: Arc<SegmentManager>,
    config: WalConfig,
}

impl Wal {
    /// Opens a WAL, performing recovery first.
    ///
    /// Fails with [`SegmentError::Corruption`] if damage other than a torn tail
    /// is found.
    pub async fn open(config: WalConfig) -> Result<(Self, RecoveryInfo), SegmentError> {
        Self::open_with_meter(config, Arc::new(NoopMeter)).await
    }

    /// Opens a WAL with a custom observability meter.
    pub async fn open_with_meter(
        config: WalConfig,
        meter: Arc<dyn Meter>,
    ) -> Result<(Self, RecoveryInfo), SegmentError> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.dir).await?;

        let recovery_info = recovery::recover(&config.dir, meter.clone(), config.node_id).await?;

        let segment_config = SegmentConfig {
            dir: config.dir.clone(),
            max_segment_size: config.max_segment_size,
            fsync_policy: config.fsync_policy,
        };

        let manager = SegmentManager::new(segment_config, meter, config.node_id).await?;

        tracing::debug!(
            dir = %config.dir.display(),
            records = recovery_info.valid_records,
            segments = recovery_info.segments_scanned,
            "Opened WAL"
        );

        Ok((
            Self {
                manager: Arc::new(manager),
                config,
            },
            recovery_info,
        ))
    }

    /// Appends one record.
    pub async fn append(&self, record: &Record) -> Result<Position, SegmentError> {
        self.manager.append(record).await
    }

    /// Appends a batch of records with one write and one fsync.
    ///
    /// When this returns `Ok` under `FsyncPolicy::Always`, every record of the
    /// batch has survived an fsync.
    pub async fn append_batch(&self, records: &[Record]) -> Result<Vec<Position>, SegmentError> {
        self.manager.append_batch(records).await
    }

    /// Flushes buffered data to the OS (no fsync).
    pub async fn flush(&self) -> Result<(), SegmentError> {
        self.manager.flush().await
    }

    /// Syncs all data to disk.
    pub async fn sync(&self) -> Result<(), SegmentError> {
        self.manager.sync().await
    }

    /// Returns the current write position.
    pub async fn current_position(&self) -> Position {
        self.manager.current_position().await
    }

    /// Reads records of one segment starting at `position`.
    pub async fn read_from(&self, position: Position) -> Result<SegmentReader, SegmentError> {
        self.manager.read_from(position).await
    }

    /// Reads every record of every segment in write order.
    pub async fn read_all(&self) -> Result<Vec<(Record, Position)>, SegmentError> {
        let mut out = Vec::new();
        for segment_id in self.manager.segment_ids().await? {
            let mut reader = self
                .manager
                .read_from(Position {
                    segment_id,
                    offset: 0,
                })
                .await?;
            while let Some(item) = reader.next_record().await? {
                out.push(item);
            }
        }
        Ok(out)
    }

    /// Returns the WAL configuration.
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Deletes every segment older than `position.segment_id` (never the active one).
    ///
    /// Callers must have made the data in those segments redundant first.
    pub async fn delete_segments_before(&self, position: Position) -> Result<u64, SegmentError> {
        self.manager.delete_segments_before(position).await
    }

    /// Syncs and finalizes the active segment. The WAL must not be used afterwards.
    pub async fn close(&self) -> Result<(), SegmentError> {
        self.manager.sync().await?;
        self.manager.finalize_current().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(temp_dir: &TempDir) -> WalConfig {
        WalConfig {
            dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_wal_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let (wal, recovery_info) = Wal::open(config_for(&temp_dir)).await.unwrap();
        assert_eq!(recovery_info.valid_records, 0);

        wal.append_batch(&[
            Record::entry(1, 1, b"a".as_slice()),
            Record::entry(2, 1, b"b".as_slice()),
        ])
        .await
        .unwrap();

        let all = wal.read_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].0.entry_index(), Some(2));
    }

    #[tokio::test]
    async fn test_wal_reopen_recovers_records() {
        let temp_dir = TempDir::new().unwrap();
        {
            let (wal, _) = Wal::open(config_for(&temp_dir)).await.unwrap();
            for i in 1..=50 {
                wal.append(&Record::entry(i, 1, format!("cmd{}", i).into_bytes()))
                    .await
                    .unwrap();
            }
            wal.close().await.unwrap();
        }

        let (wal, info) = Wal::open(config_for(&temp_dir)).await.unwrap();
        assert_eq!(info.valid_records, 50);
        assert!(!info.corruption_detected);

        let indexes: Vec<u64> = wal
            .read_all()
            .await
            .unwrap()
            .iter()
            .filter_map(|(r, _)| r.entry_index())
            .collect();
        assert_eq!(indexes, (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_wal_read_all_across_segments() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            max_segment_size: MIN_SEGMENT_SIZE,
            ..config_for(&temp_dir)
        };
        let (wal, _) = Wal::open(config).await.unwrap();

        for i in 1..=100 {
            wal.append(&Record::entry(i, 1, vec![b'x'; 100]))
                .await
                .unwrap();
        }
        assert!(wal.current_position().await.segment_id > 0);

        let all = wal.read_all().await.unwrap();
        assert_eq!(all.len(), 100);
        assert!(all.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            max_segment_size: 10,
            ..config_for(&temp_dir)
        };
        assert!(matches!(
            Wal::open(config).await,
            Err(SegmentError::InvalidConfig(_))
        ));
    }
}
