//! Append-only, segmented write-ahead log.
//!
//! Implements the durable record stream underneath the Raft log:
//! - Varint-encoded records with CRC32C checksumming
//! - One write and one fsync per append batch; a batch survives a crash whole or not at all
//! - Size-based segment rotation and whole-segment garbage collection
//! - Crash recovery: torn tails are truncated, mid-stream damage is fatal
//! - Observability via quorum-observe
//!
//! # Example
//!
//! ```no_run
//! use quorum_wal::{Record, Wal, WalConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (wal, recovery_info) = Wal::open(WalConfig::default()).await?;
//!     println!("Recovered {} records", recovery_info.valid_records);
//!
//!     wal.append_batch(&[Record::entry(1, 1, b"SET k v".as_slice())]).await?;
//!     Ok(())
//! }
//! ```

pub mod record;
pub mod recovery;
pub mod segment;
pub mod wal;

pub use record::{BatchHeader, Record, RecordError};
pub use recovery::RecoveryInfo;
pub use segment::{FsyncPolicy, Position, SegmentConfig, SegmentError, SegmentManager, SegmentReader};
pub use wal::{Wal, WalConfig};
