//! In-memory key-value state machine.
//!
//! Commands are serialized as bincode and applied in log order. An empty
//! command is the leader's no-op entry.

use crate::error::{RaftError, Result};
use crate::snapshot::StateMachine;
use crate::types::LogIndex;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result byte for a `Del` that removed a key.
pub const DELETED: u8 = 1;
/// Result byte for a `Del` of a missing key.
pub const NOT_FOUND: u8 = 0;
/// Result byte for a command that could not be decoded.
pub const INVALID_COMMAND: u8 = 0xFF;

/// Command that can be replicated via Raft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: Bytes, value: Bytes },
    Del { key: Bytes },
}

impl KvCommand {
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        KvCommand::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn del(key: impl Into<Bytes>) -> Self {
        KvCommand::Del { key: key.into() }
    }

    /// Serialize command to bytes using bincode.
    pub fn serialize(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Deserialize command from bytes using bincode.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[derive(Debug, Default)]
struct KvData {
    map: BTreeMap<Bytes, Bytes>,
    applied: LogIndex,
}

#[derive(Serialize, Deserialize)]
struct KvSnapshot {
    applied: LogIndex,
    entries: Vec<(Bytes, Bytes)>,
}

/// Ordered in-memory map driven by committed log entries.
///
/// Clones share the same data, so a handle kept by the read path sees every
/// apply without going through the apply task.
#[derive(Debug, Clone, Default)]
pub struct KvStateMachine {
    inner: Arc<RwLock<KvData>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local read (bypasses the log).
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.inner.read().map.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    /// Copy of every key-value pair in key order.
    pub fn entries(&self) -> Vec<(Bytes, Bytes)> {
        self.inner
            .read()
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Result<Bytes> {
        let mut data = self.inner.write();
        if index <= data.applied {
            return Ok(Bytes::new());
        }
        data.applied = index;

        if command.is_empty() {
            return Ok(Bytes::new());
        }

        let result = match KvCommand::deserialize(command) {
            Ok(KvCommand::Set { key, value }) => {
                data.map.insert(key, value);
                Bytes::new()
            }
            Ok(KvCommand::Del { key }) => {
                let removed = data.map.remove(&key).is_some();
                Bytes::from(vec![if removed { DELETED } else { NOT_FOUND }])
            }
            Err(e) => {
                tracing::warn!(index = %index, error = %e, "Applying undecodable command as no-op");
                Bytes::from_static(&[INVALID_COMMAND])
            }
        };
        Ok(result)
    }

    fn snapshot(&self) -> Result<Bytes> {
        let data = self.inner.read();
        let snap = KvSnapshot {
            applied: data.applied,
            entries: data
                .map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(Bytes::from(bincode::serialize(&snap)?))
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let snap: KvSnapshot =
            bincode::deserialize(snapshot).map_err(|e| RaftError::SnapshotFailed {
                reason: format!("invalid KV snapshot: {}", e),
            })?;
        let mut data = self.inner.write();
        data.map = snap.entries.into_iter().collect();
        data.applied = snap.applied;
        Ok(())
    }

    fn last_applied(&self) -> LogIndex {
        self.inner.read().applied
    }
}
