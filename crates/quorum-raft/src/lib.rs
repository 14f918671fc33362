//! quorum-raft: Raft consensus over a durable segmented log.
//!
//! - Leader election with randomized timeouts and durable term/vote
//! - Log replication with conflict-term backtracking and per-peer backoff
//! - Quorum commit of current-term entries, ordered idempotent apply
//! - Snapshots with log compaction and chunked InstallSnapshot
//! - Replicated in-memory KV state machine and write coordinator
//! - Pluggable transport trait with an in-memory implementation
//! - VizEvent observability integration
//!
//! Based on the Raft paper (Ongaro & Ousterhout, 2014).

pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod hard_state;
pub mod kv;
pub mod log;
pub mod raft;
pub mod replication;
pub mod rpc_handler;
pub mod snapshot;
pub mod state;
pub mod timer;
pub mod transport;
pub mod types;

pub use config::RaftConfig;
pub use coordinator::KvStore;
pub use error::{RaftError, Result};
pub use kv::{KvCommand, KvStateMachine};
pub use raft::Raft;
pub use snapshot::{Snapshot, SnapshotMetadata, SnapshotStore, StateMachine};
pub use state::{Leadership, Proposal, RaftStatus, RaftStorage};
pub use transport::{rpc_channel, InMemoryTransport, RaftTransport, RpcMessage, RpcReceiver, RpcSender};
pub use types::*;
