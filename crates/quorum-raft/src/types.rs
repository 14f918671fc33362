//! Core Raft types: terms, indexes, log entries, membership and RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raft term number (monotonically increasing).
///
/// Each term has at most one leader. A node increments its term when it
/// starts an election.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 means "before the log").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        if self.0 > 0 {
            Some(LogIndex(self.0 - 1))
        } else {
            None
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Node identifier, unique across the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric tag used in observability events.
    pub fn tag(&self) -> u32 {
        quorum_observe::node_tag(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A replicated log entry.
///
/// Immutable once written. Whether it is committed is derived from the
/// commit index, not stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Bytes,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Bytes) -> Self {
        Self {
            term,
            index,
            command,
        }
    }

    /// Approximate bytes this entry occupies in the log.
    pub fn size_hint(&self) -> u64 {
        self.command.len() as u64 + 24
    }
}

/// Fixed cluster membership.
///
/// Shared read-only by the consensus module and the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembership {
    members: Vec<NodeId>,
}

impl ClusterMembership {
    /// Builds a membership from a list of ids. Duplicates are ignored.
    pub fn new(members: impl IntoIterator<Item = NodeId>) -> Self {
        let mut out: Vec<NodeId> = Vec::new();
        for m in members {
            if !out.contains(&m) {
                out.push(m);
            }
        }
        Self { members: out }
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains(id)
    }

    /// Every member except `id`.
    pub fn peers_of<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.members.iter().filter(move |m| *m != id)
    }

    /// Strict majority of the cluster.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// True if `voters` contains a strict majority of members.
    pub fn has_quorum<'a>(&self, voters: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let mut counted: Vec<&NodeId> = Vec::new();
        for v in voters {
            if self.contains(v) && !counted.contains(&v) {
                counted.push(v);
            }
        }
        counted.len() >= self.quorum()
    }
}

/// RequestVote RPC request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Voter's current term, for the candidate to update itself
    pub term: Term,

    /// True if the candidate received this vote
    pub vote_granted: bool,
}

/// AppendEntries RPC request. An empty `entries` list is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's ID (so followers can redirect clients)
    pub leader_id: NodeId,

    /// Index of the entry immediately preceding `entries`
    pub prev_log_index: LogIndex,

    /// Term of the `prev_log_index` entry
    pub prev_log_term: Term,

    /// Entries to store
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Follower's current term
    pub term: Term,

    /// True if the consistency check passed and the entries are durable
    pub success: bool,

    /// On success, the highest index known to match the leader's log
    pub match_index: LogIndex,

    /// On failure, where the leader should resume (skips a whole conflicting term)
    pub conflict_index: Option<LogIndex>,
}

/// InstallSnapshot RPC request. Snapshots are streamed in chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's ID
    pub leader_id: NodeId,

    /// Index of last entry covered by the snapshot
    pub last_included_index: LogIndex,

    /// Term of `last_included_index`
    pub last_included_term: Term,

    /// Byte offset of this chunk in the snapshot payload
    pub offset: u64,

    /// Chunk bytes
    pub data: Bytes,

    /// True for the final chunk
    pub done: bool,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Follower's current term
    pub term: Term,

    /// Bytes of this snapshot the follower holds so far
    pub bytes_stored: u64,
}

/// Raft role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}
