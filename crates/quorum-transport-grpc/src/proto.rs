//! Wire messages for the Raft peer service and their conversions.
//!
//! Field tags are part of the wire format; never renumber them.

use bytes::Bytes;
use quorum_raft::types::{self as raft, LogIndex, NodeId, Term};

include!(concat!(env!("OUT_DIR"), "/quorum.raft.RaftService.rs"));

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEntry {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(bytes = "bytes", tag = "3")]
    pub command: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestVoteRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub candidate_id: String,
    #[prost(uint64, tag = "3")]
    pub last_log_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_log_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestVoteResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub vote_granted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendEntriesRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub leader_id: String,
    #[prost(uint64, tag = "3")]
    pub prev_log_index: u64,
    #[prost(uint64, tag = "4")]
    pub prev_log_term: u64,
    #[prost(message, repeated, tag = "5")]
    pub entries: Vec<LogEntry>,
    #[prost(uint64, tag = "6")]
    pub leader_commit: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendEntriesResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(uint64, tag = "3")]
    pub match_index: u64,
    /// Absent when the follower gave no hint.
    #[prost(uint64, optional, tag = "4")]
    pub conflict_index: Option<u64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstallSnapshotRequest {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub leader_id: String,
    #[prost(uint64, tag = "3")]
    pub last_included_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_included_term: u64,
    #[prost(uint64, tag = "5")]
    pub offset: u64,
    #[prost(bytes = "bytes", tag = "6")]
    pub data: Bytes,
    #[prost(bool, tag = "7")]
    pub done: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstallSnapshotResponse {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub bytes_stored: u64,
}

impl From<raft::LogEntry> for LogEntry {
    fn from(entry: raft::LogEntry) -> Self {
        Self {
            term: entry.term.as_u64(),
            index: entry.index.as_u64(),
            command: entry.command,
        }
    }
}

impl From<LogEntry> for raft::LogEntry {
    fn from(entry: LogEntry) -> Self {
        raft::LogEntry::new(Term(entry.term), LogIndex(entry.index), entry.command)
    }
}

impl From<raft::RequestVoteRequest> for RequestVoteRequest {
    fn from(req: raft::RequestVoteRequest) -> Self {
        Self {
            term: req.term.as_u64(),
            candidate_id: req.candidate_id.0,
            last_log_index: req.last_log_index.as_u64(),
            last_log_term: req.last_log_term.as_u64(),
        }
    }
}

impl From<RequestVoteRequest> for raft::RequestVoteRequest {
    fn from(req: RequestVoteRequest) -> Self {
        Self {
            term: Term(req.term),
            candidate_id: NodeId::new(req.candidate_id),
            last_log_index: LogIndex(req.last_log_index),
            last_log_term: Term(req.last_log_term),
        }
    }
}

impl From<raft::RequestVoteResponse> for RequestVoteResponse {
    fn from(resp: raft::RequestVoteResponse) -> Self {
        Self {
            term: resp.term.as_u64(),
            vote_granted: resp.vote_granted,
        }
    }
}

impl From<RequestVoteResponse> for raft::RequestVoteResponse {
    fn from(resp: RequestVoteResponse) -> Self {
        Self {
            term: Term(resp.term),
            vote_granted: resp.vote_granted,
        }
    }
}

impl From<raft::AppendEntriesRequest> for AppendEntriesRequest {
    fn from(req: raft::AppendEntriesRequest) -> Self {
        Self {
            term: req.term.as_u64(),
            leader_id: req.leader_id.0,
            prev_log_index: req.prev_log_index.as_u64(),
            prev_log_term: req.prev_log_term.as_u64(),
            entries: req.entries.into_iter().map(LogEntry::from).collect(),
            leader_commit: req.leader_commit.as_u64(),
        }
    }
}

impl From<AppendEntriesRequest> for raft::AppendEntriesRequest {
    fn from(req: AppendEntriesRequest) -> Self {
        Self {
            term: Term(req.term),
            leader_id: NodeId::new(req.leader_id),
            prev_log_index: LogIndex(req.prev_log_index),
            prev_log_term: Term(req.prev_log_term),
            entries: req.entries.into_iter().map(raft::LogEntry::from).collect(),
            leader_commit: LogIndex(req.leader_commit),
        }
    }
}

impl From<raft::AppendEntriesResponse> for AppendEntriesResponse {
    fn from(resp: raft::AppendEntriesResponse) -> Self {
        Self {
            term: resp.term.as_u64(),
            success: resp.success,
            match_index: resp.match_index.as_u64(),
            conflict_index: resp.conflict_index.map(|i| i.as_u64()),
        }
    }
}

impl From<AppendEntriesResponse> for raft::AppendEntriesResponse {
    fn from(resp: AppendEntriesResponse) -> Self {
        Self {
            term: Term(resp.term),
            success: resp.success,
            match_index: LogIndex(resp.match_index),
            conflict_index: resp.conflict_index.map(LogIndex),
        }
    }
}

impl From<raft::InstallSnapshotRequest> for InstallSnapshotRequest {
    fn from(req: raft::InstallSnapshotRequest) -> Self {
        Self {
            term: req.term.as_u64(),
            leader_id: req.leader_id.0,
            last_included_index: req.last_included_index.as_u64(),
            last_included_term: req.last_included_term.as_u64(),
            offset: req.offset,
            data: req.data,
            done: req.done,
        }
    }
}

impl From<InstallSnapshotRequest> for raft::InstallSnapshotRequest {
    fn from(req: InstallSnapshotRequest) -> Self {
        Self {
            term: Term(req.term),
            leader_id: NodeId::new(req.leader_id),
            last_included_index: LogIndex(req.last_included_index),
            last_included_term: Term(req.last_included_term),
            offset: req.offset,
            data: req.data,
            done: req.done,
        }
    }
}

impl From<raft::InstallSnapshotResponse> for InstallSnapshotResponse {
    fn from(resp: raft::InstallSnapshotResponse) -> Self {
        Self {
            term: resp.term.as_u64(),
            bytes_stored: resp.bytes_stored,
        }
    }
}

impl From<InstallSnapshotResponse> for raft::InstallSnapshotResponse {
    fn from(resp: InstallSnapshotResponse) -> Self {
        Self {
            term: Term(resp.term),
            bytes_stored: resp.bytes_stored,
        }
    }
}
