//! Raft wire messages and the transport seam.

use super::LogEntry;
use crate::types::{LogIndex, PeerId, Term};
use serde::{Deserialize, Serialize};

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: PeerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. An empty `entries` list is a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: PeerId,
    /// Index of the entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Last index replicated on the follower.
    pub match_index: LogIndex,
    /// Fast-backtracking hint: where the leader should retry from.
    pub conflict_index: Option<LogIndex>,
    pub conflict_term: Option<Term>,
}

/// InstallSnapshot RPC arguments. Pin-set snapshots are small enough to
/// ship in one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: PeerId,
    /// The snapshot replaces all entries up to and including this index.
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
}

/// Transport seam between Raft nodes. The production implementation lives
/// in [`crate::rpc`]; tests plug in mocks.
#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(
        &self,
        target: PeerId,
        request: RequestVoteRequest,
    ) -> crate::Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: PeerId,
        request: AppendEntriesRequest,
    ) -> crate::Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: PeerId,
        request: InstallSnapshotRequest,
    ) -> crate::Result<InstallSnapshotResponse>;
}
