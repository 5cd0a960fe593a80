//! Raft consensus for the replicated pin set.
//!
//! This module implements leader election, log replication and snapshotting
//! for a deterministic state machine. The consensus layer in
//! [`crate::consensus`] plugs the pin-set FSM into it and exposes the
//! cluster-facing commit API.

// unwrap() panics in this module can wedge the whole cluster.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod log;
mod node;
pub mod rpc;
mod state;
mod storage;

pub use log::{LogEntry, RaftLog};
pub use node::{RaftCommand, RaftConfig, RaftHandle, RaftNode};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftTransport, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{NodeState, PersistentState, RaftState};
pub use storage::{RaftStorage, SnapshotMeta};

/// A deterministic state machine driven by the replicated log.
///
/// Applying the same command sequence from the same snapshot must yield the
/// same state on every peer.
pub trait StateMachine: Send + Sync {
    /// Apply a committed command.
    fn apply(&mut self, command: &[u8]);

    /// Serialise the current state.
    fn snapshot(&self) -> crate::Result<Vec<u8>>;

    /// Replace the current state with a serialised snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> crate::Result<()>;
}
