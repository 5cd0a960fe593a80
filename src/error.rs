//! Error types for pinhive.
//!
//! This module provides a unified error type [`PinhiveError`] for all pinhive
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Consensus**: leader election, log replication and commit failures
//! - **Tracker**: backpressure and daemon reconciliation errors
//! - **Daemon**: storage daemon rejections and divergence
//! - **Transport**: peer-to-peer RPC failures
//! - **Configuration**: invalid settings, fatal at startup
//!
//! # Example
//!
//! ```rust
//! use pinhive::error::{PinhiveError, Result};
//!
//! fn parse_factor(raw: &str) -> Result<i32> {
//!     raw.parse()
//!         .map_err(|_| PinhiveError::Config(format!("bad replication factor: {raw}")))
//! }
//!
//! fn handle(err: &PinhiveError) {
//!     if err.is_retryable() {
//!         println!("retrying...");
//!     }
//! }
//! ```

use crate::types::PeerId;
use std::io;
use thiserror::Error;

/// Main error type for pinhive operations.
#[derive(Error, Debug)]
pub enum PinhiveError {
    // Consensus errors
    #[error("not the leader, leader is: {leader:?}")]
    NotLeader { leader: Option<PeerId> },

    #[error("no leader elected within the wait window")]
    LeaderTimeout,

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("raft log error: {0}")]
    RaftLog(String),

    // Tracker errors
    #[error("{0} queue is full")]
    QueueFull(String),

    // Allocation errors
    #[error("allocation failed: {0}")]
    Allocation(String),

    // Daemon errors
    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("unexpected daemon state: {0}")]
    UnexpectedDaemonState(String),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    // Input errors
    #[error("invalid cid: {0}")]
    InvalidCid(String),

    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // State and storage errors
    #[error("state error: {0}")]
    State(String),

    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    SnapshotVersion { expected: u32, found: u32 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("component is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PinhiveError {
    /// Check if the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PinhiveError::NotLeader { .. }
                | PinhiveError::LeaderTimeout
                | PinhiveError::Timeout(_)
                | PinhiveError::Transport(_)
        )
    }
}

impl From<rocksdb::Error> for PinhiveError {
    fn from(e: rocksdb::Error) -> Self {
        PinhiveError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for PinhiveError {
    fn from(e: bincode::Error) -> Self {
        PinhiveError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for PinhiveError {
    fn from(e: serde_json::Error) -> Self {
        PinhiveError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for PinhiveError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PinhiveError::Timeout(e.to_string())
        } else {
            PinhiveError::Transport(e.to_string())
        }
    }
}

/// Result type alias for pinhive operations.
pub type Result<T> = std::result::Result<T, PinhiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PinhiveError::NotLeader { leader: Some(2) }.is_retryable());
        assert!(PinhiveError::LeaderTimeout.is_retryable());
        assert!(PinhiveError::Transport("connection refused".into()).is_retryable());
        assert!(!PinhiveError::InvalidCid("".into()).is_retryable());
        assert!(!PinhiveError::QueueFull("pin".into()).is_retryable());
    }

    #[test]
    fn test_queue_full_message() {
        let err = PinhiveError::QueueFull("pin".into());
        assert_eq!(err.to_string(), "pin queue is full");
    }
}
