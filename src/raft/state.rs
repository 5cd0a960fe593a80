//! Per-node Raft state.

use crate::types::{LogIndex, PeerId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a Raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive, responds to RPCs.
    Follower,
    /// Actively seeking election.
    Candidate,
    /// Serialises client requests and drives replication.
    Leader,
}

impl NodeState {
    pub fn is_leader(&self) -> bool {
        matches!(self, NodeState::Leader)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, NodeState::Candidate)
    }
}

/// State that must survive restarts: the current term and who we voted for
/// in it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<PeerId>,
}

/// Volatile state kept by every node.
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Highest log index known to be committed.
    pub commit_index: LogIndex,
    /// Highest log index applied to the state machine.
    pub last_applied: LogIndex,
}

/// Replication bookkeeping kept only while leading.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// Next log index to send to each peer.
    pub next_index: HashMap<PeerId, LogIndex>,
    /// Highest log index known replicated on each peer.
    pub match_index: HashMap<PeerId, LogIndex>,
}

impl LeaderState {
    pub fn new(peers: &[PeerId], last_log_index: LogIndex) -> Self {
        let next_index = peers.iter().map(|&p| (p, last_log_index + 1)).collect();
        let match_index = peers.iter().map(|&p| (p, 0)).collect();
        Self {
            next_index,
            match_index,
        }
    }

    /// Record a successful replication up to `match_index`.
    pub fn update_match(&mut self, peer: PeerId, match_index: LogIndex) {
        self.match_index.insert(peer, match_index);
        self.next_index.insert(peer, match_index + 1);
    }

    /// Back off after a rejected AppendEntries.
    pub fn decrement_next(&mut self, peer: PeerId) {
        if let Some(next) = self.next_index.get_mut(&peer) {
            *next = next.saturating_sub(1).max(1);
        }
    }

    /// Start tracking a freshly added peer.
    pub fn add_peer(&mut self, peer: PeerId, last_log_index: LogIndex) {
        self.next_index.entry(peer).or_insert(last_log_index + 1);
        self.match_index.entry(peer).or_insert(0);
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        self.next_index.remove(&peer);
        self.match_index.remove(&peer);
    }
}

/// Complete Raft state for one node.
#[derive(Debug)]
pub struct RaftState {
    pub node_id: PeerId,
    pub state: NodeState,
    /// Last known leader.
    pub leader_id: Option<PeerId>,
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    /// Present only while `state` is `Leader`.
    pub leader: Option<LeaderState>,
    /// The other voting members.
    pub peers: Vec<PeerId>,
}

impl RaftState {
    pub fn new(node_id: PeerId, peers: Vec<PeerId>) -> Self {
        Self {
            node_id,
            state: NodeState::Follower,
            leader_id: None,
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            leader: None,
            peers,
        }
    }

    pub fn become_follower(&mut self, term: Term, leader_id: Option<PeerId>) {
        if term > self.persistent.current_term {
            self.persistent.voted_for = None;
        }
        self.state = NodeState::Follower;
        self.persistent.current_term = term;
        self.leader_id = leader_id;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term,
            leader = ?leader_id,
            "became follower"
        );
    }

    pub fn become_candidate(&mut self) {
        self.state = NodeState::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "became candidate"
        );
    }

    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.node_id);
        self.leader = Some(LeaderState::new(&self.peers, last_log_index));

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "became leader"
        );
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    /// Majority size over the full membership (peers plus self).
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Add a voting member. No-op when already present or self.
    pub fn add_peer(&mut self, peer: PeerId, last_log_index: LogIndex) {
        if peer == self.node_id || self.peers.contains(&peer) {
            return;
        }
        self.peers.push(peer);
        if let Some(leader) = self.leader.as_mut() {
            leader.add_peer(peer, last_log_index);
        }
    }

    pub fn remove_peer(&mut self, peer: PeerId) {
        self.peers.retain(|&p| p != peer);
        if let Some(leader) = self.leader.as_mut() {
            leader.remove_peer(peer);
        }
        if self.leader_id == Some(peer) {
            self.leader_id = None;
        }
    }

    /// Highest index replicated on a quorum, given the leader's own last
    /// index and a way to look up the term stored at an index.
    ///
    /// Entries from earlier terms are never committed by counting
    /// replicas; they commit implicitly once an entry from the current
    /// term does (Raft §5.4.2).
    pub fn calculate_commit_index(
        &self,
        last_log_index: LogIndex,
        term_at: impl Fn(LogIndex) -> Option<Term>,
    ) -> LogIndex {
        let leader_state = match (&self.leader, self.is_leader()) {
            (Some(l), true) => l,
            _ => return self.volatile.commit_index,
        };

        let mut indices: Vec<LogIndex> = self
            .peers
            .iter()
            .map(|p| leader_state.match_index.get(p).copied().unwrap_or(0))
            .collect();
        indices.push(last_log_index);
        indices.sort_unstable();
        indices.reverse();

        let quorum_idx = self.quorum_size() - 1;
        if quorum_idx >= indices.len() {
            return self.volatile.commit_index;
        }

        let candidate = indices[quorum_idx];
        if candidate > self.volatile.commit_index
            && term_at(candidate) == Some(self.current_term())
        {
            candidate
        } else {
            self.volatile.commit_index
        }
    }
}
