//! Raft node event loop.

use super::rpc::*;
use super::{LogEntry, RaftLog, RaftState, RaftStorage, StateMachine};
use crate::error::{PinhiveError, Result};
use crate::types::{LogIndex, PeerId};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info};

/// Raft timing and sizing knobs.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: PeerId,
    /// The other voting members at startup.
    pub initial_peers: Vec<PeerId>,
    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
    /// Applied entries between automatic snapshots.
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            initial_peers: Vec::new(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 100,
            snapshot_threshold: 4096,
        }
    }
}

/// Commands handled by the node's event loop.
pub enum RaftCommand {
    /// Propose a command for replication. Resolves with the assigned log
    /// index once the entry is appended locally and replication has been
    /// kicked off; callers wait for the applied index to observe commit.
    Propose {
        command: Vec<u8>,
        response: oneshot::Sender<Result<LogIndex>>,
    },
    /// Incoming RequestVote RPC.
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },
    /// Incoming AppendEntries RPC.
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },
    /// Incoming InstallSnapshot RPC.
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },
    /// Add a voting member to the transport configuration.
    AddPeer { peer: PeerId },
    /// Remove a voting member from the transport configuration.
    RemovePeer { peer: PeerId },
    /// Current leader, if known.
    Leader {
        response: oneshot::Sender<Option<PeerId>>,
    },
    /// Take a snapshot now.
    TakeSnapshot {
        response: oneshot::Sender<Result<()>>,
    },
    /// Take a final snapshot and stop the event loop.
    Shutdown { response: oneshot::Sender<()> },
}

/// Cheap handle for talking to a running [`RaftNode`].
#[derive(Clone)]
pub struct RaftHandle {
    pub command_tx: mpsc::Sender<RaftCommand>,
    /// Publishes the current leader on every change.
    pub leader: watch::Receiver<Option<PeerId>>,
    /// Publishes the last log index applied to the state machine.
    pub applied: watch::Receiver<LogIndex>,
    /// Publishes the commit index as it advances.
    pub commit: watch::Receiver<LogIndex>,
}

impl RaftHandle {
    /// Current leader, if the node is still running and one is known.
    pub async fn leader(&self) -> Option<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::Leader { response: tx })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }
}

enum ReplicationOutcome {
    Append(PeerId, AppendEntriesResponse),
    Snapshot(PeerId, InstallSnapshotResponse, LogIndex),
}

/// A Raft node driving a deterministic state machine.
pub struct RaftNode<S: StateMachine> {
    config: RaftConfig,
    state: Arc<RwLock<RaftState>>,
    log: Arc<RwLock<RaftLog>>,
    storage: Arc<RaftStorage>,
    state_machine: Arc<RwLock<S>>,
    transport: Arc<dyn RaftTransport>,
    command_tx: mpsc::Sender<RaftCommand>,
    leader_tx: watch::Sender<Option<PeerId>>,
    applied_tx: watch::Sender<LogIndex>,
    commit_tx: watch::Sender<LogIndex>,
}

impl<S: StateMachine + 'static> RaftNode<S> {
    /// Create a node, restoring any persisted state from `storage`.
    pub fn new(
        config: RaftConfig,
        storage: Arc<RaftStorage>,
        state_machine: S,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<(Self, mpsc::Receiver<RaftCommand>, RaftHandle)> {
        let mut raft_state = RaftState::new(config.node_id, config.initial_peers.clone());
        if let Some(persistent) = storage.load_persistent_state()? {
            raft_state.persistent = persistent;
        }

        let mut log = RaftLog::new();
        let mut state_machine = state_machine;
        let mut last_applied = 0;
        if let Some((snapshot_data, meta)) = storage.load_snapshot()? {
            state_machine.restore(&snapshot_data)?;
            log.compact(meta.last_index, meta.last_term);
            last_applied = meta.last_index;
        }
        for entry in storage.load_log_entries_from(log.first_index())? {
            log.append(entry)?;
        }
        raft_state.volatile.commit_index = last_applied;
        raft_state.volatile.last_applied = last_applied;

        let (command_tx, command_rx) = mpsc::channel(1024);
        let (leader_tx, leader_rx) = watch::channel(None);
        let (applied_tx, applied_rx) = watch::channel(last_applied);
        let (commit_tx, commit_rx) = watch::channel(last_applied);

        let handle = RaftHandle {
            command_tx: command_tx.clone(),
            leader: leader_rx,
            applied: applied_rx,
            commit: commit_rx,
        };

        let node = Self {
            config,
            state: Arc::new(RwLock::new(raft_state)),
            log: Arc::new(RwLock::new(log)),
            storage,
            state_machine: Arc::new(RwLock::new(state_machine)),
            transport,
            command_tx,
            leader_tx,
            applied_tx,
            commit_tx,
        };

        Ok((node, command_rx, handle))
    }

    pub fn command_sender(&self) -> mpsc::Sender<RaftCommand> {
        self.command_tx.clone()
    }

    /// Run the event loop until a `Shutdown` command arrives.
    pub async fn run(self, mut command_rx: mpsc::Receiver<RaftCommand>) {
        let mut election_deadline = self.reset_election_deadline();
        let mut heartbeat = interval(self.config.heartbeat_interval);

        loop {
            let is_leader = self.state.read().is_leader();

            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        RaftCommand::Shutdown { response } => {
                            info!(node_id = self.config.node_id, "raft node shutting down");
                            if let Err(e) = self.take_snapshot() {
                                error!(error = %e, "final snapshot failed");
                            }
                            let _ = response.send(());
                            break;
                        }
                        RaftCommand::Propose { command, response } => {
                            let result = self.handle_propose(command).await;
                            let _ = response.send(result);
                        }
                        RaftCommand::RequestVote { request, response } => {
                            let result = self.handle_request_vote(request);
                            let _ = response.send(result);
                        }
                        RaftCommand::AppendEntries { request, response } => {
                            let result = self.handle_append_entries(request);
                            if result.success {
                                election_deadline = self.reset_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        RaftCommand::InstallSnapshot { request, response } => {
                            let result = self.handle_install_snapshot(request);
                            election_deadline = self.reset_election_deadline();
                            let _ = response.send(result);
                        }
                        RaftCommand::AddPeer { peer } => {
                            let last_index = self.log.read().last_index();
                            self.state.write().add_peer(peer, last_index);
                            debug!(peer, "raft membership grew");
                        }
                        RaftCommand::RemovePeer { peer } => {
                            self.state.write().remove_peer(peer);
                            debug!(peer, "raft membership shrank");
                        }
                        RaftCommand::Leader { response } => {
                            let _ = response.send(self.state.read().leader_id);
                        }
                        RaftCommand::TakeSnapshot { response } => {
                            let _ = response.send(self.take_snapshot());
                        }
                    }
                }

                _ = heartbeat.tick(), if is_leader => {
                    self.replicate_to_all().await;
                }

                _ = tokio::time::sleep_until(election_deadline), if !is_leader => {
                    self.start_election().await;
                    election_deadline = self.reset_election_deadline();
                }
            }

            self.apply_committed_entries();
            self.maybe_snapshot();
            self.publish_watches();
        }
    }

    async fn handle_propose(&self, command: Vec<u8>) -> Result<LogIndex> {
        let (term, is_leader) = {
            let state = self.state.read();
            (state.current_term(), state.is_leader())
        };

        if !is_leader {
            let leader = self.state.read().leader_id;
            return Err(PinhiveError::NotLeader { leader });
        }

        let index = {
            let mut log = self.log.write();
            let index = log.last_index() + 1;
            let entry = LogEntry::new(term, index, command);
            self.storage.append_log_entries(std::slice::from_ref(&entry))?;
            log.append(entry)?;
            index
        };

        self.replicate_to_all().await;
        Ok(index)
    }

    fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.write();
        let log = self.log.read();

        if request.term > state.current_term() {
            state.become_follower(request.term, None);
            self.persist_state(&state);
        }

        let vote_granted = if request.term < state.current_term() {
            false
        } else if state.persistent.voted_for.is_some()
            && state.persistent.voted_for != Some(request.candidate_id)
        {
            false
        } else if !log.is_up_to_date(request.last_log_index, request.last_log_term) {
            false
        } else {
            state.persistent.voted_for = Some(request.candidate_id);
            self.persist_state(&state);
            true
        };

        debug!(
            node_id = state.node_id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "handled RequestVote"
        );

        RequestVoteResponse {
            term: state.current_term(),
            vote_granted,
        }
    }

    fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.write();
        let mut log = self.log.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }

        if request.term < state.current_term() {
            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                conflict_index: None,
                conflict_term: None,
            };
        }

        // A valid AppendEntries from the current term settles leadership.
        if state.state.is_candidate() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }
        state.leader_id = Some(request.leader_id);

        if !log.matches(request.prev_log_index, request.prev_log_term) {
            let conflict_term = log.term_at(request.prev_log_index);
            let conflict_index = if conflict_term.is_some() {
                // First index carrying the conflicting term.
                let mut idx = request.prev_log_index;
                while idx > log.first_index() && log.term_at(idx - 1) == conflict_term {
                    idx -= 1;
                }
                Some(idx)
            } else {
                Some(log.last_index() + 1)
            };

            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                conflict_index,
                conflict_term,
            };
        }

        let mut new_entries = Vec::new();
        for entry in request.entries {
            if entry.index <= log.last_index() {
                if let Some(existing) = log.get(entry.index) {
                    if existing.term != entry.term {
                        log.truncate_from(entry.index);
                        if let Err(e) = self.storage.truncate_log_from(entry.index) {
                            error!(error = %e, index = entry.index, "log truncation failed");
                        }
                        new_entries.push(entry);
                    }
                    // Entries we already hold are skipped.
                } else {
                    new_entries.push(entry);
                }
            } else {
                new_entries.push(entry);
            }
        }

        if !new_entries.is_empty() {
            if let Err(e) = self.storage.append_log_entries(&new_entries) {
                error!(error = %e, count = new_entries.len(), "persisting entries failed");
                // Report failure so the leader retries.
                return AppendEntriesResponse {
                    term: state.current_term(),
                    success: false,
                    match_index: log.last_index(),
                    conflict_index: None,
                    conflict_term: None,
                };
            }
            for entry in new_entries {
                if let Err(e) = log.append(entry) {
                    error!(error = %e, "in-memory log append failed");
                }
            }
        }

        if request.leader_commit > state.volatile.commit_index {
            state.volatile.commit_index = request.leader_commit.min(log.last_index());
        }

        AppendEntriesResponse {
            term: state.current_term(),
            success: true,
            match_index: log.last_index(),
            conflict_index: None,
            conflict_term: None,
        }
    }

    fn handle_install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut state = self.state.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }

        if request.term < state.current_term() {
            return InstallSnapshotResponse {
                term: state.current_term(),
                success: false,
            };
        }
        state.leader_id = Some(request.leader_id);

        if let Err(e) = self.storage.save_snapshot(
            &request.data,
            request.last_included_index,
            request.last_included_term,
        ) {
            error!(error = %e, "saving snapshot failed");
            return InstallSnapshotResponse {
                term: state.current_term(),
                success: false,
            };
        }

        if let Err(e) = self.state_machine.write().restore(&request.data) {
            error!(error = %e, "restoring state machine from snapshot failed");
            return InstallSnapshotResponse {
                term: state.current_term(),
                success: false,
            };
        }

        {
            let mut log = self.log.write();
            log.compact(request.last_included_index, request.last_included_term);
        }
        if let Err(e) = self.storage.compact_log(request.last_included_index) {
            error!(error = %e, "compacting persisted log failed");
        }

        state.volatile.commit_index = request.last_included_index;
        state.volatile.last_applied = request.last_included_index;

        info!(
            node_id = self.config.node_id,
            index = request.last_included_index,
            size = request.data.len(),
            "installed snapshot"
        );

        InstallSnapshotResponse {
            term: state.current_term(),
            success: true,
        }
    }

    async fn start_election(&self) {
        let (term, last_log_index, last_log_term, peers, quorum) = {
            let mut state = self.state.write();
            let log = self.log.read();
            state.become_candidate();
            self.persist_state(&state);
            (
                state.current_term(),
                log.last_index(),
                log.last_term(),
                state.peers.clone(),
                state.quorum_size(),
            )
        };

        info!(node_id = self.config.node_id, term, "starting election");

        let mut votes_received = 1; // self-vote

        // A lone peer wins immediately.
        if votes_received >= quorum {
            let last_index = self.log.read().last_index();
            self.state.write().become_leader(last_index);
            self.replicate_to_all().await;
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.config.node_id,
            last_log_index,
            last_log_term,
        };

        let vote_futures = peers.into_iter().map(|peer| {
            let transport = Arc::clone(&self.transport);
            let req = request.clone();
            async move {
                match timeout(Duration::from_millis(100), transport.request_vote(peer, req)).await {
                    Ok(Ok(response)) => Some((peer, response)),
                    _ => None,
                }
            }
        });

        let results = futures::future::join_all(vote_futures).await;

        for (peer, response) in results.into_iter().flatten() {
            let should_become_leader = {
                let mut state = self.state.write();
                if !state.state.is_candidate() || state.current_term() != term {
                    return;
                }
                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    self.persist_state(&state);
                    return;
                }

                if response.vote_granted {
                    votes_received += 1;
                    debug!(
                        node_id = self.config.node_id,
                        voter = peer,
                        votes = votes_received,
                        "received vote"
                    );
                    if votes_received >= quorum {
                        let last_index = self.log.read().last_index();
                        state.become_leader(last_index);
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            };

            if should_become_leader {
                self.replicate_to_all().await;
                return;
            }
        }
    }

    /// Replicate pending entries (or a heartbeat) to every follower and
    /// advance the commit index over the responses.
    async fn replicate_to_all(&self) {
        let (term, commit_index, peers, leader_state) = {
            let state = self.state.read();
            if !state.is_leader() {
                return;
            }
            (
                state.current_term(),
                state.volatile.commit_index,
                state.peers.clone(),
                match state.leader.clone() {
                    Some(l) => l,
                    None => return,
                },
            )
        };

        let mut futures = Vec::new();
        for peer in peers {
            let next_index = leader_state.next_index.get(&peer).copied().unwrap_or(1);
            let first_index = self.log.read().first_index();

            if next_index < first_index {
                // The follower is behind our snapshot horizon.
                let snapshot = match self.storage.load_snapshot() {
                    Ok(Some((data, meta))) => Some((data, meta)),
                    _ => None,
                };
                if let Some((data, meta)) = snapshot {
                    let request = InstallSnapshotRequest {
                        term,
                        leader_id: self.config.node_id,
                        last_included_index: meta.last_index,
                        last_included_term: meta.last_term,
                        data,
                    };
                    let transport = Arc::clone(&self.transport);
                    futures.push(tokio::spawn(async move {
                        match timeout(
                            Duration::from_secs(10),
                            transport.install_snapshot(peer, request),
                        )
                        .await
                        {
                            Ok(Ok(response)) => {
                                Some(ReplicationOutcome::Snapshot(peer, response, meta.last_index))
                            }
                            _ => None,
                        }
                    }));
                    continue;
                }
            }

            let (prev_log_index, prev_log_term, entries) = {
                let log = self.log.read();
                let prev_log_index = next_index.saturating_sub(1);
                let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
                let entries =
                    log.entries_from_limit(next_index, self.config.max_entries_per_append);
                (prev_log_index, prev_log_term, entries)
            };

            let request = AppendEntriesRequest {
                term,
                leader_id: self.config.node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };
            let transport = Arc::clone(&self.transport);
            futures.push(tokio::spawn(async move {
                match timeout(Duration::from_millis(75), transport.append_entries(peer, request))
                    .await
                {
                    Ok(Ok(response)) => Some(ReplicationOutcome::Append(peer, response)),
                    _ => None,
                }
            }));
        }

        let results = futures::future::join_all(futures).await;

        let mut state = self.state.write();
        if !state.is_leader() {
            return;
        }

        for outcome in results.into_iter().flatten().flatten() {
            match outcome {
                ReplicationOutcome::Append(peer, response) => {
                    if response.term > state.current_term() {
                        state.become_follower(response.term, None);
                        self.persist_state(&state);
                        return;
                    }
                    if let Some(leader) = state.leader.as_mut() {
                        if response.success {
                            leader.update_match(peer, response.match_index);
                        } else if let Some(conflict_index) = response.conflict_index {
                            leader.next_index.insert(peer, conflict_index.max(1));
                        } else {
                            leader.decrement_next(peer);
                        }
                    }
                }
                ReplicationOutcome::Snapshot(peer, response, last_index) => {
                    if response.term > state.current_term() {
                        state.become_follower(response.term, None);
                        self.persist_state(&state);
                        return;
                    }
                    if response.success {
                        if let Some(leader) = state.leader.as_mut() {
                            leader.update_match(peer, last_index);
                        }
                    }
                }
            }
        }

        let new_commit = {
            let log = self.log.read();
            state.calculate_commit_index(log.last_index(), |index| log.term_at(index))
        };
        if new_commit > state.volatile.commit_index {
            state.volatile.commit_index = new_commit;
            debug!(
                node_id = state.node_id,
                commit_index = new_commit,
                "advanced commit index"
            );
        }
    }

    fn apply_committed_entries(&self) {
        let (commit_index, last_applied) = {
            let state = self.state.read();
            (state.volatile.commit_index, state.volatile.last_applied)
        };
        if commit_index <= last_applied {
            return;
        }

        let entries = {
            let log = self.log.read();
            log.entries_range(last_applied + 1, commit_index)
        };

        let mut state_machine = self.state_machine.write();
        for entry in entries {
            state_machine.apply(entry.command_bytes());
            self.state.write().volatile.last_applied = entry.index;
        }
    }

    fn maybe_snapshot(&self) {
        let (last_applied, snapshot_horizon) = {
            let state = self.state.read();
            let log = self.log.read();
            (
                state.volatile.last_applied,
                log.first_index().saturating_sub(1),
            )
        };
        if last_applied - snapshot_horizon < self.config.snapshot_threshold {
            return;
        }
        if let Err(e) = self.take_snapshot() {
            error!(error = %e, "automatic snapshot failed");
        }
    }

    /// Snapshot the state machine at the last applied index and compact.
    fn take_snapshot(&self) -> Result<()> {
        let last_applied = self.state.read().volatile.last_applied;
        if last_applied == 0 {
            return Ok(());
        }
        let snapshot_term = self.log.read().term_at(last_applied).unwrap_or(0);
        let data = self.state_machine.read().snapshot()?;

        self.storage
            .save_snapshot(&data, last_applied, snapshot_term)?;
        self.log.write().compact(last_applied, snapshot_term);
        self.storage.compact_log(last_applied)?;

        info!(
            node_id = self.config.node_id,
            last_applied, "took snapshot"
        );
        Ok(())
    }

    fn persist_state(&self, state: &RaftState) {
        if let Err(e) = self.storage.save_persistent_state(&state.persistent) {
            error!(error = %e, "persisting term/vote failed");
        }
    }

    fn publish_watches(&self) {
        let (leader_id, last_applied, commit_index) = {
            let state = self.state.read();
            (
                state.leader_id,
                state.volatile.last_applied,
                state.volatile.commit_index,
            )
        };
        self.leader_tx.send_if_modified(|current| {
            if *current != leader_id {
                *current = leader_id;
                true
            } else {
                false
            }
        });
        self.applied_tx.send_if_modified(|current| {
            if *current != last_applied {
                *current = last_applied;
                true
            } else {
                false
            }
        });
        self.commit_tx.send_if_modified(|current| {
            if *current != commit_index {
                *current = commit_index;
                true
            } else {
                false
            }
        });
    }

    fn reset_election_deadline(&self) -> Instant {
        let timeout = rand::thread_rng().gen_range(
            self.config.election_timeout_min..=self.config.election_timeout_max,
        );
        Instant::now() + timeout
    }
}

#[cfg(test)]
mod tests {
    use super::super::rpc::mock::MockTransport;
    use super::*;
    use crate::raft::StateMachine;
    use tempfile::tempdir;

    struct RecordingMachine {
        applied: Vec<Vec<u8>>,
    }

    impl StateMachine for RecordingMachine {
        fn apply(&mut self, command: &[u8]) {
            self.applied.push(command.to_vec());
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(bincode::serialize(&self.applied)?)
        }

        fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
            self.applied = bincode::deserialize(snapshot)?;
            Ok(())
        }
    }

    fn test_node(
        dir: &std::path::Path,
        peers: Vec<PeerId>,
    ) -> (
        RaftNode<RecordingMachine>,
        mpsc::Receiver<RaftCommand>,
        RaftHandle,
    ) {
        let config = RaftConfig {
            node_id: 1,
            initial_peers: peers,
            ..Default::default()
        };
        let storage = Arc::new(RaftStorage::open(dir).unwrap());
        let machine = RecordingMachine { applied: Vec::new() };
        let transport = Arc::new(MockTransport::new());
        RaftNode::new(config, storage, machine, transport).unwrap()
    }

    #[tokio::test]
    async fn test_node_starts_as_follower() {
        let dir = tempdir().unwrap();
        let (node, _rx, _handle) = test_node(dir.path(), vec![2]);
        assert!(!node.state.read().is_leader());
    }

    #[tokio::test]
    async fn test_single_node_becomes_leader_and_applies() {
        let dir = tempdir().unwrap();
        let (node, rx, handle) = test_node(dir.path(), vec![]);

        let command_tx = node.command_sender();
        let join = tokio::spawn(node.run(rx));

        // Wait for self-election.
        let mut leader = handle.leader.clone();
        tokio::time::timeout(Duration::from_secs(2), async {
            while leader.borrow_and_update().is_none() {
                leader.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let (tx, rx2) = oneshot::channel();
        command_tx
            .send(RaftCommand::Propose {
                command: vec![42],
                response: tx,
            })
            .await
            .unwrap();
        let index = rx2.await.unwrap().unwrap();
        assert_eq!(index, 1);

        // The applied watch catches up to the proposed index.
        let mut applied = handle.applied.clone();
        tokio::time::timeout(Duration::from_secs(2), async {
            while *applied.borrow_and_update() < index {
                applied.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let (tx, rx3) = oneshot::channel();
        command_tx
            .send(RaftCommand::Shutdown { response: tx })
            .await
            .unwrap();
        rx3.await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_propose_on_follower_is_not_leader() {
        let dir = tempdir().unwrap();
        let (node, _rx, _handle) = test_node(dir.path(), vec![2, 3]);
        let err = node.handle_propose(vec![1]).await.unwrap_err();
        assert!(matches!(err, PinhiveError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn test_append_entries_rejects_stale_term() {
        let dir = tempdir().unwrap();
        let (node, _rx, _handle) = test_node(dir.path(), vec![2]);
        node.state.write().become_follower(5, None);

        let response = node.handle_append_entries(AppendEntriesRequest {
            term: 3,
            leader_id: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });
        assert!(!response.success);
        assert_eq!(response.term, 5);
    }

    #[tokio::test]
    async fn test_vote_granted_once_per_term() {
        let dir = tempdir().unwrap();
        let (node, _rx, _handle) = test_node(dir.path(), vec![2, 3]);

        let request = |candidate| RequestVoteRequest {
            term: 1,
            candidate_id: candidate,
            last_log_index: 0,
            last_log_term: 0,
        };

        assert!(node.handle_request_vote(request(2)).vote_granted);
        assert!(!node.handle_request_vote(request(3)).vote_granted);
        // Repeat votes for the same candidate stay granted.
        assert!(node.handle_request_vote(request(2)).vote_granted);
    }
}
