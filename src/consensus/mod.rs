//! Replicated-log consensus over the pin set.
//!
//! Wraps the Raft node behind the cluster-facing contract: serialised
//! commits with leader redirection and retry, membership changes that flow
//! through the log before touching the transport configuration, a ready
//! signal for bootstrap, and crash-safe snapshots.

use crate::error::{PinhiveError, Result};
use crate::raft::{
    RaftCommand, RaftConfig, RaftHandle, RaftNode, RaftStorage, RaftTransport, StateMachine,
};
use crate::rpc::RpcClient;
use crate::shutdown::ShutdownCoordinator;
use crate::state::PinState;
use crate::types::{Cid, PeerAddr, PeerId, PinSpec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long operations wait for a leader before failing.
pub const LEADER_TIMEOUT: Duration = Duration::from_secs(15);

/// How many times a failed commit is retried before giving up.
pub const COMMIT_RETRIES: u32 = 2;

const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// An entry in the replicated log. Idempotent at apply time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOp {
    Pin(PinSpec),
    Unpin(Cid),
    AddPeer(PeerAddr),
    RemovePeer(PeerId),
}

/// Membership change observed by the FSM, to be applied to the peer set
/// and the transport configuration outside the apply path.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Added(PeerAddr),
    Removed(PeerId),
}

/// The deterministic state machine the log drives: the pin set plus a
/// side channel for membership ops.
pub struct PinStateMachine {
    state: Arc<PinState>,
    membership_tx: mpsc::UnboundedSender<MembershipEvent>,
}

impl PinStateMachine {
    pub fn new(state: Arc<PinState>, membership_tx: mpsc::UnboundedSender<MembershipEvent>) -> Self {
        Self {
            state,
            membership_tx,
        }
    }
}

impl StateMachine for PinStateMachine {
    fn apply(&mut self, command: &[u8]) {
        let op: LogOp = match bincode::deserialize(command) {
            Ok(op) => op,
            Err(e) => {
                error!(error = %e, "undecodable log entry, skipping");
                return;
            }
        };

        match op {
            LogOp::Pin(spec) => {
                debug!(cid = %spec.cid, "applying pin");
                self.state.add(spec);
            }
            LogOp::Unpin(cid) => {
                debug!(%cid, "applying unpin");
                self.state.remove(&cid);
            }
            LogOp::AddPeer(addr) => {
                let _ = self.membership_tx.send(MembershipEvent::Added(addr));
            }
            LogOp::RemovePeer(peer) => {
                let _ = self.membership_tx.send(MembershipEvent::Removed(peer));
            }
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        self.state.to_snapshot_bytes()
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        self.state.restore_snapshot_bytes(snapshot)
    }
}

/// Consensus component: one per peer.
pub struct Consensus {
    local: PeerId,
    handle: RaftHandle,
    state: Arc<PinState>,
    storage: Arc<RaftStorage>,
    rpc: Arc<RpcClient>,
    ready_rx: watch::Receiver<bool>,
    raft_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_done: tokio::sync::Mutex<bool>,
}

impl Consensus {
    /// Build and start the consensus component. Returns the membership
    /// event stream for the coordinator's listener.
    pub fn new(
        local: PeerId,
        initial_peers: Vec<PeerId>,
        data_folder: &std::path::Path,
        state: Arc<PinState>,
        transport: Arc<dyn RaftTransport>,
        rpc: Arc<RpcClient>,
        shutdown: &ShutdownCoordinator,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<MembershipEvent>)> {
        std::fs::create_dir_all(data_folder)?;
        let storage = Arc::new(RaftStorage::open(data_folder)?);

        let (membership_tx, membership_rx) = mpsc::unbounded_channel();
        let fsm = PinStateMachine::new(Arc::clone(&state), membership_tx);

        let raft_config = RaftConfig {
            node_id: local,
            initial_peers,
            ..Default::default()
        };
        let (node, command_rx, handle) =
            RaftNode::new(raft_config, Arc::clone(&storage), fsm, transport)?;

        info!(node_id = local, "starting consensus and waiting for a leader");
        let raft_task = tokio::spawn(node.run(command_rx));

        let (ready_tx, ready_rx) = watch::channel(false);
        tokio::spawn(Self::finish_bootstrap(
            handle.clone(),
            ready_tx,
            shutdown.clone(),
        ));

        let consensus = Arc::new(Self {
            local,
            handle,
            state,
            storage,
            rpc,
            ready_rx,
            raft_task: Mutex::new(Some(raft_task)),
            shutdown_done: tokio::sync::Mutex::new(false),
        });

        Ok((consensus, membership_rx))
    }

    /// Fires the ready signal once a leader exists and the local FSM has
    /// caught up to the commit index.
    async fn finish_bootstrap(
        handle: RaftHandle,
        ready_tx: watch::Sender<bool>,
        shutdown: ShutdownCoordinator,
    ) {
        let wait = async {
            let mut leader = handle.leader.clone();
            while leader.borrow_and_update().is_none() {
                if leader.changed().await.is_err() {
                    return;
                }
            }

            let target = *handle.commit.borrow();
            let mut applied = handle.applied.clone();
            while *applied.borrow_and_update() < target {
                if applied.changed().await.is_err() {
                    return;
                }
            }

            info!("consensus state is up to date");
            let _ = ready_tx.send(true);
        };

        tokio::select! {
            _ = wait => {}
            _ = shutdown.wait_for_shutdown() => {}
        }
    }

    /// A signal that flips to true once after bootstrap completes.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Wait for the ready signal.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow_and_update() {
            rx.changed()
                .await
                .map_err(|_| PinhiveError::ShuttingDown)?;
        }
        Ok(())
    }

    /// The agreed pin set.
    pub fn state(&self) -> Arc<PinState> {
        Arc::clone(&self.state)
    }

    /// Current leader, when one is known.
    pub fn leader(&self) -> Option<PeerId> {
        *self.handle.leader.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == Some(self.local)
    }

    /// Wait up to [`LEADER_TIMEOUT`] for a leader.
    pub async fn wait_for_leader(&self) -> Result<PeerId> {
        let mut leader = self.handle.leader.clone();
        timeout(LEADER_TIMEOUT, async {
            loop {
                if let Some(l) = *leader.borrow_and_update() {
                    return Ok(l);
                }
                leader
                    .changed()
                    .await
                    .map_err(|_| PinhiveError::ShuttingDown)?;
            }
        })
        .await
        .map_err(|_| PinhiveError::LeaderTimeout)?
    }

    /// Commit an op on the local node. Fails with `NotLeader` when this
    /// peer does not lead; returns once the local FSM has applied the op.
    pub async fn commit(&self, op: &LogOp) -> Result<()> {
        let data = bincode::serialize(op)?;
        let (tx, rx) = oneshot::channel();
        self.handle
            .command_tx
            .send(RaftCommand::Propose {
                command: data,
                response: tx,
            })
            .await
            .map_err(|_| PinhiveError::ShuttingDown)?;
        let index = rx
            .await
            .map_err(|_| PinhiveError::Consensus("raft node dropped the proposal".into()))??;

        // The commit is observable once the FSM has applied it locally.
        let mut applied = self.handle.applied.clone();
        timeout(LEADER_TIMEOUT, async {
            while *applied.borrow_and_update() < index {
                applied
                    .changed()
                    .await
                    .map_err(|_| PinhiveError::ShuttingDown)?;
            }
            Ok(())
        })
        .await
        .map_err(|_| PinhiveError::Timeout("waiting for commit to apply".into()))?
    }

    /// The leader-forward-and-retry helper every mutating operation goes
    /// through: find the leader, run locally when it is us, otherwise
    /// forward the same method to the leader; retry transient failures.
    async fn commit_redirect<Fwd, FwdFut>(&self, op: LogOp, forward: Fwd) -> Result<()>
    where
        Fwd: Fn(PeerId) -> FwdFut,
        FwdFut: Future<Output = Result<()>>,
    {
        let mut last_err = None;
        for attempt in 0..=COMMIT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(COMMIT_RETRY_DELAY).await;
            }
            debug!(attempt, "trying to commit log operation");

            let leader = match self.wait_for_leader().await {
                Ok(l) => l,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };

            let result = if leader == self.local {
                self.commit(&op).await
            } else {
                forward(leader).await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, attempt, "commit attempt failed");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(PinhiveError::LeaderTimeout))
    }

    /// Submit a pin to the shared state, forwarding to the leader when
    /// necessary.
    pub async fn log_pin(&self, spec: PinSpec) -> Result<()> {
        let rpc = Arc::clone(&self.rpc);
        let forward_spec = spec.clone();
        self.commit_redirect(LogOp::Pin(spec.clone()), move |leader| {
            let rpc = Arc::clone(&rpc);
            let spec = forward_spec.clone();
            async move { rpc.consensus_log_pin(leader, &spec).await }
        })
        .await?;
        info!(cid = %spec.cid, "pin committed to global state");
        Ok(())
    }

    /// Remove a pin from the shared state, forwarding to the leader when
    /// necessary.
    pub async fn log_unpin(&self, cid: &Cid) -> Result<()> {
        let rpc = Arc::clone(&self.rpc);
        let forward_cid = cid.clone();
        self.commit_redirect(LogOp::Unpin(cid.clone()), move |leader| {
            let rpc = Arc::clone(&rpc);
            let cid = forward_cid.clone();
            async move { rpc.consensus_log_unpin(leader, &cid).await }
        })
        .await?;
        info!(%cid, "unpin committed to global state");
        Ok(())
    }

    /// Record a new member in the log. The transport configuration follows
    /// when the membership event is applied.
    pub async fn log_add_peer(&self, addr: &PeerAddr) -> Result<()> {
        let rpc = Arc::clone(&self.rpc);
        let forward_addr = addr.clone();
        self.commit_redirect(LogOp::AddPeer(addr.clone()), move |leader| {
            let rpc = Arc::clone(&rpc);
            let addr = forward_addr.clone();
            async move { rpc.consensus_log_add_peer(leader, &addr).await }
        })
        .await?;
        info!(address = %addr, "peer committed to global state");
        Ok(())
    }

    /// Record a member's removal in the log.
    pub async fn log_rm_peer(&self, peer: PeerId) -> Result<()> {
        let rpc = Arc::clone(&self.rpc);
        self.commit_redirect(LogOp::RemovePeer(peer), move |leader| {
            let rpc = Arc::clone(&rpc);
            async move { rpc.consensus_log_rm_peer(leader, peer).await }
        })
        .await?;
        info!(peer, "peer removed from global state");
        Ok(())
    }

    /// Adjust the Raft transport configuration after a membership op has
    /// been applied. The second step of the two-step membership commit.
    pub async fn apply_membership(&self, event: &MembershipEvent) {
        let command = match event {
            MembershipEvent::Added(addr) => RaftCommand::AddPeer { peer: addr.peer },
            MembershipEvent::Removed(peer) => RaftCommand::RemovePeer { peer: *peer },
        };
        if self.handle.command_tx.send(command).await.is_err() {
            warn!("raft node is gone, membership change not applied to transport");
        }
    }

    /// Forward incoming Raft RPCs from the wire into the node.
    pub fn raft_handle(&self) -> RaftHandle {
        self.handle.clone()
    }

    /// Take a snapshot now.
    pub async fn snapshot(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.handle
            .command_tx
            .send(RaftCommand::TakeSnapshot { response: tx })
            .await
            .map_err(|_| PinhiveError::ShuttingDown)?;
        rx.await
            .map_err(|_| PinhiveError::Consensus("raft node dropped snapshot request".into()))?
    }

    /// Stop the Raft node, taking a final snapshot. Safe to call twice;
    /// concurrent callers wait for the first teardown to finish.
    pub async fn shutdown(&self) -> Result<()> {
        let mut done = self.shutdown_done.lock().await;
        if *done {
            debug!("consensus already shut down");
            return Ok(());
        }
        info!("stopping consensus component");

        let (tx, rx) = oneshot::channel();
        if self
            .handle
            .command_tx
            .send(RaftCommand::Shutdown { response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        let task = self.raft_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        *done = true;
        Ok(())
    }

    /// Wipe the on-disk log after eviction from the cluster. Call only
    /// after [`shutdown`](Self::shutdown); the final snapshot survives.
    pub fn destroy_log(&self) -> Result<()> {
        self.storage.destroy_log()
    }
}
