//! The cluster coordinator.
//!
//! [`Cluster`] joins consensus, tracker, connector, informer/allocator,
//! peer manager, monitor and RPC into the public API the REST surface
//! mirrors. Mutations go through the replicated log (leader-forwarded);
//! reads fan out to every peer and aggregate, tolerating partial failure.

use crate::allocator::PinAllocator;
use crate::config::ClusterConfig;
use crate::connector::DaemonConnector;
use crate::consensus::{Consensus, MembershipEvent};
use crate::error::{PinhiveError, Result};
use crate::informer::Informer;
use crate::monitor::{MetricsMonitor, METRIC_BROADCAST_INTERVAL};
use crate::peers::{AddressBook, PeerManager};
use crate::rpc::{RaftHttpTransport, RpcClient};
use crate::shutdown::ShutdownCoordinator;
use crate::state::PinState;
use crate::tracker::{MapPinTracker, TrackerConfig};
use crate::types::{
    Cid, ClusterIdentity, GlobalPinInfo, Metric, PeerAddr, PeerId, PinInfo, PinSpec,
    TrackerStatus,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Grace period between committing our own removal and tearing the
/// process down, so the RPC that asked for it can unwind.
const SELF_EVICTION_GRACE: Duration = Duration::from_secs(1);

/// Per-pin options carried by the REST surface and CLI.
#[derive(Debug, Clone, Default)]
pub struct PinOptions {
    /// Overrides the configured replication factor. Zero or negative
    /// means pin on every peer.
    pub replication_factor: Option<i32>,
    pub name: Option<String>,
}

/// The coordinator: one per peer, wired over every other component.
pub struct Cluster {
    local: PeerAddr,
    config: Arc<Mutex<ClusterConfig>>,
    state: Arc<PinState>,
    consensus: Arc<Consensus>,
    tracker: Arc<MapPinTracker>,
    connector: Arc<dyn DaemonConnector>,
    informer: Arc<dyn Informer>,
    allocator: Arc<dyn PinAllocator>,
    monitor: Arc<MetricsMonitor>,
    peer_manager: Arc<PeerManager>,
    rpc: Arc<RpcClient>,
    shutdown: ShutdownCoordinator,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    evicted: std::sync::atomic::AtomicBool,
}

impl Cluster {
    /// Build the coordinator and start its background tasks. The servers
    /// (RPC, REST, proxy) are started separately by [`crate::run`].
    pub fn new(
        config: ClusterConfig,
        connector: Arc<dyn DaemonConnector>,
        informer: Arc<dyn Informer>,
        allocator: Arc<dyn PinAllocator>,
        shutdown: ShutdownCoordinator,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let local = config.advertised_addr();
        let secret = config.secret.clone();
        let data_folder = config.consensus_data_folder.clone();
        let initial_peer_addrs = config.cluster_peers.clone();
        let tracker_config = TrackerConfig {
            local_peer: local.peer,
            pin_queue_size: config.pin_queue_size,
            pinning_timeout: config.pinning_timeout,
            unpinning_timeout: config.unpinning_timeout,
        };
        let config = Arc::new(Mutex::new(config));

        let book: AddressBook = Arc::new(parking_lot::RwLock::new(HashMap::new()));
        let peer_manager = Arc::new(PeerManager::new(
            local.clone(),
            Arc::clone(&book),
            Arc::clone(&config),
        ));
        peer_manager.import(&initial_peer_addrs);

        let rpc = Arc::new(RpcClient::new(Arc::clone(&book), secret.clone()));
        let transport = Arc::new(RaftHttpTransport::new(Arc::clone(&book), secret));

        let state = Arc::new(PinState::new());
        let initial_peers = peer_manager.remote_peers();
        let (consensus, membership_rx) = Consensus::new(
            local.peer,
            initial_peers,
            &data_folder,
            Arc::clone(&state),
            transport,
            Arc::clone(&rpc),
            &shutdown,
        )?;

        let tracker = MapPinTracker::new(tracker_config, Arc::clone(&connector), &shutdown);

        let cluster = Arc::new(Self {
            local,
            config,
            state,
            consensus,
            tracker,
            connector,
            informer,
            allocator,
            monitor: Arc::new(MetricsMonitor::new()),
            peer_manager,
            rpc,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            evicted: std::sync::atomic::AtomicBool::new(false),
        });

        let mut tasks = vec![
            tokio::spawn(Self::membership_listener(
                Arc::clone(&cluster),
                membership_rx,
            )),
            tokio::spawn(Self::metrics_loop(Arc::clone(&cluster))),
            tokio::spawn(Self::initial_state_sync(Arc::clone(&cluster))),
        ];
        cluster.tasks.lock().append(&mut tasks);

        Ok(cluster)
    }

    // ---- accessors used by the RPC and REST servers ----

    pub fn local_peer(&self) -> PeerId {
        self.local.peer
    }

    pub fn local_addr(&self) -> &PeerAddr {
        &self.local
    }

    pub fn consensus(&self) -> &Consensus {
        &self.consensus
    }

    pub fn tracker(&self) -> &MapPinTracker {
        &self.tracker
    }

    pub fn connector(&self) -> &dyn DaemonConnector {
        self.connector.as_ref()
    }

    pub fn monitor(&self) -> &MetricsMonitor {
        &self.monitor
    }

    pub fn peer_manager(&self) -> &PeerManager {
        &self.peer_manager
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn secret(&self) -> Option<String> {
        self.config.lock().secret.clone()
    }

    // ---- identity and version ----

    pub fn version(&self) -> &'static str {
        crate::VERSION
    }

    /// Identity of the local peer, including the daemon's when reachable.
    pub async fn id(&self) -> ClusterIdentity {
        let daemon_id = match self.connector.id().await {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(error = %e, "daemon identity unavailable");
                None
            }
        };
        ClusterIdentity {
            peer: self.local.peer,
            addresses: vec![self.local.clone()],
            version: crate::VERSION.to_string(),
            daemon_id,
            error: None,
        }
    }

    /// Resolves once consensus has bootstrapped.
    pub async fn wait_ready(&self) -> Result<()> {
        self.consensus.wait_ready().await
    }

    // ---- pinning ----

    /// Commit a pin to the shared state and fan `Track` out to the
    /// cluster.
    pub async fn pin(&self, cid: Cid, opts: PinOptions) -> Result<()> {
        let spec = self.allocate(&cid, &opts).await?;
        self.consensus.log_pin(spec.clone()).await?;

        // Every peer hears about the pin: allocated peers pin, the rest
        // mark the CID remote. Fan-out is best effort; sync converges
        // stragglers.
        self.for_each_peer("track", |peer| {
            let spec = spec.clone();
            async move {
                if self.is_local(peer) {
                    self.tracker.track(spec).await
                } else {
                    self.rpc.track(peer, &spec).await
                }
            }
        })
        .await;
        Ok(())
    }

    /// Commit an unpin and fan `Untrack` out to the cluster.
    pub async fn unpin(&self, cid: &Cid) -> Result<()> {
        self.consensus.log_unpin(cid).await?;

        self.for_each_peer("untrack", |peer| {
            let cid = cid.clone();
            async move {
                if self.is_local(peer) {
                    self.tracker.untrack(&cid).await
                } else {
                    self.rpc.untrack(peer, &cid).await
                }
            }
        })
        .await;
        Ok(())
    }

    /// The agreed pin set.
    pub fn pin_list(&self) -> Vec<PinSpec> {
        self.state.list()
    }

    /// Resolve the allocation set for a new pin.
    async fn allocate(&self, cid: &Cid, opts: &PinOptions) -> Result<PinSpec> {
        let (factor, everywhere) = {
            let config = self.config.lock();
            let factor = opts
                .replication_factor
                .unwrap_or(config.replication_factor);
            (factor, factor <= 0)
        };

        let mut spec = if everywhere {
            PinSpec::everywhere(cid.clone())
        } else {
            let allocations = self.resolve_allocations(cid, factor as usize).await?;
            PinSpec::new(cid.clone(), allocations)
        };
        spec.name = opts.name.clone();
        Ok(spec)
    }

    /// Pick `factor` peers for a CID: current holders keep their slot,
    /// the allocator ranks the rest by fresh metrics.
    async fn resolve_allocations(&self, cid: &Cid, factor: usize) -> Result<BTreeSet<PeerId>> {
        let members: BTreeSet<PeerId> =
            self.peer_manager.peers().iter().map(|p| p.peer).collect();

        // Peers already holding (or fetching) the content.
        let global = self.status(cid).await;
        let holders: Vec<PeerId> = global
            .peer_map
            .values()
            .filter(|info| {
                matches!(info.status, TrackerStatus::Pinned | TrackerStatus::Pinning)
                    && members.contains(&info.peer)
            })
            .map(|info| info.peer)
            .collect();

        let metric_name = self.informer.name();
        let mut current = HashMap::new();
        let mut candidates = HashMap::new();
        for metric in self.monitor.last_metrics(metric_name) {
            if !members.contains(&metric.peer) {
                continue;
            }
            if holders.contains(&metric.peer) {
                current.insert(metric.peer, metric);
            } else {
                candidates.insert(metric.peer, metric);
            }
        }

        let ranked = self.allocator.allocate(cid, &current, &candidates)?;

        let mut allocations: BTreeSet<PeerId> = BTreeSet::new();
        for peer in holders.into_iter().chain(ranked) {
            if allocations.len() >= factor {
                break;
            }
            allocations.insert(peer);
        }

        if allocations.len() < factor {
            return Err(PinhiveError::Allocation(format!(
                "not enough candidate peers for {cid}: need {factor}, have {}",
                allocations.len()
            )));
        }
        Ok(allocations)
    }

    // ---- global status aggregation ----

    /// Cluster-wide view of one CID. Unreachable peers appear with a
    /// synthetic error status; the call itself does not fail for them.
    pub async fn status(&self, cid: &Cid) -> GlobalPinInfo {
        let results = self
            .for_each_peer("status", |peer| {
                let cid = cid.clone();
                async move {
                    if self.is_local(peer) {
                        Ok(self.tracker.status(&cid))
                    } else {
                        self.rpc.tracker_status(peer, &cid).await
                    }
                }
            })
            .await;
        self.aggregate_one(cid, results)
    }

    /// Cluster-wide view of every tracked CID.
    pub async fn status_all(&self) -> Vec<GlobalPinInfo> {
        let results = self
            .for_each_peer("status_all", |peer| async move {
                if self.is_local(peer) {
                    Ok(self.tracker.status_all())
                } else {
                    self.rpc.tracker_status_all(peer).await
                }
            })
            .await;
        self.aggregate_many(results)
    }

    /// Reconcile one CID on every peer.
    pub async fn sync(&self, cid: &Cid) -> GlobalPinInfo {
        let results = self
            .for_each_peer("sync", |peer| {
                let cid = cid.clone();
                async move {
                    if self.is_local(peer) {
                        match self.tracker.sync(&cid).await {
                            Ok(info) => Ok(info),
                            // The entry carries the error state already.
                            Err(_) => Ok(self.tracker.status(&cid)),
                        }
                    } else {
                        self.rpc.tracker_sync(peer, &cid).await
                    }
                }
            })
            .await;
        self.aggregate_one(cid, results)
    }

    /// Reconcile every CID on every peer; returns the entries that
    /// changed or are in error.
    pub async fn sync_all(&self) -> Vec<GlobalPinInfo> {
        let results = self
            .for_each_peer("sync_all", |peer| async move {
                if self.is_local(peer) {
                    match self.tracker.sync_all().await {
                        Ok(updated) => Ok(updated),
                        Err(_) => Ok(self.tracker.status_all()),
                    }
                } else {
                    self.rpc.tracker_sync_all(peer).await
                }
            })
            .await;
        self.aggregate_many(results)
    }

    /// Retry a CID in error state on every peer.
    pub async fn recover(&self, cid: &Cid) -> GlobalPinInfo {
        let results = self
            .for_each_peer("recover", |peer| {
                let cid = cid.clone();
                async move {
                    if self.is_local(peer) {
                        match self.tracker.recover(&cid).await {
                            Ok(info) => Ok(info),
                            Err(_) => Ok(self.tracker.status(&cid)),
                        }
                    } else {
                        self.rpc.tracker_recover(peer, &cid).await
                    }
                }
            })
            .await;
        self.aggregate_one(cid, results)
    }

    /// Reconcile one CID against the local daemon only.
    pub async fn sync_local(&self, cid: &Cid) -> Result<PinInfo> {
        self.tracker.sync(cid).await
    }

    /// Reconcile every local CID against the daemon.
    pub async fn sync_all_local(&self) -> Result<Vec<PinInfo>> {
        self.tracker.sync_all().await
    }

    /// Align the local tracker with the agreed state: track everything
    /// the state lists, untrack what it does not. Returns changed
    /// entries.
    pub async fn state_sync(&self) -> Result<Vec<PinInfo>> {
        debug!("syncing tracker to agreed state");
        let mut changed = Vec::new();

        for spec in self.state.list() {
            if self.tracker.status(&spec.cid).status == TrackerStatus::Unpinned {
                let cid = spec.cid.clone();
                let _ = self.tracker.track(spec).await;
                changed.push(self.tracker.status(&cid));
            }
        }
        for info in self.tracker.status_all() {
            if !self.state.has(&info.cid) {
                let _ = self.tracker.untrack(&info.cid).await;
                changed.push(self.tracker.status(&info.cid));
            }
        }
        Ok(changed)
    }

    // ---- membership ----

    /// Identities of every cluster peer.
    pub async fn peers(&self) -> Vec<ClusterIdentity> {
        let results = self
            .for_each_peer("id", |peer| async move {
                if self.is_local(peer) {
                    Ok(self.id().await)
                } else {
                    self.rpc.id(peer).await
                }
            })
            .await;

        results
            .into_iter()
            .map(|(peer, result)| match result {
                Ok(identity) => identity,
                Err(e) => ClusterIdentity {
                    peer,
                    addresses: self.peer_manager.addr_of(peer).into_iter().collect(),
                    version: String::new(),
                    daemon_id: None,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }

    /// Add a peer to the cluster through the log.
    pub async fn peer_add(&self, addr: &PeerAddr) -> Result<ClusterIdentity> {
        if addr.peer == self.local.peer {
            return Ok(self.id().await);
        }

        // Record the address first so the commit and later RPCs can dial.
        self.peer_manager.add(addr);
        self.consensus.log_add_peer(addr).await?;

        Ok(self.rpc.id(addr.peer).await.unwrap_or(ClusterIdentity {
            peer: addr.peer,
            addresses: vec![addr.clone()],
            version: String::new(),
            daemon_id: None,
            error: None,
        }))
    }

    /// Remove a peer from the cluster through the log. Removing the local
    /// peer triggers self-eviction.
    pub async fn peer_remove(&self, peer: PeerId) -> Result<()> {
        if !self.peer_manager.is_member(peer) {
            return Err(PinhiveError::PeerNotFound(peer));
        }
        self.consensus.log_rm_peer(peer).await
    }

    /// Join an existing cluster through one of its members: have it add
    /// us, then adopt its peer list.
    pub async fn join(&self, addr: &PeerAddr) -> Result<()> {
        info!(through = %addr, "joining cluster");

        self.peer_manager.add(addr);
        self.rpc.peer_add(addr.peer, &self.local).await?;

        let peers = self.rpc.peer_manager_peers(addr.peer).await?;
        for peer_addr in &peers {
            if peer_addr.peer != self.local.peer {
                self.peer_manager.add(peer_addr);
            }
        }
        info!(count = peers.len(), "adopted remote peer list");
        Ok(())
    }

    /// Try each configured bootstrap target until one join succeeds.
    pub async fn bootstrap(&self) -> Result<()> {
        let targets = self.config.lock().bootstrap.clone();
        if targets.is_empty() {
            return Ok(());
        }
        let mut last_err = None;
        for addr in targets {
            match self.join(&addr).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(through = %addr, error = %e, "bootstrap target failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| PinhiveError::Internal("no bootstrap targets".into())))
    }

    // ---- shutdown ----

    /// Stop the coordinator: optionally leave the cluster, stop consensus
    /// with a final snapshot, then stop the tracker. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        use std::sync::atomic::Ordering;

        let leave = self.config.lock().leave_on_shutdown;
        if leave && !self.evicted.load(Ordering::SeqCst) {
            info!("leaving cluster on shutdown");
            match self.consensus.log_rm_peer(self.local.peer).await {
                // The eviction task takes it from here; give it time to
                // finish the snapshot-then-wipe sequence.
                Ok(()) => {
                    let _ = tokio::time::timeout(
                        Duration::from_secs(10),
                        self.shutdown.wait_for_shutdown(),
                    )
                    .await;
                }
                Err(e) => warn!(error = %e, "could not leave cluster cleanly"),
            }
        }

        self.shutdown.shutdown();
        self.consensus.shutdown().await?;
        self.tracker.shutdown().await;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!("cluster coordinator stopped");
        Ok(())
    }

    // ---- background tasks ----

    /// Applies committed membership changes to the peer set and the Raft
    /// transport; handles self-eviction.
    async fn membership_listener(
        cluster: Arc<Self>,
        mut membership_rx: mpsc::UnboundedReceiver<MembershipEvent>,
    ) {
        while let Some(event) = membership_rx.recv().await {
            match &event {
                MembershipEvent::Added(addr) => {
                    if addr.peer != cluster.local.peer {
                        cluster.peer_manager.add(addr);
                    }
                    cluster.consensus.apply_membership(&event).await;
                }
                MembershipEvent::Removed(peer) => {
                    let peer = *peer;
                    cluster.peer_manager.remove(peer);
                    cluster.monitor.forget_peer(peer);
                    cluster.consensus.apply_membership(&event).await;

                    if peer == cluster.local.peer {
                        warn!("this peer was removed from the cluster and will shut down");
                        let cluster = Arc::clone(&cluster);
                        tokio::spawn(async move {
                            cluster.self_evict().await;
                        });
                        return;
                    }
                }
            }
        }
    }

    /// Ordered teardown after eviction: grace, final snapshot via
    /// consensus shutdown, then wipe the log so a restart is not confused
    /// by membership history.
    async fn self_evict(&self) {
        self.evicted
            .store(true, std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(SELF_EVICTION_GRACE).await;
        self.peer_manager.reset();
        self.peer_manager.empty_persisted_peers();
        if let Err(e) = self.consensus.shutdown().await {
            error!(error = %e, "consensus shutdown during eviction failed");
        } else if let Err(e) = self.consensus.destroy_log() {
            error!(error = %e, "wiping consensus log failed");
        }
        self.shutdown.shutdown();
    }

    /// Periodically measures the local peer and broadcasts the metric.
    async fn metrics_loop(cluster: Arc<Self>) {
        let mut ticker = tokio::time::interval(METRIC_BROADCAST_INTERVAL);
        let mut shutdown = cluster.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let metric = cluster.informer.metric().await;
                    cluster.monitor.log_metric(metric.clone());
                    cluster.broadcast_metric(metric).await;
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn broadcast_metric(&self, metric: Metric) {
        if !metric.valid {
            return;
        }
        let sends = self.peer_manager.remote_peers().into_iter().map(|peer| {
            let metric = metric.clone();
            async move {
                if let Err(e) = self.rpc.monitor_log_metric(peer, &metric).await {
                    debug!(peer, error = %e, "metric broadcast failed");
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    /// Once consensus is ready, align the tracker with the restored
    /// state.
    async fn initial_state_sync(cluster: Arc<Self>) {
        if cluster.consensus.wait_ready().await.is_err() {
            return;
        }
        if let Err(e) = cluster.state_sync().await {
            warn!(error = %e, "initial state sync failed");
        }
    }

    // ---- fan-out plumbing ----

    fn is_local(&self, peer: PeerId) -> bool {
        peer == self.local.peer
    }

    /// Run `f` against every cluster member in parallel and collect the
    /// per-peer outcomes. Individual failures are logged, never fatal.
    async fn for_each_peer<'a, F, Fut, T>(&'a self, what: &str, f: F) -> Vec<(PeerId, Result<T>)>
    where
        F: Fn(PeerId) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let peers: Vec<PeerId> = self.peer_manager.peers().iter().map(|p| p.peer).collect();
        let calls = peers.into_iter().map(|peer| {
            let fut = f(peer);
            async move { (peer, fut.await) }
        });
        let results = futures::future::join_all(calls).await;
        for (peer, result) in &results {
            if let Err(e) = result {
                warn!(peer, what, error = %e, "peer call failed");
            }
        }
        results
    }

    /// Merge per-peer records for one CID, synthesising error entries for
    /// unreachable peers.
    fn aggregate_one(&self, cid: &Cid, results: Vec<(PeerId, Result<PinInfo>)>) -> GlobalPinInfo {
        let mut global = GlobalPinInfo::new(cid.clone());
        for (peer, result) in results {
            match result {
                Ok(info) => global.add(info),
                Err(e) => global.add(PinInfo {
                    cid: cid.clone(),
                    peer,
                    status: TrackerStatus::ClusterError,
                    timestamp: Utc::now(),
                    error: Some(e.to_string()),
                }),
            }
        }
        global
    }

    /// Merge per-peer record lists into per-CID global views. Peers that
    /// failed entirely appear as error entries on every known CID.
    fn aggregate_many(
        &self,
        results: Vec<(PeerId, Result<Vec<PinInfo>>)>,
    ) -> Vec<GlobalPinInfo> {
        let mut by_cid: BTreeMap<Cid, GlobalPinInfo> = BTreeMap::new();
        let mut failed_peers = Vec::new();

        for (peer, result) in results {
            match result {
                Ok(infos) => {
                    for info in infos {
                        by_cid
                            .entry(info.cid.clone())
                            .or_insert_with(|| GlobalPinInfo::new(info.cid.clone()))
                            .add(info);
                    }
                }
                Err(e) => failed_peers.push((peer, e.to_string())),
            }
        }

        for (peer, error) in failed_peers {
            for (cid, global) in by_cid.iter_mut() {
                global.add(PinInfo {
                    cid: cid.clone(),
                    peer,
                    status: TrackerStatus::ClusterError,
                    timestamp: Utc::now(),
                    error: Some(error.clone()),
                });
            }
        }

        by_cid.into_values().collect()
    }
}
