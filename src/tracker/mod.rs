//! Local pin tracker.
//!
//! Tracks every CID the local peer is responsible for and drives the
//! storage daemon toward the agreed state. Work is funnelled through two
//! bounded queues (pins and unpins), each drained by a single worker so the
//! daemon never sees more than one in-flight request per kind. A full
//! queue is an explicit, observable error rather than hidden buffering.

use crate::connector::DaemonConnector;
use crate::error::{PinhiveError, Result};
use crate::shutdown::ShutdownCoordinator;
use crate::types::{Cid, DaemonPinStatus, PeerId, PinInfo, PinSpec, TrackerStatus};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A pin or unpin is considered failed when its CID has stayed in
/// `Pinning`/`Unpinning` longer than these windows. Unpins are
/// metadata-only on the daemon and should settle in seconds; pins can
/// legitimately take minutes while content transfers.
pub const PINNING_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const UNPINNING_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum queued pin (and, separately, unpin) operations.
pub const PIN_QUEUE_SIZE: usize = 1024;

const ERR_PINNING_TIMEOUT: &str = "pinning operation is taking too long";
const ERR_UNPINNING_TIMEOUT: &str = "unpinning operation is taking too long";
const ERR_UNEXPECTEDLY_PINNED: &str = "the item is unexpectedly pinned on the daemon";
const ERR_UNEXPECTEDLY_UNPINNED: &str = "the item is unexpectedly not pinned on the daemon";

/// Tracker tuning knobs.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// The local peer's identity, stamped on every entry.
    pub local_peer: PeerId,
    pub pin_queue_size: usize,
    pub pinning_timeout: Duration,
    pub unpinning_timeout: Duration,
}

impl TrackerConfig {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            pin_queue_size: PIN_QUEUE_SIZE,
            pinning_timeout: PINNING_TIMEOUT,
            unpinning_timeout: UNPINNING_TIMEOUT,
        }
    }
}

/// Map-backed pin tracker. Thread-safe; all entry mutation goes through
/// [`EntryMap`] so the state machine transitions stay in one place.
pub struct MapPinTracker {
    config: TrackerConfig,
    entries: Arc<EntryMap>,
    connector: Arc<dyn DaemonConnector>,
    pin_tx: mpsc::Sender<PinSpec>,
    unpin_tx: mpsc::Sender<Cid>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// The tracked-entry table plus the single mutation helper.
struct EntryMap {
    local_peer: PeerId,
    entries: RwLock<HashMap<Cid, PinInfo>>,
}

impl EntryMap {
    fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The entry for a CID; unknown CIDs read as `Unpinned`.
    fn get(&self, cid: &Cid) -> PinInfo {
        self.entries
            .read()
            .get(cid)
            .cloned()
            .unwrap_or_else(|| self.default_entry(cid))
    }

    fn default_entry(&self, cid: &Cid) -> PinInfo {
        PinInfo {
            cid: cid.clone(),
            peer: self.local_peer,
            status: TrackerStatus::Unpinned,
            timestamp: Utc::now(),
            error: None,
        }
    }

    fn all(&self) -> Vec<PinInfo> {
        self.entries.read().values().cloned().collect()
    }

    fn tracked_cids(&self) -> Vec<Cid> {
        self.entries.read().keys().cloned().collect()
    }

    /// Transition a CID to `status`. `Unpinned` is never materialised: it
    /// deletes the entry instead.
    fn set(&self, cid: &Cid, status: TrackerStatus) {
        let mut entries = self.entries.write();
        if status == TrackerStatus::Unpinned {
            entries.remove(cid);
            return;
        }
        entries.insert(
            cid.clone(),
            PinInfo {
                cid: cid.clone(),
                peer: self.local_peer,
                status,
                timestamp: Utc::now(),
                error: None,
            },
        );
    }

    /// Move a CID into the error state matching the polarity of its
    /// current status.
    fn set_error(&self, cid: &Cid, error: &str) {
        let mut entries = self.entries.write();
        let current = entries
            .get(cid)
            .map(|e| e.status)
            .unwrap_or(TrackerStatus::Unpinned);

        let status = match current {
            TrackerStatus::Pinned | TrackerStatus::Pinning | TrackerStatus::PinError => {
                TrackerStatus::PinError
            }
            TrackerStatus::Unpinned | TrackerStatus::Unpinning | TrackerStatus::UnpinError => {
                TrackerStatus::UnpinError
            }
            // Remote entries have no operation to fail.
            TrackerStatus::Remote | TrackerStatus::ClusterError => return,
        };

        entries.insert(
            cid.clone(),
            PinInfo {
                cid: cid.clone(),
                peer: self.local_peer,
                status,
                timestamp: Utc::now(),
                error: Some(error.to_string()),
            },
        );
    }
}

impl MapPinTracker {
    /// Create the tracker and start its two queue workers.
    pub fn new(
        config: TrackerConfig,
        connector: Arc<dyn DaemonConnector>,
        shutdown: &ShutdownCoordinator,
    ) -> Arc<Self> {
        let (pin_tx, pin_rx) = mpsc::channel(config.pin_queue_size);
        let (unpin_tx, unpin_rx) = mpsc::channel(config.pin_queue_size);

        let entries = Arc::new(EntryMap::new(config.local_peer));
        let tracker = Arc::new(Self {
            config,
            entries,
            connector,
            pin_tx,
            unpin_tx,
            workers: Mutex::new(Vec::new()),
        });

        let pin_worker = tokio::spawn(Self::pin_worker(
            Arc::clone(&tracker.entries),
            Arc::clone(&tracker.connector),
            pin_rx,
            shutdown.subscribe(),
        ));
        let unpin_worker = tokio::spawn(Self::unpin_worker(
            Arc::clone(&tracker.entries),
            Arc::clone(&tracker.connector),
            unpin_rx,
            shutdown.subscribe(),
        ));
        tracker.workers.lock().push(pin_worker);
        tracker.workers.lock().push(unpin_worker);

        tracker
    }

    /// Drains the pin queue, one daemon request at a time.
    async fn pin_worker(
        entries: Arc<EntryMap>,
        connector: Arc<dyn DaemonConnector>,
        mut rx: mpsc::Receiver<PinSpec>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(spec) = rx.recv() => {
                    let _ = Self::do_pin(&entries, connector.as_ref(), &spec.cid).await;
                }
                _ = shutdown.recv() => {
                    debug!("pin worker stopping");
                    break;
                }
            }
        }
    }

    /// Drains the unpin queue, one daemon request at a time.
    async fn unpin_worker(
        entries: Arc<EntryMap>,
        connector: Arc<dyn DaemonConnector>,
        mut rx: mpsc::Receiver<Cid>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(cid) = rx.recv() => {
                    let _ = Self::do_unpin(&entries, connector.as_ref(), &cid).await;
                }
                _ = shutdown.recv() => {
                    debug!("unpin worker stopping");
                    break;
                }
            }
        }
    }

    async fn do_pin(entries: &EntryMap, connector: &dyn DaemonConnector, cid: &Cid) -> Result<()> {
        entries.set(cid, TrackerStatus::Pinning);
        match connector.pin(cid).await {
            Ok(()) => {
                entries.set(cid, TrackerStatus::Pinned);
                Ok(())
            }
            Err(e) => {
                entries.set_error(cid, &e.to_string());
                warn!(%cid, error = %e, "pin failed");
                Err(e)
            }
        }
    }

    async fn do_unpin(
        entries: &EntryMap,
        connector: &dyn DaemonConnector,
        cid: &Cid,
    ) -> Result<()> {
        match connector.unpin(cid).await {
            Ok(()) => {
                entries.set(cid, TrackerStatus::Unpinned);
                Ok(())
            }
            Err(e) => {
                entries.set_error(cid, &e.to_string());
                warn!(%cid, error = %e, "unpin failed");
                Err(e)
            }
        }
    }

    /// Start managing a CID.
    ///
    /// When the local peer is in the spec's allocation (or the pin is an
    /// everywhere pin) a pin operation is queued; otherwise any local copy
    /// is released and the entry is marked `Remote`.
    pub async fn track(&self, spec: PinSpec) -> Result<()> {
        if !spec.is_allocated_to(self.config.local_peer) {
            if self.entries.get(&spec.cid).status == TrackerStatus::Pinned {
                let _ = Self::do_unpin(&self.entries, self.connector.as_ref(), &spec.cid).await;
            }
            self.entries.set(&spec.cid, TrackerStatus::Remote);
            return Ok(());
        }

        self.entries.set(&spec.cid, TrackerStatus::Pinning);
        match self.pin_tx.try_send(spec.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let err = PinhiveError::QueueFull("pin".into());
                self.entries.set_error(&spec.cid, &err.to_string());
                error!(cid = %spec.cid, "pin queue is full");
                Err(err)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PinhiveError::ShuttingDown),
        }
    }

    /// Stop managing a CID, unpinning any local copy.
    pub async fn untrack(&self, cid: &Cid) -> Result<()> {
        self.entries.set(cid, TrackerStatus::Unpinning);
        match self.unpin_tx.try_send(cid.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let err = PinhiveError::QueueFull("unpin".into());
                self.entries.set_error(cid, &err.to_string());
                error!(%cid, "unpin queue is full");
                Err(err)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PinhiveError::ShuttingDown),
        }
    }

    /// The local record for a CID. Unknown CIDs read as `Unpinned`.
    pub fn status(&self, cid: &Cid) -> PinInfo {
        self.entries.get(cid)
    }

    /// Records for every tracked CID.
    pub fn status_all(&self) -> Vec<PinInfo> {
        self.entries.all()
    }

    /// Reconcile one CID against the daemon and return the updated record.
    ///
    /// A connector failure moves the entry into the matching error state
    /// before the error is returned; the entry stays readable via
    /// [`status`](Self::status).
    pub async fn sync(&self, cid: &Cid) -> Result<PinInfo> {
        let daemon_status = match self.connector.pin_ls_cid(cid).await {
            Ok(s) => s,
            Err(e) => {
                self.entries.set_error(cid, &e.to_string());
                return Err(e);
            }
        };
        Ok(self.sync_status(cid, daemon_status))
    }

    /// Reconcile every tracked CID against the daemon's full pin listing.
    ///
    /// Returns the records that changed or sit in an error state. When the
    /// bulk query itself fails, every tracked entry is marked with the
    /// error of its polarity before the error is returned.
    pub async fn sync_all(&self) -> Result<Vec<PinInfo>> {
        let daemon_pins = match self.connector.pin_ls("recursive").await {
            Ok(pins) => pins,
            Err(e) => {
                for cid in self.entries.tracked_cids() {
                    self.entries.set_error(&cid, &e.to_string());
                }
                return Err(e);
            }
        };

        let mut updated = Vec::new();
        for original in self.entries.all() {
            let daemon_status = daemon_pins
                .get(&original.cid)
                .copied()
                .unwrap_or(DaemonPinStatus::Unpinned);
            let new = self.sync_status(&original.cid, daemon_status);
            if new.status != original.status || new.status.is_error() {
                updated.push(new);
            }
        }
        Ok(updated)
    }

    /// Apply the reconciliation table for one CID given the daemon's view.
    fn sync_status(&self, cid: &Cid, daemon_status: DaemonPinStatus) -> PinInfo {
        let entry = self.entries.get(cid);
        if daemon_status.is_pinned() {
            match entry.status {
                TrackerStatus::Pinned => {}
                TrackerStatus::Pinning | TrackerStatus::PinError => {
                    self.entries.set(cid, TrackerStatus::Pinned);
                }
                TrackerStatus::Unpinning => {
                    if entry.age() > self.config.unpinning_timeout {
                        self.entries.set_error(cid, ERR_UNPINNING_TIMEOUT);
                    }
                }
                TrackerStatus::Unpinned => {
                    self.entries.set_error(cid, ERR_UNEXPECTEDLY_PINNED);
                }
                // UnpinError keeps its error; Remote entries are someone
                // else's business.
                TrackerStatus::UnpinError
                | TrackerStatus::Remote
                | TrackerStatus::ClusterError => {}
            }
        } else {
            match entry.status {
                TrackerStatus::Pinned => {
                    self.entries.set_error(cid, ERR_UNEXPECTEDLY_UNPINNED);
                }
                TrackerStatus::PinError => {}
                TrackerStatus::Pinning => {
                    if entry.age() > self.config.pinning_timeout {
                        self.entries.set_error(cid, ERR_PINNING_TIMEOUT);
                    }
                }
                TrackerStatus::Unpinning | TrackerStatus::UnpinError => {
                    self.entries.set(cid, TrackerStatus::Unpinned);
                }
                TrackerStatus::Unpinned
                | TrackerStatus::Remote
                | TrackerStatus::ClusterError => {}
            }
        }
        self.entries.get(cid)
    }

    /// Retry a CID stuck in an error state, synchronously and bypassing the
    /// queues. Entries in any other state are returned unchanged.
    pub async fn recover(&self, cid: &Cid) -> Result<PinInfo> {
        let entry = self.entries.get(cid);
        let result = match entry.status {
            TrackerStatus::PinError => {
                info!(%cid, "recovering pin");
                Self::do_pin(&self.entries, self.connector.as_ref(), cid).await
            }
            TrackerStatus::UnpinError => {
                info!(%cid, "recovering unpin");
                Self::do_unpin(&self.entries, self.connector.as_ref(), cid).await
            }
            _ => return Ok(entry),
        };

        match result {
            Ok(()) => Ok(self.entries.get(cid)),
            Err(e) => {
                warn!(%cid, error = %e, "recovery failed");
                Err(e)
            }
        }
    }

    /// Wait for the queue workers to finish after the shared shutdown
    /// signal has fired.
    pub async fn shutdown(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        info!("pin tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    /// Connector whose behaviour is scripted per test.
    struct ScriptedConnector {
        fail_pins: AtomicBool,
        stall_pins: AtomicBool,
        pins: Mutex<HashMap<Cid, DaemonPinStatus>>,
    }

    impl ScriptedConnector {
        fn healthy() -> Arc<Self> {
            Arc::new(Self {
                fail_pins: AtomicBool::new(false),
                stall_pins: AtomicBool::new(false),
                pins: Mutex::new(HashMap::new()),
            })
        }

        fn failing() -> Arc<Self> {
            let c = Self::healthy();
            c.fail_pins.store(true, Ordering::SeqCst);
            c
        }

        fn heal(&self) {
            self.fail_pins.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl DaemonConnector for ScriptedConnector {
        async fn id(&self) -> Result<String> {
            Ok("daemon-test".into())
        }

        async fn pin(&self, cid: &Cid) -> Result<()> {
            if self.stall_pins.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
            if self.fail_pins.load(Ordering::SeqCst) {
                return Err(PinhiveError::Daemon("daemon rejected pin".into()));
            }
            self.pins.lock().insert(cid.clone(), DaemonPinStatus::Pinned);
            Ok(())
        }

        async fn unpin(&self, cid: &Cid) -> Result<()> {
            self.pins.lock().remove(cid);
            Ok(())
        }

        async fn pin_ls_cid(&self, cid: &Cid) -> Result<DaemonPinStatus> {
            Ok(self
                .pins
                .lock()
                .get(cid)
                .copied()
                .unwrap_or(DaemonPinStatus::Unpinned))
        }

        async fn pin_ls(&self, _filter: &str) -> Result<HashMap<Cid, DaemonPinStatus>> {
            Ok(self.pins.lock().clone())
        }
    }

    fn tracker_with(connector: Arc<ScriptedConnector>) -> (Arc<MapPinTracker>, ShutdownCoordinator)
    {
        let shutdown = ShutdownCoordinator::new();
        let tracker = MapPinTracker::new(TrackerConfig::new(1), connector, &shutdown);
        (tracker, shutdown)
    }

    fn spec_for(cid: &str, peers: &[PeerId]) -> PinSpec {
        PinSpec::new(cid.parse().unwrap(), peers.iter().copied().collect())
    }

    async fn wait_for_status(tracker: &MapPinTracker, cid: &Cid, status: TrackerStatus) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if tracker.status(cid).status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "cid {cid} never reached {status}, stuck at {}",
                tracker.status(cid).status
            )
        });
    }

    #[tokio::test]
    async fn test_track_reaches_pinned() {
        let (tracker, _shutdown) = tracker_with(ScriptedConnector::healthy());
        let cid: Cid = "QmA".parse().unwrap();

        tracker.track(spec_for("QmA", &[1])).await.unwrap();
        wait_for_status(&tracker, &cid, TrackerStatus::Pinned).await;
    }

    #[tokio::test]
    async fn test_track_remote_allocation() {
        let (tracker, _shutdown) = tracker_with(ScriptedConnector::healthy());
        let cid: Cid = "QmA".parse().unwrap();

        tracker.track(spec_for("QmA", &[2, 3])).await.unwrap();
        assert_eq!(tracker.status(&cid).status, TrackerStatus::Remote);
    }

    #[tokio::test]
    async fn test_everywhere_pin_is_local() {
        let (tracker, _shutdown) = tracker_with(ScriptedConnector::healthy());
        let cid: Cid = "QmA".parse().unwrap();

        let mut spec = spec_for("QmA", &[]);
        spec.everywhere = true;
        tracker.track(spec).await.unwrap();
        wait_for_status(&tracker, &cid, TrackerStatus::Pinned).await;
    }

    #[tokio::test]
    async fn test_daemon_failure_sets_pin_error_and_recover_heals() {
        let connector = ScriptedConnector::failing();
        let (tracker, _shutdown) = tracker_with(Arc::clone(&connector));
        let cid: Cid = "QmE".parse().unwrap();

        tracker.track(spec_for("QmE", &[1])).await.unwrap();
        wait_for_status(&tracker, &cid, TrackerStatus::PinError).await;
        assert!(tracker.status(&cid).error.is_some());

        connector.heal();
        let info = tracker.recover(&cid).await.unwrap();
        assert_eq!(info.status, TrackerStatus::Pinned);
        assert!(info.error.is_none());
    }

    #[tokio::test]
    async fn test_recover_outside_error_states_is_noop() {
        let (tracker, _shutdown) = tracker_with(ScriptedConnector::healthy());
        let cid: Cid = "QmA".parse().unwrap();

        tracker.track(spec_for("QmA", &[1])).await.unwrap();
        wait_for_status(&tracker, &cid, TrackerStatus::Pinned).await;

        let info = tracker.recover(&cid).await.unwrap();
        assert_eq!(info.status, TrackerStatus::Pinned);
    }

    #[tokio::test]
    async fn test_untrack_removes_entry() {
        let connector = ScriptedConnector::healthy();
        let (tracker, _shutdown) = tracker_with(Arc::clone(&connector));
        let cid: Cid = "QmA".parse().unwrap();

        tracker.track(spec_for("QmA", &[1])).await.unwrap();
        wait_for_status(&tracker, &cid, TrackerStatus::Pinned).await;

        tracker.untrack(&cid).await.unwrap();
        wait_for_status(&tracker, &cid, TrackerStatus::Unpinned).await;
        assert!(tracker.status_all().is_empty());
        assert!(connector.pins.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_detects_unexpectedly_pinned() {
        let connector = ScriptedConnector::healthy();
        let (tracker, _shutdown) = tracker_with(Arc::clone(&connector));
        let cid: Cid = "QmX".parse().unwrap();

        // Pin directly on the daemon, behind the cluster's back.
        connector.pin(&cid).await.unwrap();

        let info = tracker.sync(&cid).await.unwrap();
        assert_eq!(info.status, TrackerStatus::PinError);
        assert_eq!(info.error.as_deref(), Some(ERR_UNEXPECTEDLY_PINNED));
    }

    #[tokio::test]
    async fn test_sync_detects_unexpectedly_unpinned() {
        let connector = ScriptedConnector::healthy();
        let (tracker, _shutdown) = tracker_with(Arc::clone(&connector));
        let cid: Cid = "QmA".parse().unwrap();

        tracker.track(spec_for("QmA", &[1])).await.unwrap();
        wait_for_status(&tracker, &cid, TrackerStatus::Pinned).await;

        // Remove behind the tracker's back.
        connector.unpin(&cid).await.unwrap();

        let info = tracker.sync(&cid).await.unwrap();
        assert_eq!(info.status, TrackerStatus::PinError);
        assert_eq!(info.error.as_deref(), Some(ERR_UNEXPECTEDLY_UNPINNED));
    }

    #[tokio::test]
    async fn test_sync_pinning_timeout() {
        let connector = ScriptedConnector::healthy();
        let shutdown = ShutdownCoordinator::new();
        let mut config = TrackerConfig::new(1);
        config.pinning_timeout = Duration::ZERO;
        let tracker = MapPinTracker::new(config, connector, &shutdown);
        let cid: Cid = "QmSlow".parse().unwrap();

        // Force a stuck Pinning entry without letting the worker run it.
        tracker.entries.set(&cid, TrackerStatus::Pinning);

        let info = tracker.sync(&cid).await.unwrap();
        assert_eq!(info.status, TrackerStatus::PinError);
        assert_eq!(info.error.as_deref(), Some(ERR_PINNING_TIMEOUT));
    }

    #[tokio::test]
    async fn test_sync_unpinning_converges_to_unpinned() {
        let connector = ScriptedConnector::healthy();
        let (tracker, _shutdown) = tracker_with(connector);
        let cid: Cid = "QmA".parse().unwrap();

        tracker.entries.set(&cid, TrackerStatus::Unpinning);
        let info = tracker.sync(&cid).await.unwrap();
        assert_eq!(info.status, TrackerStatus::Unpinned);
        assert!(tracker.status_all().is_empty());
    }

    #[tokio::test]
    async fn test_queue_flood_sheds_load() {
        let connector = ScriptedConnector::healthy();
        let shutdown = ShutdownCoordinator::new();
        let mut config = TrackerConfig::new(1);
        config.pin_queue_size = 2;
        // Stall the worker so the queue stays full.
        connector.stall_pins.store(true, Ordering::SeqCst);
        let tracker = MapPinTracker::new(config, Arc::clone(&connector), &shutdown);

        // Fill the queue faster than the worker drains; with capacity 2 a
        // rapid burst of four must shed at least one.
        let mut shed = Vec::new();
        for name in ["Qm1", "Qm2", "Qm3", "Qm4"] {
            if let Err(e) = tracker.track(spec_for(name, &[1])).await {
                assert!(matches!(e, PinhiveError::QueueFull(_)));
                shed.push(name);
            }
        }
        assert!(!shed.is_empty(), "burst of 4 into a queue of 2 must shed");

        for name in shed {
            let info = tracker.status(&name.parse().unwrap());
            assert_eq!(info.status, TrackerStatus::PinError);
            assert_eq!(info.error.as_deref(), Some("pin queue is full"));
        }
    }

    #[tokio::test]
    async fn test_sync_all_bulk_failure_marks_everything() {
        struct BrokenLs;

        #[async_trait::async_trait]
        impl DaemonConnector for BrokenLs {
            async fn id(&self) -> Result<String> {
                Ok("broken".into())
            }
            async fn pin(&self, _cid: &Cid) -> Result<()> {
                Ok(())
            }
            async fn unpin(&self, _cid: &Cid) -> Result<()> {
                Ok(())
            }
            async fn pin_ls_cid(&self, _cid: &Cid) -> Result<DaemonPinStatus> {
                Err(PinhiveError::Daemon("down".into()))
            }
            async fn pin_ls(&self, _filter: &str) -> Result<HashMap<Cid, DaemonPinStatus>> {
                Err(PinhiveError::Daemon("down".into()))
            }
        }

        let shutdown = ShutdownCoordinator::new();
        let tracker = MapPinTracker::new(TrackerConfig::new(1), Arc::new(BrokenLs), &shutdown);

        tracker.entries.set(&"QmA".parse().unwrap(), TrackerStatus::Pinned);
        tracker
            .entries
            .set(&"QmB".parse().unwrap(), TrackerStatus::Unpinning);

        assert!(tracker.sync_all().await.is_err());

        let a = tracker.status(&"QmA".parse().unwrap());
        let b = tracker.status(&"QmB".parse().unwrap());
        assert_eq!(a.status, TrackerStatus::PinError);
        assert_eq!(b.status, TrackerStatus::UnpinError);
    }

    #[tokio::test]
    async fn test_sync_all_reports_changes_only() {
        let connector = ScriptedConnector::healthy();
        let (tracker, _shutdown) = tracker_with(Arc::clone(&connector));

        tracker.track(spec_for("QmA", &[1])).await.unwrap();
        wait_for_status(&tracker, &"QmA".parse().unwrap(), TrackerStatus::Pinned).await;

        // Nothing changed: no reports.
        assert!(tracker.sync_all().await.unwrap().is_empty());

        // Remove QmA behind the tracker's back: one report.
        connector.unpin(&"QmA".parse().unwrap()).await.unwrap();
        let updated = tracker.sync_all().await.unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].status, TrackerStatus::PinError);
    }
}
