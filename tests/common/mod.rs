//! Shared helpers for integration tests.

use parking_lot::Mutex;
use pinhive::connector::DaemonConnector;
use pinhive::error::{PinhiveError, Result};
use pinhive::types::{Cid, DaemonPinStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory daemon whose behaviour tests can script: pins can be made to
/// fail, stall, or diverge behind the tracker's back.
pub struct MockDaemon {
    pub pins: Mutex<HashMap<Cid, DaemonPinStatus>>,
    fail_pins: AtomicBool,
    stall_pins: AtomicBool,
    fail_ls: AtomicBool,
}

impl MockDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pins: Mutex::new(HashMap::new()),
            fail_pins: AtomicBool::new(false),
            stall_pins: AtomicBool::new(false),
            fail_ls: AtomicBool::new(false),
        })
    }

    pub fn set_fail_pins(&self, fail: bool) {
        self.fail_pins.store(fail, Ordering::SeqCst);
    }

    pub fn set_stall_pins(&self, stall: bool) {
        self.stall_pins.store(stall, Ordering::SeqCst);
    }

    pub fn set_fail_ls(&self, fail: bool) {
        self.fail_ls.store(fail, Ordering::SeqCst);
    }

    /// Pin directly on the daemon, behind the cluster's back.
    pub fn pin_directly(&self, cid: &Cid) {
        self.pins.lock().insert(cid.clone(), DaemonPinStatus::Pinned);
    }

    /// Remove directly on the daemon, behind the cluster's back.
    pub fn unpin_directly(&self, cid: &Cid) {
        self.pins.lock().remove(cid);
    }

    pub fn holds(&self, cid: &Cid) -> bool {
        self.pins
            .lock()
            .get(cid)
            .is_some_and(|s| *s == DaemonPinStatus::Pinned)
    }
}

#[async_trait::async_trait]
impl DaemonConnector for MockDaemon {
    async fn id(&self) -> Result<String> {
        Ok("mock-daemon".into())
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
        if self.fail_ls.load(Ordering::SeqCst) {
            return Err(PinhiveError::Daemon("daemon down".into()));
        }
        Ok(self
            .pins
            .lock()
            .get(cid)
            .copied()
            .unwrap_or(DaemonPinStatus::Unpinned))
    }

    async fn pin_ls(&self, _filter: &str) -> Result<HashMap<Cid, DaemonPinStatus>> {
        if self.fail_ls.load(Ordering::SeqCst) {
            return Err(PinhiveError::Daemon("daemon down".into()));
        }
        Ok(self.pins.lock().clone())
    }
}

/// Poll `check` until it passes or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn cid(raw: &str) -> Cid {
    raw.parse().unwrap()
}
