//! Peer metrics monitor.
//!
//! Keeps the latest metric per (family, peer). Each peer's informer
//! measures locally and broadcasts the result to the rest of the cluster;
//! the coordinator reads the window back when allocating a pin. Expired
//! metrics are dropped on read.

use crate::types::{Metric, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// How often each peer measures and broadcasts its own metric. Half the
/// numpin TTL, so a single missed broadcast does not blank the window.
pub const METRIC_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Latest-value store for peer metrics.
#[derive(Debug, Default)]
pub struct MetricsMonitor {
    window: RwLock<HashMap<String, HashMap<PeerId, Metric>>>,
}

impl MetricsMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a metric, replacing any previous one from the same peer.
    pub fn log_metric(&self, metric: Metric) {
        if !metric.valid {
            return;
        }
        self.window
            .write()
            .entry(metric.name.clone())
            .or_default()
            .insert(metric.peer, metric);
    }

    /// The freshest known metric per peer for a family. Expired entries
    /// are pruned as they are observed.
    pub fn last_metrics(&self, name: &str) -> Vec<Metric> {
        let mut window = self.window.write();
        let Some(family) = window.get_mut(name) else {
            return Vec::new();
        };
        family.retain(|_, m| !m.expired());
        family.values().cloned().collect()
    }

    /// Latest metric for a single peer, when fresh.
    pub fn last_metric(&self, name: &str, peer: PeerId) -> Option<Metric> {
        self.window
            .read()
            .get(name)
            .and_then(|family| family.get(&peer))
            .filter(|m| !m.discard())
            .cloned()
    }

    /// Drop every metric recorded for a peer, across families.
    pub fn forget_peer(&self, peer: PeerId) {
        let mut window = self.window.write();
        for family in window.values_mut() {
            family.remove(&peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(peer: PeerId, value: &str) -> Metric {
        Metric::new("numpin", value, peer).with_ttl(Duration::from_secs(60))
    }

    #[test]
    fn test_latest_metric_wins() {
        let monitor = MetricsMonitor::new();
        monitor.log_metric(fresh(1, "5"));
        monitor.log_metric(fresh(1, "7"));

        let metrics = monitor.last_metrics("numpin");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].value, "7");
    }

    #[test]
    fn test_invalid_metrics_are_not_recorded() {
        let monitor = MetricsMonitor::new();
        monitor.log_metric(Metric::invalid("numpin", 1));
        assert!(monitor.last_metrics("numpin").is_empty());
    }

    #[test]
    fn test_expired_metrics_are_pruned() {
        let monitor = MetricsMonitor::new();
        monitor.log_metric(Metric::new("numpin", "1", 1).with_ttl(Duration::ZERO));
        monitor.log_metric(fresh(2, "2"));

        let metrics = monitor.last_metrics("numpin");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].peer, 2);
    }

    #[test]
    fn test_forget_peer() {
        let monitor = MetricsMonitor::new();
        monitor.log_metric(fresh(1, "1"));
        monitor.log_metric(fresh(2, "2"));
        monitor.forget_peer(1);

        let metrics = monitor.last_metrics("numpin");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].peer, 2);
    }
}
