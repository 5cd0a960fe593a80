//! Informers produce per-peer metrics for the allocator.

use crate::connector::DaemonConnector;
use crate::types::{Metric, PeerId};
use std::sync::Arc;
use std::time::Duration;

/// Name of the pin-count metric.
pub const NUMPIN_METRIC_NAME: &str = "numpin";

/// How long a pin-count metric stays valid.
pub const NUMPIN_METRIC_TTL: Duration = Duration::from_secs(10);

/// Produces a metric describing the local peer. The metric is opaque to
/// the rest of the cluster; only the matching allocator interprets it.
#[async_trait::async_trait]
pub trait Informer: Send + Sync {
    /// Metric family this informer produces.
    fn name(&self) -> &str;

    /// Measure the local peer. Failures yield an invalid metric rather
    /// than an error; consumers discard those.
    async fn metric(&self) -> Metric;
}

/// Counts recursive pins on the local daemon.
pub struct NumPinInformer {
    local_peer: PeerId,
    connector: Arc<dyn DaemonConnector>,
}

impl NumPinInformer {
    pub fn new(local_peer: PeerId, connector: Arc<dyn DaemonConnector>) -> Self {
        Self {
            local_peer,
            connector,
        }
    }
}

#[async_trait::async_trait]
impl Informer for NumPinInformer {
    fn name(&self) -> &str {
        NUMPIN_METRIC_NAME
    }

    async fn metric(&self) -> Metric {
        match self.connector.pin_ls("recursive").await {
            Ok(pins) => Metric::new(NUMPIN_METRIC_NAME, pins.len().to_string(), self.local_peer)
                .with_ttl(NUMPIN_METRIC_TTL),
            Err(e) => {
                tracing::debug!(error = %e, "pin count unavailable");
                Metric::invalid(NUMPIN_METRIC_NAME, self.local_peer)
            }
        }
    }
}
