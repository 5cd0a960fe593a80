//! Allocators rank candidate peers for a new pin.

use crate::error::Result;
use crate::informer::NUMPIN_METRIC_NAME;
use crate::types::{Cid, Metric, PeerId};
use std::collections::HashMap;

/// Decides where to pin content.
///
/// `current` holds valid metrics for peers already pinning the CID;
/// `candidates` holds metrics for every peer eligible to pin it. The
/// returned order is most-preferred first.
pub trait PinAllocator: Send + Sync {
    fn allocate(
        &self,
        cid: &Cid,
        current: &HashMap<PeerId, Metric>,
        candidates: &HashMap<PeerId, Metric>,
    ) -> Result<Vec<PeerId>>;
}

/// Orders candidates by ascending pin count, so new pins land on the
/// least-loaded peers. Peers without a fresh, parseable metric are
/// ineligible rather than infinitely bad.
pub struct NumPinAllocator {
    metric_name: String,
}

impl NumPinAllocator {
    pub fn new() -> Self {
        Self {
            metric_name: NUMPIN_METRIC_NAME.to_string(),
        }
    }
}

impl Default for NumPinAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PinAllocator for NumPinAllocator {
    fn allocate(
        &self,
        _cid: &Cid,
        _current: &HashMap<PeerId, Metric>,
        candidates: &HashMap<PeerId, Metric>,
    ) -> Result<Vec<PeerId>> {
        let mut ranked: Vec<(u64, PeerId)> = candidates
            .iter()
            .filter(|(_, m)| m.name == self.metric_name && !m.discard())
            .filter_map(|(&peer, m)| m.value.parse::<u64>().ok().map(|v| (v, peer)))
            .collect();

        // Tie-break on peer id so equal metrics rank deterministically.
        ranked.sort_unstable();
        Ok(ranked.into_iter().map(|(_, peer)| peer).collect())
    }
}
