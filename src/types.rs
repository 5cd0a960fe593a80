//! Core type definitions for pinhive.
//!
//! This module contains the fundamental data types shared across components:
//! content identifiers, peer identities and addresses, pin specifications,
//! tracker records and allocation metrics.
//!
//! # Key Types
//!
//! - [`Cid`]: opaque content identifier, serialised as its string form
//! - [`PinSpec`]: a cluster commitment to host a CID on a set of peers
//! - [`PinInfo`]: one peer's tracker record for a CID
//! - [`GlobalPinInfo`]: the cluster-wide view of a CID, built at query time
//! - [`Metric`]: a TTL-stamped informer measurement used for allocation
//!
//! # Examples
//!
//! ```rust
//! use pinhive::types::{Cid, PeerAddr, PinSpec};
//!
//! let cid: Cid = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG".parse().unwrap();
//! let spec = PinSpec::new(cid, [1, 2].into_iter().collect());
//! assert!(spec.is_allocated_to(1));
//! assert!(!spec.is_allocated_to(3));
//!
//! let addr: PeerAddr = "2@10.0.0.5:9096".parse().unwrap();
//! assert_eq!(addr.peer, 2);
//! assert_eq!(addr.transport, "10.0.0.5:9096");
//! ```

use crate::error::PinhiveError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Unique identifier for a cluster peer.
pub type PeerId = u64;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Opaque, equality-comparable content identifier.
///
/// pinhive never inspects the content a CID names; it only moves the name
/// between the log, the trackers and the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(String);

impl Cid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Cid {
    type Err = PinhiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(PinhiveError::InvalidCid(s.to_string()));
        }
        Ok(Cid(s.to_string()))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer address: identity plus transport endpoint, written `"<id>@<host:port>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddr {
    /// Peer identity carried by the address.
    pub peer: PeerId,
    /// Transport endpoint (host:port) the peer listens on.
    pub transport: String,
}

impl PeerAddr {
    pub fn new(peer: PeerId, transport: impl Into<String>) -> Self {
        Self {
            peer,
            transport: transport.into(),
        }
    }
}

impl FromStr for PeerAddr {
    type Err = PinhiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id_part, transport) = s
            .split_once('@')
            .ok_or_else(|| PinhiveError::InvalidPeerAddress(s.to_string()))?;
        let peer: PeerId = id_part
            .parse()
            .map_err(|_| PinhiveError::InvalidPeerAddress(s.to_string()))?;
        if transport.is_empty() || !transport.contains(':') {
            return Err(PinhiveError::InvalidPeerAddress(s.to_string()));
        }
        Ok(PeerAddr::new(peer, transport))
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer, self.transport)
    }
}

impl TryFrom<String> for PeerAddr {
    type Error = PinhiveError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PeerAddr> for String {
    fn from(a: PeerAddr) -> String {
        a.to_string()
    }
}

/// The cluster's commitment to host a CID: which peers must pin it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSpec {
    /// The content identifier this spec covers.
    pub cid: Cid,
    /// Peers that must host the content. Ignored when `everywhere` is set.
    #[serde(default)]
    pub allocations: BTreeSet<PeerId>,
    /// Pin on every cluster peer, present and future.
    #[serde(default)]
    pub everywhere: bool,
    /// Optional user label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PinSpec {
    pub fn new(cid: Cid, allocations: BTreeSet<PeerId>) -> Self {
        Self {
            cid,
            allocations,
            everywhere: false,
            name: None,
        }
    }

    /// A spec that pins on every cluster peer.
    pub fn everywhere(cid: Cid) -> Self {
        Self {
            cid,
            allocations: BTreeSet::new(),
            everywhere: true,
            name: None,
        }
    }

    /// Whether the given peer must host this content.
    pub fn is_allocated_to(&self, peer: PeerId) -> bool {
        self.everywhere || self.allocations.contains(&peer)
    }
}

/// Progress of a CID on a single peer's tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    /// A pin request is queued or running against the daemon.
    Pinning,
    /// The daemon holds the content.
    Pinned,
    /// An unpin request is queued or running against the daemon.
    Unpinning,
    /// Not tracked. Never materialised in the tracker map; the implicit
    /// default for unknown CIDs.
    Unpinned,
    /// The pin operation failed or the daemon diverged.
    PinError,
    /// The unpin operation failed or the daemon diverged.
    UnpinError,
    /// Allocated to other peers; this peer intentionally does not host it.
    Remote,
    /// Synthetic status for a peer that could not be reached during
    /// aggregation.
    ClusterError,
}

impl TrackerStatus {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            TrackerStatus::PinError | TrackerStatus::UnpinError | TrackerStatus::ClusterError
        )
    }
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackerStatus::Pinning => "pinning",
            TrackerStatus::Pinned => "pinned",
            TrackerStatus::Unpinning => "unpinning",
            TrackerStatus::Unpinned => "unpinned",
            TrackerStatus::PinError => "pin_error",
            TrackerStatus::UnpinError => "unpin_error",
            TrackerStatus::Remote => "remote",
            TrackerStatus::ClusterError => "cluster_error",
        };
        write!(f, "{s}")
    }
}

/// One peer's tracker record for a CID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinInfo {
    pub cid: Cid,
    pub peer: PeerId,
    pub status: TrackerStatus,
    /// Time of the last status transition.
    pub timestamp: DateTime<Utc>,
    /// Populated in error states, cleared otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PinInfo {
    /// Age of the current status.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Cluster-wide view of a CID, assembled at query time from per-peer
/// tracker records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalPinInfo {
    pub cid: Cid,
    pub peer_map: BTreeMap<PeerId, PinInfo>,
}

impl GlobalPinInfo {
    pub fn new(cid: Cid) -> Self {
        Self {
            cid,
            peer_map: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, info: PinInfo) {
        self.peer_map.insert(info.peer, info);
    }

    /// Whether any peer reports an error status for this CID.
    pub fn has_error(&self) -> bool {
        self.peer_map.values().any(|p| p.status.is_error())
    }
}

/// The daemon's own view of a pin, as reported by its pin listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonPinStatus {
    Pinned,
    Unpinned,
    Pinning,
    Unpinning,
    Error,
}

impl DaemonPinStatus {
    /// Whether the daemon considers the content held.
    pub fn is_pinned(&self) -> bool {
        matches!(self, DaemonPinStatus::Pinned)
    }
}

/// A TTL-stamped informer measurement for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    /// Metric family, e.g. `"numpin"`.
    pub name: String,
    /// String-encoded value; the allocator knows how to interpret it.
    pub value: String,
    /// Peer the metric describes.
    pub peer: PeerId,
    /// Whether the informer could produce a measurement at all.
    pub valid: bool,
    /// Expiry instant; consumers discard the metric past this point.
    pub expires_at: DateTime<Utc>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: impl Into<String>, peer: PeerId) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            peer,
            valid: true,
            expires_at: Utc::now(),
        }
    }

    /// An invalid placeholder for a peer whose informer failed.
    pub fn invalid(name: impl Into<String>, peer: PeerId) -> Self {
        Self {
            name: name.into(),
            value: String::new(),
            peer,
            valid: false,
            expires_at: Utc::now(),
        }
    }

    /// Stamp the metric with a time-to-live from now.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at =
            Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero());
        self
    }

    pub fn expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Whether consumers should ignore this metric.
    pub fn discard(&self) -> bool {
        !self.valid || self.expired()
    }
}

/// Identity of a cluster peer as reported by `ID` calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub peer: PeerId,
    pub addresses: Vec<PeerAddr>,
    pub version: String,
    /// Identity reported by the local storage daemon, when reachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_id: Option<String>,
    /// Populated when the peer could not be reached during aggregation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_parse() {
        let cid: Cid = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG"
            .parse()
            .unwrap();
        assert_eq!(cid.as_str(), "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG");

        assert!("".parse::<Cid>().is_err());
        assert!("has space".parse::<Cid>().is_err());
        assert!("has/slash".parse::<Cid>().is_err());
    }

    #[test]
    fn test_peer_addr_roundtrip() {
        let addr: PeerAddr = "3@127.0.0.1:9096".parse().unwrap();
        assert_eq!(addr.peer, 3);
        assert_eq!(addr.transport, "127.0.0.1:9096");
        assert_eq!(addr.to_string(), "3@127.0.0.1:9096");

        assert!("127.0.0.1:9096".parse::<PeerAddr>().is_err());
        assert!("x@127.0.0.1:9096".parse::<PeerAddr>().is_err());
        assert!("3@".parse::<PeerAddr>().is_err());
        assert!("3@nohost".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn test_pin_spec_allocation() {
        let cid: Cid = "QmTest".parse().unwrap();
        let spec = PinSpec::new(cid.clone(), [1, 2].into_iter().collect());
        assert!(spec.is_allocated_to(1));
        assert!(!spec.is_allocated_to(5));

        let all = PinSpec::everywhere(cid);
        assert!(all.is_allocated_to(5));
    }

    #[test]
    fn test_metric_ttl() {
        let m = Metric::new("numpin", "4", 1).with_ttl(Duration::from_secs(60));
        assert!(!m.expired());
        assert!(!m.discard());

        let stale = Metric::new("numpin", "4", 1).with_ttl(Duration::ZERO);
        assert!(stale.discard());

        let bad = Metric::invalid("numpin", 1);
        assert!(bad.discard());
    }

    #[test]
    fn test_global_pin_info_errors() {
        let cid: Cid = "QmTest".parse().unwrap();
        let mut gpi = GlobalPinInfo::new(cid.clone());
        gpi.add(PinInfo {
            cid: cid.clone(),
            peer: 1,
            status: TrackerStatus::Pinned,
            timestamp: Utc::now(),
            error: None,
        });
        assert!(!gpi.has_error());

        gpi.add(PinInfo {
            cid,
            peer: 2,
            status: TrackerStatus::PinError,
            timestamp: Utc::now(),
            error: Some("daemon refused".into()),
        });
        assert!(gpi.has_error());
    }
}
