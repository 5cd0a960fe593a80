//! The agreed pin set.
//!
//! [`PinState`] is the in-memory, serialisable mapping from CID to
//! [`PinSpec`] that the replicated log drives. Every peer holds one and the
//! consensus FSM is its only writer; everything else reads.

use crate::error::{PinhiveError, Result};
use crate::types::{Cid, PinSpec};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version tag carried by serialised snapshots. Restores at a different
/// version fail loudly instead of guessing.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Serialised form of the pin set.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateSnapshot {
    version: u32,
    pins: BTreeMap<Cid, PinSpec>,
}

/// Thread-safe mapping CID → PinSpec.
///
/// Readers never observe torn entries; writers serialise on the internal
/// lock. `add` is an upsert and `remove` of an absent key is a no-op.
#[derive(Debug, Default)]
pub struct PinState {
    pins: RwLock<BTreeMap<Cid, PinSpec>>,
}

impl PinState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the spec for a CID.
    pub fn add(&self, spec: PinSpec) {
        self.pins.write().insert(spec.cid.clone(), spec);
    }

    /// Remove a CID. Absent keys are a no-op.
    pub fn remove(&self, cid: &Cid) {
        self.pins.write().remove(cid);
    }

    pub fn get(&self, cid: &Cid) -> Option<PinSpec> {
        self.pins.read().get(cid).cloned()
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.pins.read().contains_key(cid)
    }

    /// All specs, ordered by CID.
    pub fn list(&self) -> Vec<PinSpec> {
        self.pins.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.read().is_empty()
    }

    /// Serialise the full pin set into a version-tagged byte stream.
    pub fn to_snapshot_bytes(&self) -> Result<Vec<u8>> {
        let snapshot = StateSnapshot {
            version: SNAPSHOT_VERSION,
            pins: self.pins.read().clone(),
        };
        Ok(bincode::serialize(&snapshot)?)
    }

    /// Replace the pin set with the contents of a snapshot byte stream.
    pub fn restore_snapshot_bytes(&self, bytes: &[u8]) -> Result<()> {
        let snapshot: StateSnapshot = bincode::deserialize(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PinhiveError::SnapshotVersion {
                expected: SNAPSHOT_VERSION,
                found: snapshot.version,
            });
        }
        *self.pins.write() = snapshot.pins;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cid: &str, peers: &[u64]) -> PinSpec {
        PinSpec::new(cid.parse().unwrap(), peers.iter().copied().collect())
    }

    #[test]
    fn test_add_get_has() {
        let state = PinState::new();
        let cid: Cid = "QmA".parse().unwrap();
        assert!(!state.has(&cid));
        assert!(state.get(&cid).is_none());

        state.add(spec("QmA", &[1]));
        assert!(state.has(&cid));
        assert_eq!(state.get(&cid).unwrap().allocations.len(), 1);
    }

    #[test]
    fn test_add_is_upsert() {
        let state = PinState::new();
        state.add(spec("QmA", &[1]));
        state.add(spec("QmA", &[1, 2, 3]));

        assert_eq!(state.len(), 1);
        let got = state.get(&"QmA".parse().unwrap()).unwrap();
        assert_eq!(got.allocations.len(), 3);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let state = PinState::new();
        state.add(spec("QmA", &[1]));
        state.remove(&"QmB".parse().unwrap());
        assert_eq!(state.len(), 1);

        state.remove(&"QmA".parse().unwrap());
        assert!(state.is_empty());
    }

    #[test]
    fn test_list_ordered() {
        let state = PinState::new();
        state.add(spec("QmC", &[1]));
        state.add(spec("QmA", &[1]));
        state.add(spec("QmB", &[1]));

        let cids: Vec<String> = state.list().iter().map(|s| s.cid.to_string()).collect();
        assert_eq!(cids, vec!["QmA", "QmB", "QmC"]);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let state = PinState::new();
        state.add(spec("QmA", &[1, 2]));
        state.add(spec("QmB", &[3]));

        let bytes = state.to_snapshot_bytes().unwrap();

        let restored = PinState::new();
        restored.add(spec("QmStale", &[9]));
        restored.restore_snapshot_bytes(&bytes).unwrap();

        assert_eq!(restored.list(), state.list());
        assert!(!restored.has(&"QmStale".parse().unwrap()));
    }

    #[test]
    fn test_snapshot_version_guard() {
        let snapshot = StateSnapshot {
            version: SNAPSHOT_VERSION + 1,
            pins: BTreeMap::new(),
        };
        let bytes = bincode::serialize(&snapshot).unwrap();

        let state = PinState::new();
        match state.restore_snapshot_bytes(&bytes) {
            Err(PinhiveError::SnapshotVersion { expected, found }) => {
                assert_eq!(expected, SNAPSHOT_VERSION);
                assert_eq!(found, SNAPSHOT_VERSION + 1);
            }
            other => panic!("expected version error, got {other:?}"),
        }
    }
}
