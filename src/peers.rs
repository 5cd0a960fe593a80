//! Peer set management.
//!
//! The peer manager owns the authoritative in-memory peer set (identities
//! plus transport addresses) and keeps three things aligned with it: the
//! shared address book the RPC clients dial through, the persisted peer
//! list in the config file, and — via the membership listener in the
//! coordinator — the Raft transport configuration.

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::types::{PeerAddr, PeerId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Address book shared with the RPC client and Raft transport: the
/// process-wide peerstore.
pub type AddressBook = Arc<RwLock<HashMap<PeerId, String>>>;

/// Maintains the cluster membership set for the local peer.
pub struct PeerManager {
    local: PeerAddr,
    book: AddressBook,
    config: Arc<Mutex<ClusterConfig>>,
}

impl PeerManager {
    pub fn new(local: PeerAddr, book: AddressBook, config: Arc<Mutex<ClusterConfig>>) -> Self {
        let manager = Self {
            local,
            book,
            config,
        };
        manager.reset();
        manager
    }

    /// The shared address book.
    pub fn book(&self) -> AddressBook {
        Arc::clone(&self.book)
    }

    pub fn local_peer(&self) -> PeerId {
        self.local.peer
    }

    /// Record a peer. Returns true when the peer was new. Known peers are
    /// a no-op and their recorded address wins.
    pub fn add(&self, addr: &PeerAddr) -> bool {
        {
            let mut book = self.book.write();
            if book.contains_key(&addr.peer) {
                debug!(peer = addr.peer, "already a peer");
                return false;
            }
            book.insert(addr.peer, addr.transport.clone());
        }
        info!(peer = addr.peer, address = %addr.transport, "added peer");
        self.persist();
        true
    }

    /// Forget a peer. Unknown peers are a no-op.
    pub fn remove(&self, peer: PeerId) -> bool {
        let removed = self.book.write().remove(&peer).is_some();
        if removed {
            info!(peer, "removed peer");
            self.persist();
        }
        removed
    }

    /// The current peer set, self included, ordered by id.
    pub fn peers(&self) -> Vec<PeerAddr> {
        let mut peers: Vec<PeerAddr> = self
            .book
            .read()
            .iter()
            .map(|(&peer, transport)| PeerAddr::new(peer, transport.clone()))
            .collect();
        peers.sort_by_key(|p| p.peer);
        peers
    }

    /// Every peer except ourselves.
    pub fn remote_peers(&self) -> Vec<PeerId> {
        self.book
            .read()
            .keys()
            .copied()
            .filter(|&p| p != self.local.peer)
            .collect()
    }

    pub fn addr_of(&self, peer: PeerId) -> Option<PeerAddr> {
        self.book
            .read()
            .get(&peer)
            .map(|t| PeerAddr::new(peer, t.clone()))
    }

    pub fn is_member(&self, peer: PeerId) -> bool {
        self.book.read().contains_key(&peer)
    }

    /// Shrink the peer set to ourselves only.
    pub fn reset(&self) {
        let mut book = self.book.write();
        book.clear();
        book.insert(self.local.peer, self.local.transport.clone());
    }

    /// Populate from a bootstrap list (the config's `cluster_peers`).
    pub fn import(&self, addrs: &[PeerAddr]) {
        if addrs.iter().any(|a| a.peer != self.local.peer) {
            info!("adding cluster peers");
        } else {
            info!("this is a single-node cluster");
        }
        for addr in addrs {
            if addr.peer == self.local.peer {
                continue;
            }
            self.add(addr);
            info!("    - {addr}");
        }
    }

    /// Persist the current peer set into the config file.
    fn persist(&self) {
        let mut config = self.config.lock();
        config.set_peers(self.peers());
        if let Err(e) = config.save() {
            error!(error = %e, "persisting peer list failed");
        }
    }

    /// Empty the persisted peer list. Used when this peer is evicted so a
    /// restart does not redial a cluster it no longer belongs to.
    pub fn empty_persisted_peers(&self) {
        let mut config = self.config.lock();
        config.empty_peers();
        if let Err(e) = config.save() {
            error!(error = %e, "clearing peer list failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager() -> (PeerManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = Arc::new(Mutex::new(ClusterConfig::standalone(1, dir.path())));
        let book: AddressBook = Arc::new(RwLock::new(HashMap::new()));
        let local = PeerAddr::new(1, "127.0.0.1:9096");
        (PeerManager::new(local, book, config), dir)
    }

    #[test]
    fn test_starts_with_self() {
        let (manager, _dir) = manager();
        let peers = manager.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer, 1);
        assert!(manager.remote_peers().is_empty());
    }

    #[test]
    fn test_add_and_remove() {
        let (manager, _dir) = manager();
        let addr: PeerAddr = "2@127.0.0.1:9196".parse().unwrap();

        assert!(manager.add(&addr));
        assert!(!manager.add(&addr)); // duplicate no-op
        assert!(manager.is_member(2));
        assert_eq!(manager.remote_peers(), vec![2]);
        assert_eq!(manager.addr_of(2).unwrap().transport, "127.0.0.1:9196");

        assert!(manager.remove(2));
        assert!(!manager.remove(2)); // absent no-op
        assert!(!manager.is_member(2));
    }

    #[test]
    fn test_import_skips_self() {
        let (manager, _dir) = manager();
        manager.import(&[
            "1@127.0.0.1:9096".parse().unwrap(),
            "2@127.0.0.1:9196".parse().unwrap(),
            "3@127.0.0.1:9296".parse().unwrap(),
        ]);

        let peers = manager.peers();
        assert_eq!(peers.len(), 3);
        let mut remotes = manager.remote_peers();
        remotes.sort_unstable();
        assert_eq!(remotes, vec![2, 3]);
    }

    #[test]
    fn test_reset() {
        let (manager, _dir) = manager();
        manager.add(&"2@127.0.0.1:9196".parse().unwrap());
        manager.reset();
        assert_eq!(manager.peers().len(), 1);
        assert!(manager.is_member(1));
    }

    #[test]
    fn test_peer_changes_persist_to_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("service.json");
        let mut config = ClusterConfig::standalone(1, dir.path());
        config.path = Some(path.clone());
        config.save().unwrap();

        let config = Arc::new(Mutex::new(config));
        let book: AddressBook = Arc::new(RwLock::new(HashMap::new()));
        let manager = PeerManager::new(
            PeerAddr::new(1, "127.0.0.1:9096"),
            book,
            Arc::clone(&config),
        );

        manager.add(&"2@127.0.0.1:9196".parse().unwrap());

        let reloaded = ClusterConfig::load(&path).unwrap();
        assert_eq!(reloaded.cluster_peers.len(), 2);
    }
}
