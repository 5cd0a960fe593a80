//! Node configuration.
//!
//! One JSON document per peer. The peer list is rewritten in place as
//! membership changes so a restart rejoins the same cluster.

use crate::error::{PinhiveError, Result};
use crate::tracker::{PINNING_TIMEOUT, PIN_QUEUE_SIZE, UNPINNING_TIMEOUT};
use crate::types::{PeerAddr, PeerId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_pin_queue_size() -> usize {
    PIN_QUEUE_SIZE
}

fn default_pinning_timeout() -> Duration {
    PINNING_TIMEOUT
}

fn default_unpinning_timeout() -> Duration {
    UNPINNING_TIMEOUT
}

fn default_replication_factor() -> i32 {
    -1
}

/// Configuration for a pinhive peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This peer's identity.
    pub id: PeerId,

    /// Shared cluster secret. Peers refuse RPC from holders of a different
    /// secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Bind address for peer-to-peer RPC and the Raft transport.
    pub cluster_listen_address: String,

    /// Address other peers should dial us on, when it differs from the
    /// listen address (NAT, 0.0.0.0 binds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertised_address: Option<String>,

    /// Bind address for the REST API.
    pub api_listen_address: String,

    /// Bind address for the daemon proxy.
    pub proxy_listen_address: String,

    /// The local storage daemon's own API address.
    pub daemon_node_address: String,

    /// On-disk directory for the consensus log and snapshots. Owned by one
    /// process at a time.
    pub consensus_data_folder: PathBuf,

    /// Static bootstrap peer set, self included.
    #[serde(default)]
    pub cluster_peers: Vec<PeerAddr>,

    /// Peers to join through at startup when `cluster_peers` is empty.
    #[serde(default)]
    pub bootstrap: Vec<PeerAddr>,

    /// Remove ourselves from the cluster on clean shutdown.
    #[serde(default)]
    pub leave_on_shutdown: bool,

    /// Target allocation size for new pins. Zero or negative means pin on
    /// every peer.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,

    /// Tracker queue capacity.
    #[serde(default = "default_pin_queue_size")]
    pub pin_queue_size: usize,

    /// Reconciliation window for in-flight pins.
    #[serde(with = "humantime_serde", default = "default_pinning_timeout")]
    pub pinning_timeout: Duration,

    /// Reconciliation window for in-flight unpins.
    #[serde(with = "humantime_serde", default = "default_unpinning_timeout")]
    pub unpinning_timeout: Duration,

    /// Where this config was loaded from; rewritten on membership change.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl ClusterConfig {
    /// Load and validate a config file. The path is remembered so
    /// membership changes persist back to it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PinhiveError::Config(format!("reading {}: {e}", path.display())))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| PinhiveError::Config(format!("parsing {}: {e}", path.display())))?;
        config.path = Some(path.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    /// Write the config back to its path, when one is set.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| PinhiveError::Config(format!("writing {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(PinhiveError::InvalidConfig {
                field: "id".into(),
                reason: "peer id must be non-zero".into(),
            });
        }
        for (field, addr) in [
            ("cluster_listen_address", &self.cluster_listen_address),
            ("api_listen_address", &self.api_listen_address),
            ("proxy_listen_address", &self.proxy_listen_address),
            ("daemon_node_address", &self.daemon_node_address),
        ] {
            if !addr.contains(':') {
                return Err(PinhiveError::InvalidConfig {
                    field: field.into(),
                    reason: format!("'{addr}' is not a host:port address"),
                });
            }
        }
        if self.replication_factor == 0 {
            return Err(PinhiveError::InvalidConfig {
                field: "replication_factor".into(),
                reason: "must be positive, or negative for everywhere pins".into(),
            });
        }
        if self.pin_queue_size == 0 {
            return Err(PinhiveError::InvalidConfig {
                field: "pin_queue_size".into(),
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }

    /// The address other peers should record for us.
    pub fn advertised_addr(&self) -> PeerAddr {
        let transport = self
            .advertised_address
            .clone()
            .unwrap_or_else(|| self.cluster_listen_address.clone());
        PeerAddr::new(self.id, transport)
    }

    /// Replace the persisted peer list.
    pub fn set_peers(&mut self, peers: Vec<PeerAddr>) {
        self.cluster_peers = peers;
        self.cluster_peers.sort_by_key(|p| p.peer);
    }

    /// Forget every peer, self included. Used on self-eviction.
    pub fn empty_peers(&mut self) {
        self.cluster_peers.clear();
    }

    /// Whether new pins should target every peer.
    pub fn pin_everywhere(&self) -> bool {
        self.replication_factor <= 0
    }

    /// A single-node configuration rooted at `data_dir`, handy for tests
    /// and first runs.
    pub fn standalone(id: PeerId, data_dir: &Path) -> Self {
        Self {
            id,
            secret: None,
            cluster_listen_address: "127.0.0.1:9096".into(),
            advertised_address: None,
            api_listen_address: "127.0.0.1:9094".into(),
            proxy_listen_address: "127.0.0.1:9095".into(),
            daemon_node_address: "127.0.0.1:5001".into(),
            consensus_data_folder: data_dir.join("consensus"),
            cluster_peers: Vec::new(),
            bootstrap: Vec::new(),
            leave_on_shutdown: false,
            replication_factor: default_replication_factor(),
            pin_queue_size: PIN_QUEUE_SIZE,
            pinning_timeout: PINNING_TIMEOUT,
            unpinning_timeout: UNPINNING_TIMEOUT,
            path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_standalone_validates() {
        let dir = tempdir().unwrap();
        let config = ClusterConfig::standalone(1, dir.path());
        config.validate().unwrap();
        assert!(config.pin_everywhere());
    }

    #[test]
    fn test_rejects_zero_id_and_factor() {
        let dir = tempdir().unwrap();
        let mut config = ClusterConfig::standalone(1, dir.path());

        config.id = 0;
        assert!(config.validate().is_err());

        config.id = 1;
        config.replication_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_addresses() {
        let dir = tempdir().unwrap();
        let mut config = ClusterConfig::standalone(1, dir.path());
        config.api_listen_address = "no-port".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("service.json");

        let mut config = ClusterConfig::standalone(3, dir.path());
        config.path = Some(path.clone());
        config.set_peers(vec![
            "3@127.0.0.1:9096".parse().unwrap(),
            "1@127.0.0.1:8096".parse().unwrap(),
        ]);
        config.save().unwrap();

        let loaded = ClusterConfig::load(&path).unwrap();
        assert_eq!(loaded.id, 3);
        // set_peers keeps the list ordered by peer id.
        assert_eq!(loaded.cluster_peers[0].peer, 1);
        assert_eq!(loaded.cluster_peers[1].peer, 3);
        assert_eq!(loaded.path, Some(path));
    }

    #[test]
    fn test_defaults_apply_to_sparse_config() {
        let raw = r#"{
            "id": 2,
            "cluster_listen_address": "0.0.0.0:9096",
            "api_listen_address": "0.0.0.0:9094",
            "proxy_listen_address": "0.0.0.0:9095",
            "daemon_node_address": "127.0.0.1:5001",
            "consensus_data_folder": "/var/lib/pinhive"
        }"#;
        let config: ClusterConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.replication_factor, -1);
        assert_eq!(config.pin_queue_size, PIN_QUEUE_SIZE);
        assert_eq!(config.pinning_timeout, PINNING_TIMEOUT);
        assert_eq!(config.unpinning_timeout, UNPINNING_TIMEOUT);
        assert!(config.cluster_peers.is_empty());
    }

    #[test]
    fn test_advertised_addr_falls_back_to_listen() {
        let dir = tempdir().unwrap();
        let mut config = ClusterConfig::standalone(4, dir.path());
        assert_eq!(config.advertised_addr().to_string(), "4@127.0.0.1:9096");

        config.advertised_address = Some("198.51.100.7:9096".into());
        assert_eq!(
            config.advertised_addr().to_string(),
            "4@198.51.100.7:9096"
        );
    }
}
