//! Coordinator behaviour: allocation, fan-out, aggregation and
//! leader forwarding.

#[allow(dead_code)]
mod common;

use common::{cid, wait_until, MockDaemon};
use pinhive::allocator::{NumPinAllocator, PinAllocator};
use pinhive::cluster::{Cluster, PinOptions};
use pinhive::config::ClusterConfig;
use pinhive::connector::DaemonConnector;
use pinhive::informer::{Informer, NumPinInformer, NUMPIN_METRIC_NAME};
use pinhive::rpc::RpcServer;
use pinhive::shutdown::ShutdownCoordinator;
use pinhive::types::{Metric, PeerAddr, TrackerStatus};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

fn build_cluster(
    config: ClusterConfig,
    daemon: Arc<MockDaemon>,
) -> pinhive::Result<Arc<Cluster>> {
    let connector: Arc<dyn DaemonConnector> = daemon;
    let informer: Arc<dyn Informer> =
        Arc::new(NumPinInformer::new(config.id, Arc::clone(&connector)));
    let allocator: Arc<dyn PinAllocator> = Arc::new(NumPinAllocator::new());
    Cluster::new(config, connector, informer, allocator, ShutdownCoordinator::new())
}

fn standalone(daemon: Arc<MockDaemon>) -> (Arc<Cluster>, TempDir) {
    let dir = TempDir::new().unwrap();
    let cluster = build_cluster(ClusterConfig::standalone(1, dir.path()), daemon).unwrap();
    (cluster, dir)
}

fn fresh_metric(peer: u64, value: &str) -> Metric {
    Metric::new(NUMPIN_METRIC_NAME, value, peer).with_ttl(Duration::from_secs(60))
}

fn pin_opts(factor: i32) -> PinOptions {
    PinOptions {
        replication_factor: Some(factor),
        ..Default::default()
    }
}

// =============================================================================
// Single-peer scenarios
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_peer_pin() {
    let daemon = MockDaemon::new();
    let (cluster, _dir) = standalone(Arc::clone(&daemon));
    cluster.wait_ready().await.unwrap();

    cluster.monitor().log_metric(fresh_metric(1, "0"));
    cluster.pin(cid("QmX"), pin_opts(1)).await.unwrap();

    let pins = cluster.pin_list();
    assert_eq!(pins.len(), 1);
    assert_eq!(pins[0].cid, cid("QmX"));
    assert!(pins[0].allocations.contains(&1));
    assert!(!pins[0].everywhere);

    wait_until(Duration::from_secs(1), "QmX pinned on peer 1", || {
        cluster.tracker().status(&cid("QmX")).status == TrackerStatus::Pinned
    })
    .await;
    assert!(daemon.holds(&cid("QmX")));

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pin_is_idempotent() {
    let daemon = MockDaemon::new();
    let (cluster, _dir) = standalone(daemon);
    cluster.wait_ready().await.unwrap();
    cluster.monitor().log_metric(fresh_metric(1, "0"));

    cluster.pin(cid("QmX"), pin_opts(1)).await.unwrap();
    let first = cluster.pin_list();

    cluster.pin(cid("QmX"), pin_opts(1)).await.unwrap();
    let second = cluster.pin_list();

    assert_eq!(first, second);
    assert_eq!(second.len(), 1);

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pin_unpin_converges_to_absent() {
    let daemon = MockDaemon::new();
    let (cluster, _dir) = standalone(Arc::clone(&daemon));
    cluster.wait_ready().await.unwrap();

    // Default options on a standalone config: pin everywhere.
    cluster.pin(cid("QmX"), PinOptions::default()).await.unwrap();
    assert!(cluster.pin_list()[0].everywhere);

    wait_until(Duration::from_secs(1), "QmX pinned", || {
        cluster.tracker().status(&cid("QmX")).status == TrackerStatus::Pinned
    })
    .await;

    cluster.unpin(&cid("QmX")).await.unwrap();
    assert!(cluster.pin_list().is_empty());

    wait_until(Duration::from_secs(1), "tracker converges to absent", || {
        cluster.tracker().status_all().is_empty()
    })
    .await;
    assert!(!daemon.holds(&cid("QmX")));

    // The global view reports the implicit Unpinned default.
    let global = cluster.status(&cid("QmX")).await;
    assert_eq!(
        global.peer_map.get(&1).unwrap().status,
        TrackerStatus::Unpinned
    );

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unpin_of_unknown_cid_is_idempotent() {
    let daemon = MockDaemon::new();
    let (cluster, _dir) = standalone(daemon);
    cluster.wait_ready().await.unwrap();

    cluster.unpin(&cid("QmNever")).await.unwrap();
    assert!(cluster.pin_list().is_empty());

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_state_survives_restart() {
    let daemon = MockDaemon::new();
    let dir = TempDir::new().unwrap();

    let before = {
        let cluster =
            build_cluster(ClusterConfig::standalone(1, dir.path()), Arc::clone(&daemon)).unwrap();
        cluster.wait_ready().await.unwrap();

        cluster.pin(cid("QmA"), PinOptions::default()).await.unwrap();
        cluster.pin(cid("QmB"), PinOptions::default()).await.unwrap();
        let pins = cluster.pin_list();
        cluster.stop().await.unwrap();
        pins
    };

    let cluster = build_cluster(ClusterConfig::standalone(1, dir.path()), daemon).unwrap();
    cluster.wait_ready().await.unwrap();
    assert_eq!(cluster.pin_list(), before);

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_peer_appears_as_error_entry() {
    let daemon = MockDaemon::new();
    let (cluster, _dir) = standalone(daemon);
    cluster.wait_ready().await.unwrap();

    // A peer nobody is listening for.
    cluster
        .peer_manager()
        .add(&PeerAddr::new(2, "127.0.0.1:1"));

    cluster.pin(cid("QmX"), PinOptions::default()).await.unwrap();
    wait_until(Duration::from_secs(1), "QmX pinned locally", || {
        cluster.tracker().status(&cid("QmX")).status == TrackerStatus::Pinned
    })
    .await;

    let global = cluster.status(&cid("QmX")).await;
    assert_eq!(
        global.peer_map.get(&1).unwrap().status,
        TrackerStatus::Pinned
    );
    let remote = global.peer_map.get(&2).unwrap();
    assert_eq!(remote.status, TrackerStatus::ClusterError);
    assert!(remote.error.is_some());

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allocator_prefers_least_loaded_candidate() {
    let daemon = MockDaemon::new();
    let (cluster, _dir) = standalone(daemon);
    cluster.wait_ready().await.unwrap();

    cluster
        .peer_manager()
        .add(&PeerAddr::new(2, "127.0.0.1:1"));
    cluster.monitor().log_metric(fresh_metric(1, "5"));
    cluster.monitor().log_metric(fresh_metric(2, "0"));

    cluster.pin(cid("QmX"), pin_opts(1)).await.unwrap();

    let pins = cluster.pin_list();
    assert_eq!(pins[0].allocations.len(), 1);
    assert!(pins[0].allocations.contains(&2));

    // The local tracker, not being allocated, marks the pin remote.
    wait_until(Duration::from_secs(1), "QmX remote on peer 1", || {
        cluster.tracker().status(&cid("QmX")).status == TrackerStatus::Remote
    })
    .await;

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pin_fails_without_enough_candidates() {
    let daemon = MockDaemon::new();
    let (cluster, _dir) = standalone(daemon);
    cluster.wait_ready().await.unwrap();

    // No metrics at all: nobody is eligible.
    let err = cluster.pin(cid("QmX"), pin_opts(2)).await.unwrap_err();
    assert!(err.to_string().contains("allocation failed"));
    assert!(cluster.pin_list().is_empty());

    cluster.stop().await.unwrap();
}

// =============================================================================
// Two-peer cluster over real RPC
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_peer_pin_with_leader_forwarding() {
    let listener1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr1 = listener1.local_addr().unwrap().to_string();
    let addr2 = listener2.local_addr().unwrap().to_string();

    let peers = vec![
        PeerAddr::new(1, addr1.clone()),
        PeerAddr::new(2, addr2.clone()),
    ];

    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();
    let daemon1 = MockDaemon::new();
    let daemon2 = MockDaemon::new();

    let mut config1 = ClusterConfig::standalone(1, dir1.path());
    config1.cluster_listen_address = addr1;
    config1.cluster_peers = peers.clone();
    let mut config2 = ClusterConfig::standalone(2, dir2.path());
    config2.cluster_listen_address = addr2;
    config2.cluster_peers = peers;

    let cluster1 = build_cluster(config1, Arc::clone(&daemon1)).unwrap();
    let cluster2 = build_cluster(config2, Arc::clone(&daemon2)).unwrap();

    let _server1 = tokio::spawn(RpcServer::serve_listener(Arc::clone(&cluster1), listener1));
    let _server2 = tokio::spawn(RpcServer::serve_listener(Arc::clone(&cluster2), listener2));

    tokio::time::timeout(Duration::from_secs(30), async {
        cluster1.wait_ready().await.unwrap();
        cluster2.wait_ready().await.unwrap();
    })
    .await
    .expect("two-peer cluster failed to elect a leader");

    // Drive the pin through the follower to exercise forwarding.
    let follower = if cluster1.consensus().is_leader() {
        Arc::clone(&cluster2)
    } else {
        Arc::clone(&cluster1)
    };

    follower.monitor().log_metric(fresh_metric(1, "0"));
    follower.monitor().log_metric(fresh_metric(2, "1"));
    follower.pin(cid("QmY"), pin_opts(1)).await.unwrap();

    // The committed spec replicates to both peers.
    wait_until(Duration::from_secs(10), "spec replicated", || {
        cluster1.pin_list().len() == 1 && cluster2.pin_list().len() == 1
    })
    .await;

    let spec = cluster1.pin_list().remove(0);
    assert_eq!(spec.allocations.len(), 1);
    assert!(spec.allocations.contains(&1));

    // Allocation lands on peer 1; peer 2 marks it remote.
    wait_until(Duration::from_secs(10), "trackers converge", || {
        cluster1.tracker().status(&cid("QmY")).status == TrackerStatus::Pinned
            && cluster2.tracker().status(&cid("QmY")).status == TrackerStatus::Remote
    })
    .await;
    assert!(daemon1.holds(&cid("QmY")));
    assert!(!daemon2.holds(&cid("QmY")));

    // Aggregation sees both peers.
    let global = follower.status(&cid("QmY")).await;
    assert_eq!(global.peer_map.len(), 2);
    assert_eq!(
        global.peer_map.get(&1).unwrap().status,
        TrackerStatus::Pinned
    );
    assert_eq!(
        global.peer_map.get(&2).unwrap().status,
        TrackerStatus::Remote
    );

    cluster1.stop().await.unwrap();
    cluster2.stop().await.unwrap();
}
