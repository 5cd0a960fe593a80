//! pinhive - replicated pin orchestration for content-addressed storage.
//!
//! pinhive coordinates a cluster of storage daemons so that an agreed set
//! of content identifiers stays replicated across chosen peers. Peers
//! agree on the pin set through a Raft-replicated log, each peer's tracker
//! drives its local daemon toward the agreed state, and a coordinator fans
//! work out over HTTP RPC and aggregates cluster-wide status.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          pinhive peer                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Surfaces: REST API | Daemon Proxy | CLI                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Coordinator: allocation | fan-out | status aggregation      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Consensus: Raft log | pin-set FSM | snapshots               │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Tracker: pin/unpin queues | reconciliation | recovery       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Daemon connector: pin add/rm/ls over the daemon HTTP API    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use pinhive::config::ClusterConfig;
//!
//! #[tokio::main]
//! async fn main() -> pinhive::Result<()> {
//!     let config = ClusterConfig::standalone(1, std::path::Path::new("/tmp/pinhive"));
//!     pinhive::run(config).await
//! }
//! ```

pub mod allocator;
pub mod api;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod connector;
pub mod consensus;
pub mod error;
pub mod informer;
pub mod monitor;
pub mod peers;
pub mod proxy;
pub mod raft;
pub mod rpc;
pub mod shutdown;
pub mod state;
pub mod tracker;
pub mod types;

pub use error::{PinhiveError, Result};

use crate::allocator::{NumPinAllocator, PinAllocator};
use crate::api::ApiServer;
use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::connector::{DaemonConnector, HttpConnector};
use crate::informer::{Informer, NumPinInformer};
use crate::proxy::ProxyServer;
use crate::rpc::RpcServer;
use crate::shutdown::{ShutdownCoordinator, SignalHandler};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Version of this peer. The whole cluster upgrades together; the RPC and
/// REST surfaces are tied to it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run a pinhive peer until a shutdown signal arrives.
pub async fn run(config: ClusterConfig) -> Result<()> {
    info!(peer = config.id, version = VERSION, "starting pinhive");

    let cluster_addr = config.cluster_listen_address.clone();
    let api_addr = config.api_listen_address.clone();
    let proxy_addr = config.proxy_listen_address.clone();
    let daemon_addr = config.daemon_node_address.clone();

    let shutdown = ShutdownCoordinator::new();
    let connector: Arc<dyn DaemonConnector> = Arc::new(HttpConnector::new(&daemon_addr)?);
    let informer: Arc<dyn Informer> =
        Arc::new(NumPinInformer::new(config.id, Arc::clone(&connector)));
    let allocator: Arc<dyn PinAllocator> = Arc::new(NumPinAllocator::new());

    let cluster = Cluster::new(config, connector, informer, allocator, shutdown.clone())?;

    // Served surfaces.
    let rpc_task = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            if let Err(e) = RpcServer::serve(cluster, &cluster_addr).await {
                error!(error = %e, "cluster RPC server failed");
            }
        })
    };
    let api_task = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            if let Err(e) = ApiServer::serve(cluster, &api_addr).await {
                error!(error = %e, "REST API server failed");
            }
        })
    };
    let proxy_task = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            if let Err(e) = ProxyServer::serve(cluster, &proxy_addr, &daemon_addr).await {
                error!(error = %e, "daemon proxy server failed");
            }
        })
    };

    let _signals = tokio::spawn(SignalHandler::new(shutdown.clone()).run());

    // Join through a bootstrap target when we have no static peer set.
    if let Err(e) = cluster.bootstrap().await {
        warn!(error = %e, "bootstrap failed, continuing standalone");
    }

    tokio::select! {
        ready = cluster.wait_ready() => {
            ready?;
            info!(peer = cluster.local_peer(), "pinhive is ready");
            shutdown.wait_for_shutdown().await;
        }
        _ = shutdown.wait_for_shutdown() => {}
    }
    cluster.stop().await?;

    let _ = tokio::join!(rpc_task, api_task, proxy_task);
    info!("pinhive stopped");
    Ok(())
}
