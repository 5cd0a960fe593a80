//! The served side of the peer-to-peer RPC namespace.

use super::{
    AddrRequest, CidRequest, Empty, ErrorBody, FilterRequest, MetricRequest, NameRequest,
    PeerRequest, PinRequest, SpecRequest, SECRET_HEADER,
};
use crate::cluster::{Cluster, PinOptions};
use crate::error::{PinhiveError, Result};
use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftCommand, RequestVoteRequest, RequestVoteResponse,
};
use crate::types::{
    ClusterIdentity, DaemonPinStatus, GlobalPinInfo, Metric, PeerAddr, PinInfo, PinSpec,
};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::info;

type RpcResult<T> = std::result::Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

fn fail<T>(e: PinhiveError) -> RpcResult<T> {
    let code = StatusCode::INTERNAL_SERVER_ERROR;
    Err((
        code,
        Json(ErrorBody {
            code: code.as_u16(),
            message: e.to_string(),
        }),
    ))
}

fn ok_or<T>(result: Result<T>) -> RpcResult<T> {
    match result {
        Ok(v) => Ok(Json(v)),
        Err(e) => fail(e),
    }
}

/// RPC server for one peer: Raft transport plus the cluster method
/// namespace, bound on the cluster listen address.
pub struct RpcServer;

impl RpcServer {
    pub fn router(cluster: Arc<Cluster>) -> Router {
        let router = Router::new()
            // Raft transport
            .route("/raft/request_vote", post(raft_request_vote))
            .route("/raft/append_entries", post(raft_append_entries))
            .route("/raft/install_snapshot", post(raft_install_snapshot))
            // Coordinator methods
            .route("/rpc/id", post(rpc_id))
            .route("/rpc/pin", post(rpc_pin))
            .route("/rpc/unpin", post(rpc_unpin))
            .route("/rpc/pin_list", post(rpc_pin_list))
            .route("/rpc/peers", post(rpc_peers))
            .route("/rpc/peer_add", post(rpc_peer_add))
            .route("/rpc/peer_remove", post(rpc_peer_remove))
            .route("/rpc/status", post(rpc_status))
            .route("/rpc/status_all", post(rpc_status_all))
            .route("/rpc/sync", post(rpc_sync))
            .route("/rpc/sync_all", post(rpc_sync_all))
            .route("/rpc/recover", post(rpc_recover))
            // Tracker methods
            .route("/rpc/track", post(rpc_track))
            .route("/rpc/untrack", post(rpc_untrack))
            .route("/rpc/tracker_status", post(rpc_tracker_status))
            .route("/rpc/tracker_status_all", post(rpc_tracker_status_all))
            .route("/rpc/tracker_sync", post(rpc_tracker_sync))
            .route("/rpc/tracker_sync_all", post(rpc_tracker_sync_all))
            .route("/rpc/tracker_recover", post(rpc_tracker_recover))
            // Daemon connector methods
            .route("/rpc/daemon_pin", post(rpc_daemon_pin))
            .route("/rpc/daemon_unpin", post(rpc_daemon_unpin))
            .route("/rpc/daemon_pin_ls_cid", post(rpc_daemon_pin_ls_cid))
            .route("/rpc/daemon_pin_ls", post(rpc_daemon_pin_ls))
            // Consensus methods
            .route("/rpc/consensus_log_pin", post(rpc_consensus_log_pin))
            .route("/rpc/consensus_log_unpin", post(rpc_consensus_log_unpin))
            .route(
                "/rpc/consensus_log_add_peer",
                post(rpc_consensus_log_add_peer),
            )
            .route(
                "/rpc/consensus_log_rm_peer",
                post(rpc_consensus_log_rm_peer),
            )
            // Peer manager methods
            .route("/rpc/peer_manager_add_peer", post(rpc_peer_manager_add_peer))
            .route("/rpc/peer_manager_rm_peer", post(rpc_peer_manager_rm_peer))
            .route("/rpc/peer_manager_peers", post(rpc_peer_manager_peers))
            // Monitor methods
            .route(
                "/rpc/peer_monitor_log_metric",
                post(rpc_peer_monitor_log_metric),
            )
            .route(
                "/rpc/peer_monitor_last_metrics",
                post(rpc_peer_monitor_last_metrics),
            )
            .route("/rpc/remote_addr_for_peer", post(rpc_remote_addr_for_peer));

        router
            .layer(middleware::from_fn_with_state(
                Arc::clone(&cluster),
                secret_guard,
            ))
            .with_state(cluster)
    }

    /// Bind and serve until the shutdown signal fires.
    pub async fn serve(cluster: Arc<Cluster>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        Self::serve_listener(cluster, listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve_listener(cluster: Arc<Cluster>, listener: TcpListener) -> Result<()> {
        let shutdown = cluster.shutdown_coordinator().clone();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "cluster RPC listening");
        }

        axum::serve(listener, Self::router(cluster))
            .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
            .await
            .map_err(|e| PinhiveError::Transport(e.to_string()))
    }
}

/// Rejects requests that do not carry the shared cluster secret.
async fn secret_guard(
    State(cluster): State<Arc<Cluster>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(secret) = cluster.secret() {
        let presented = request
            .headers()
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if presented != Some(secret.as_str()) {
            let code = StatusCode::UNAUTHORIZED;
            return (
                code,
                Json(ErrorBody {
                    code: code.as_u16(),
                    message: "bad or missing cluster secret".into(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

// ---- Raft transport ----

async fn raft_request_vote(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<RequestVoteRequest>,
) -> Json<RequestVoteResponse> {
    let handle = cluster.consensus().raft_handle();
    let (tx, rx) = oneshot::channel();
    let fallback = RequestVoteResponse {
        term: 0,
        vote_granted: false,
    };
    if handle
        .command_tx
        .send(RaftCommand::RequestVote {
            request,
            response: tx,
        })
        .await
        .is_err()
    {
        return Json(fallback);
    }
    Json(rx.await.unwrap_or(fallback))
}

async fn raft_append_entries(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    let handle = cluster.consensus().raft_handle();
    let (tx, rx) = oneshot::channel();
    let fallback = AppendEntriesResponse {
        term: 0,
        success: false,
        match_index: 0,
        conflict_index: None,
        conflict_term: None,
    };
    if handle
        .command_tx
        .send(RaftCommand::AppendEntries {
            request,
            response: tx,
        })
        .await
        .is_err()
    {
        return Json(fallback);
    }
    Json(rx.await.unwrap_or(fallback))
}

async fn raft_install_snapshot(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<InstallSnapshotRequest>,
) -> Json<InstallSnapshotResponse> {
    let handle = cluster.consensus().raft_handle();
    let (tx, rx) = oneshot::channel();
    let fallback = InstallSnapshotResponse {
        term: 0,
        success: false,
    };
    if handle
        .command_tx
        .send(RaftCommand::InstallSnapshot {
            request,
            response: tx,
        })
        .await
        .is_err()
    {
        return Json(fallback);
    }
    Json(rx.await.unwrap_or(fallback))
}

// ---- Coordinator methods ----

async fn rpc_id(State(cluster): State<Arc<Cluster>>) -> Json<ClusterIdentity> {
    Json(cluster.id().await)
}

async fn rpc_pin(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<PinRequest>,
) -> RpcResult<Empty> {
    let opts = PinOptions {
        replication_factor: request.replication_factor,
        name: request.name,
    };
    ok_or(cluster.pin(request.cid, opts).await.map(|_| Empty {}))
}

async fn rpc_unpin(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> RpcResult<Empty> {
    ok_or(cluster.unpin(&request.cid).await.map(|_| Empty {}))
}

async fn rpc_pin_list(State(cluster): State<Arc<Cluster>>) -> Json<Vec<PinSpec>> {
    Json(cluster.pin_list())
}

async fn rpc_peers(State(cluster): State<Arc<Cluster>>) -> Json<Vec<ClusterIdentity>> {
    Json(cluster.peers().await)
}

async fn rpc_peer_add(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<AddrRequest>,
) -> RpcResult<ClusterIdentity> {
    ok_or(cluster.peer_add(&request.address).await)
}

async fn rpc_peer_remove(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<PeerRequest>,
) -> RpcResult<Empty> {
    ok_or(cluster.peer_remove(request.peer).await.map(|_| Empty {}))
}

async fn rpc_status(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> Json<GlobalPinInfo> {
    Json(cluster.status(&request.cid).await)
}

async fn rpc_status_all(State(cluster): State<Arc<Cluster>>) -> Json<Vec<GlobalPinInfo>> {
    Json(cluster.status_all().await)
}

async fn rpc_sync(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> Json<GlobalPinInfo> {
    Json(cluster.sync(&request.cid).await)
}

async fn rpc_sync_all(State(cluster): State<Arc<Cluster>>) -> Json<Vec<GlobalPinInfo>> {
    Json(cluster.sync_all().await)
}

async fn rpc_recover(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> Json<GlobalPinInfo> {
    Json(cluster.recover(&request.cid).await)
}

// ---- Tracker methods ----

async fn rpc_track(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<SpecRequest>,
) -> RpcResult<Empty> {
    ok_or(cluster.tracker().track(request.spec).await.map(|_| Empty {}))
}

async fn rpc_untrack(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> RpcResult<Empty> {
    ok_or(
        cluster
            .tracker()
            .untrack(&request.cid)
            .await
            .map(|_| Empty {}),
    )
}

async fn rpc_tracker_status(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> Json<PinInfo> {
    Json(cluster.tracker().status(&request.cid))
}

async fn rpc_tracker_status_all(State(cluster): State<Arc<Cluster>>) -> Json<Vec<PinInfo>> {
    Json(cluster.tracker().status_all())
}

async fn rpc_tracker_sync(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> RpcResult<PinInfo> {
    ok_or(cluster.tracker().sync(&request.cid).await)
}

async fn rpc_tracker_sync_all(State(cluster): State<Arc<Cluster>>) -> RpcResult<Vec<PinInfo>> {
    ok_or(cluster.tracker().sync_all().await)
}

async fn rpc_tracker_recover(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> RpcResult<PinInfo> {
    ok_or(cluster.tracker().recover(&request.cid).await)
}

// ---- Daemon connector methods ----

async fn rpc_daemon_pin(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> RpcResult<Empty> {
    ok_or(cluster.connector().pin(&request.cid).await.map(|_| Empty {}))
}

async fn rpc_daemon_unpin(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> RpcResult<Empty> {
    ok_or(
        cluster
            .connector()
            .unpin(&request.cid)
            .await
            .map(|_| Empty {}),
    )
}

async fn rpc_daemon_pin_ls_cid(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> RpcResult<DaemonPinStatus> {
    ok_or(cluster.connector().pin_ls_cid(&request.cid).await)
}

async fn rpc_daemon_pin_ls(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<FilterRequest>,
) -> RpcResult<HashMap<crate::types::Cid, DaemonPinStatus>> {
    ok_or(cluster.connector().pin_ls(&request.filter).await)
}

// ---- Consensus methods ----

async fn rpc_consensus_log_pin(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<SpecRequest>,
) -> RpcResult<Empty> {
    ok_or(
        cluster
            .consensus()
            .log_pin(request.spec)
            .await
            .map(|_| Empty {}),
    )
}

async fn rpc_consensus_log_unpin(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<CidRequest>,
) -> RpcResult<Empty> {
    ok_or(
        cluster
            .consensus()
            .log_unpin(&request.cid)
            .await
            .map(|_| Empty {}),
    )
}

async fn rpc_consensus_log_add_peer(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<AddrRequest>,
) -> RpcResult<Empty> {
    ok_or(
        cluster
            .consensus()
            .log_add_peer(&request.address)
            .await
            .map(|_| Empty {}),
    )
}

async fn rpc_consensus_log_rm_peer(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<PeerRequest>,
) -> RpcResult<Empty> {
    ok_or(
        cluster
            .consensus()
            .log_rm_peer(request.peer)
            .await
            .map(|_| Empty {}),
    )
}

// ---- Peer manager methods ----

async fn rpc_peer_manager_add_peer(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<AddrRequest>,
) -> Json<Empty> {
    cluster.peer_manager().add(&request.address);
    Json(Empty {})
}

async fn rpc_peer_manager_rm_peer(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<PeerRequest>,
) -> Json<Empty> {
    cluster.peer_manager().remove(request.peer);
    Json(Empty {})
}

async fn rpc_peer_manager_peers(State(cluster): State<Arc<Cluster>>) -> Json<Vec<PeerAddr>> {
    Json(cluster.peer_manager().peers())
}

// ---- Monitor methods ----

async fn rpc_peer_monitor_log_metric(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<MetricRequest>,
) -> Json<Empty> {
    cluster.monitor().log_metric(request.metric);
    Json(Empty {})
}

async fn rpc_peer_monitor_last_metrics(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<NameRequest>,
) -> Json<Vec<Metric>> {
    Json(cluster.monitor().last_metrics(&request.name))
}

async fn rpc_remote_addr_for_peer(
    State(cluster): State<Arc<Cluster>>,
    Json(request): Json<PeerRequest>,
) -> RpcResult<PeerAddr> {
    match cluster.peer_manager().addr_of(request.peer) {
        Some(addr) => Ok(Json(addr)),
        None => fail(PinhiveError::PeerNotFound(request.peer)),
    }
}
