//! REST API.
//!
//! Thin HTTP glue over the coordinator: 200 with a JSON body on read
//! success, 202 for accepted mutations, 204 for empty success, 400 with
//! `{code,message}` on parse errors, 500 on internal errors.

use crate::cluster::{Cluster, PinOptions};
use crate::error::{PinhiveError, Result};
use crate::rpc::ErrorBody;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

fn error_response(code: StatusCode, message: String) -> Response {
    (
        code,
        Json(ErrorBody {
            code: code.as_u16(),
            message,
        }),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    error_response(StatusCode::BAD_REQUEST, message)
}

fn internal_error(e: PinhiveError) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Deserialize)]
struct PeerAddBody {
    peer_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct PinQuery {
    replication_factor: Option<i32>,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct VersionBody {
    version: String,
}

/// REST API server, bound on the API listen address.
pub struct ApiServer;

impl ApiServer {
    pub fn router(cluster: Arc<Cluster>) -> Router {
        Router::new()
            .route("/id", get(id_handler))
            .route("/version", get(version_handler))
            .route("/peers", get(peer_list_handler).post(peer_add_handler))
            .route("/peers/:peer", delete(peer_remove_handler))
            .route("/pinlist", get(pin_list_handler))
            .route("/pins", get(status_all_handler))
            .route("/pins/sync", post(sync_all_handler))
            .route(
                "/pins/:cid",
                get(status_handler).post(pin_handler).delete(unpin_handler),
            )
            .route("/pins/:cid/sync", post(sync_handler))
            .route("/pins/:cid/recover", post(recover_handler))
            .with_state(cluster)
    }

    /// Bind and serve until the shutdown signal fires.
    pub async fn serve(cluster: Arc<Cluster>, addr: &str) -> Result<()> {
        let shutdown = cluster.shutdown_coordinator().clone();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "REST API listening");

        axum::serve(listener, Self::router(cluster))
            .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
            .await
            .map_err(|e| PinhiveError::Transport(e.to_string()))
    }
}

fn parse_cid(raw: &str) -> std::result::Result<crate::types::Cid, Response> {
    raw.parse()
        .map_err(|e: PinhiveError| bad_request(format!("error decoding cid: {e}")))
}

async fn id_handler(State(cluster): State<Arc<Cluster>>) -> Response {
    Json(cluster.id().await).into_response()
}

async fn version_handler(State(cluster): State<Arc<Cluster>>) -> Response {
    Json(VersionBody {
        version: cluster.version().to_string(),
    })
    .into_response()
}

async fn peer_list_handler(State(cluster): State<Arc<Cluster>>) -> Response {
    Json(cluster.peers().await).into_response()
}

async fn peer_add_handler(
    State(cluster): State<Arc<Cluster>>,
    body: std::result::Result<Json<PeerAddBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return bad_request("error decoding request body".into());
    };
    let addr = match body.peer_address.parse() {
        Ok(addr) => addr,
        Err(e) => return bad_request(format!("error decoding peer_address: {e}")),
    };
    match cluster.peer_add(&addr).await {
        Ok(identity) => Json(identity).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn peer_remove_handler(
    State(cluster): State<Arc<Cluster>>,
    Path(peer): Path<String>,
) -> Response {
    let peer = match peer.parse() {
        Ok(peer) => peer,
        Err(_) => return bad_request(format!("error decoding peer id: {peer}")),
    };
    match cluster.peer_remove(peer).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn pin_list_handler(State(cluster): State<Arc<Cluster>>) -> Response {
    Json(cluster.pin_list()).into_response()
}

async fn status_all_handler(State(cluster): State<Arc<Cluster>>) -> Response {
    Json(cluster.status_all().await).into_response()
}

async fn status_handler(State(cluster): State<Arc<Cluster>>, Path(cid): Path<String>) -> Response {
    match parse_cid(&cid) {
        Ok(cid) => Json(cluster.status(&cid).await).into_response(),
        Err(resp) => resp,
    }
}

async fn pin_handler(
    State(cluster): State<Arc<Cluster>>,
    Path(cid): Path<String>,
    Query(query): Query<PinQuery>,
) -> Response {
    let cid = match parse_cid(&cid) {
        Ok(cid) => cid,
        Err(resp) => return resp,
    };
    let opts = PinOptions {
        replication_factor: query.replication_factor,
        name: query.name,
    };
    match cluster.pin(cid, opts).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn unpin_handler(State(cluster): State<Arc<Cluster>>, Path(cid): Path<String>) -> Response {
    let cid = match parse_cid(&cid) {
        Ok(cid) => cid,
        Err(resp) => return resp,
    };
    match cluster.unpin(&cid).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn sync_all_handler(State(cluster): State<Arc<Cluster>>) -> Response {
    Json(cluster.sync_all().await).into_response()
}

async fn sync_handler(State(cluster): State<Arc<Cluster>>, Path(cid): Path<String>) -> Response {
    match parse_cid(&cid) {
        Ok(cid) => Json(cluster.sync(&cid).await).into_response(),
        Err(resp) => resp,
    }
}

async fn recover_handler(State(cluster): State<Arc<Cluster>>, Path(cid): Path<String>) -> Response {
    match parse_cid(&cid) {
        Ok(cid) => Json(cluster.recover(&cid).await).into_response(),
        Err(resp) => resp,
    }
}
