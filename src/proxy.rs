//! Transparent daemon proxy.
//!
//! Serves the storage daemon's HTTP API, hijacking the pin endpoints so
//! that existing daemon tooling transparently operates on the whole
//! cluster: `pin/add` becomes a cluster pin, `pin/rm` a cluster unpin and
//! `pin/ls` reads the agreed pin set. Every other request is forwarded to
//! the daemon untouched.

use crate::cluster::{Cluster, PinOptions};
use crate::error::{PinhiveError, Result};
use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct ProxyState {
    cluster: Arc<Cluster>,
    client: reqwest::Client,
    daemon_base: String,
}

#[derive(Debug, Deserialize)]
struct ArgQuery {
    arg: Option<String>,
}

#[derive(Debug, Serialize)]
struct PinResponse {
    #[serde(rename = "Pins")]
    pins: Vec<String>,
}

/// Errors in the daemon's own wire format, so its tooling renders them.
fn daemon_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "Message": message, "Code": 0, "Type": "error" })),
    )
        .into_response()
}

/// The daemon proxy server, bound on the proxy listen address.
pub struct ProxyServer;

impl ProxyServer {
    pub fn router(cluster: Arc<Cluster>, daemon_addr: &str) -> Router {
        let state = ProxyState {
            cluster,
            client: reqwest::Client::new(),
            daemon_base: format!("http://{daemon_addr}"),
        };
        Router::new()
            .route("/api/v0/pin/add", any(pin_add_handler))
            .route("/api/v0/pin/rm", any(pin_rm_handler))
            .route("/api/v0/pin/ls", any(pin_ls_handler))
            .fallback(forward_handler)
            .with_state(state)
    }

    /// Bind and serve until the shutdown signal fires.
    pub async fn serve(cluster: Arc<Cluster>, addr: &str, daemon_addr: &str) -> Result<()> {
        let shutdown = cluster.shutdown_coordinator().clone();
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "daemon proxy listening");

        axum::serve(listener, Self::router(cluster, daemon_addr))
            .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
            .await
            .map_err(|e| PinhiveError::Transport(e.to_string()))
    }
}

fn require_cid(arg: Option<String>) -> std::result::Result<crate::types::Cid, Response> {
    let raw = arg.ok_or_else(|| daemon_error("argument \"cid\" is required".into()))?;
    raw.parse()
        .map_err(|e: PinhiveError| daemon_error(e.to_string()))
}

async fn pin_add_handler(
    State(state): State<ProxyState>,
    Query(query): Query<ArgQuery>,
) -> Response {
    let cid = match require_cid(query.arg) {
        Ok(cid) => cid,
        Err(resp) => return resp,
    };
    debug!(%cid, "proxy: pin/add upgraded to cluster pin");
    match state.cluster.pin(cid.clone(), PinOptions::default()).await {
        Ok(()) => Json(PinResponse {
            pins: vec![cid.to_string()],
        })
        .into_response(),
        Err(e) => daemon_error(e.to_string()),
    }
}

async fn pin_rm_handler(
    State(state): State<ProxyState>,
    Query(query): Query<ArgQuery>,
) -> Response {
    let cid = match require_cid(query.arg) {
        Ok(cid) => cid,
        Err(resp) => return resp,
    };
    debug!(%cid, "proxy: pin/rm upgraded to cluster unpin");
    match state.cluster.unpin(&cid).await {
        Ok(()) => Json(PinResponse {
            pins: vec![cid.to_string()],
        })
        .into_response(),
        Err(e) => daemon_error(e.to_string()),
    }
}

async fn pin_ls_handler(
    State(state): State<ProxyState>,
    Query(query): Query<ArgQuery>,
) -> Response {
    let mut keys = BTreeMap::new();
    match query.arg {
        Some(raw) => {
            let cid = match raw.parse::<crate::types::Cid>() {
                Ok(cid) => cid,
                Err(e) => return daemon_error(e.to_string()),
            };
            match state.cluster.consensus().state().get(&cid) {
                Some(_) => {
                    keys.insert(cid.to_string(), json!({ "Type": "recursive" }));
                }
                None => {
                    return daemon_error(format!("path '{cid}' is not pinned"));
                }
            }
        }
        None => {
            for spec in state.cluster.pin_list() {
                keys.insert(spec.cid.to_string(), json!({ "Type": "recursive" }));
            }
        }
    }
    Json(json!({ "Keys": keys })).into_response()
}

/// Relay any other request to the daemon verbatim.
async fn forward_handler(State(state): State<ProxyState>, request: Request) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let url = format!("{}{}", state.daemon_base, path_and_query);

    let method = match *request.method() {
        Method::GET => reqwest::Method::GET,
        Method::POST => reqwest::Method::POST,
        Method::PUT => reqwest::Method::PUT,
        Method::DELETE => reqwest::Method::DELETE,
        Method::HEAD => reqwest::Method::HEAD,
        _ => return daemon_error("unsupported method".into()),
    };

    let body = match axum::body::to_bytes(request.into_body(), 16 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => return daemon_error(format!("reading request body: {e}")),
    };

    match state.client.request(method, &url).body(body).send().await {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let bytes: Bytes = response.bytes().await.unwrap_or_default();
            (status, bytes).into_response()
        }
        Err(e) => {
            warn!(error = %e, %url, "daemon forward failed");
            daemon_error(format!("daemon unreachable: {e}"))
        }
    }
}
