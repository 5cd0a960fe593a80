//! Peer-to-peer RPC over HTTP.
//!
//! Every peer serves the same method set on its cluster listen address:
//! the Raft transport under `/raft/...` and the cluster method namespace
//! under `/rpc/...`. Handlers are thin redirects into the coordinator and
//! its components; the client side is a typed wrapper over reqwest with a
//! deadline on every request. Wire bodies are JSON and accept string-form
//! CIDs and peer addresses.
//!
//! Calls addressed to the local peer never touch this module: the
//! coordinator dispatches those in-process.

mod client;
mod server;

pub use client::{RaftHttpTransport, RpcClient};
pub use server::RpcServer;

use crate::types::{Cid, Metric, PeerAddr, PeerId, PinSpec};
use serde::{Deserialize, Serialize};

/// Header carrying the shared cluster secret.
pub const SECRET_HEADER: &str = "x-pinhive-secret";

/// Empty request/response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Empty {}

/// Wire error body, mirrored by the REST surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CidRequest {
    pub cid: Cid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinRequest {
    pub cid: Cid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_factor: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecRequest {
    pub spec: PinSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRequest {
    pub peer: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrRequest {
    pub address: PeerAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRequest {
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRequest {
    pub metric: Metric,
}
