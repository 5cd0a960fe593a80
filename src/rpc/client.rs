//! Typed RPC client and the HTTP Raft transport.

use super::{
    AddrRequest, CidRequest, Empty, ErrorBody, FilterRequest, MetricRequest, NameRequest,
    PeerRequest, SpecRequest, SECRET_HEADER,
};
use crate::error::{PinhiveError, Result};
use crate::peers::AddressBook;
use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftTransport, RequestVoteRequest, RequestVoteResponse,
};
use crate::types::{
    Cid, ClusterIdentity, DaemonPinStatus, Metric, PeerAddr, PeerId, PinInfo, PinSpec,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Deadline for ordinary cluster RPCs.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Connect deadline for all peer dials.
const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for Raft messages, which must stay well under election
/// timeouts worth of retries.
const RAFT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(RPC_CONNECT_TIMEOUT)
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Typed client for the `/rpc/...` method namespace.
pub struct RpcClient {
    book: AddressBook,
    client: reqwest::Client,
    secret: Option<String>,
}

impl RpcClient {
    pub fn new(book: AddressBook, secret: Option<String>) -> Self {
        Self {
            book,
            client: build_client(RPC_TIMEOUT),
            secret,
        }
    }

    fn url_for(&self, peer: PeerId, path: &str) -> Result<String> {
        let book = self.book.read();
        let addr = book.get(&peer).ok_or(PinhiveError::PeerNotFound(peer))?;
        Ok(format!("http://{addr}/{path}"))
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        peer: PeerId,
        method: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = self.url_for(peer, &format!("rpc/{method}"))?;
        let mut request = self.client.post(&url).json(body);
        if let Some(secret) = &self.secret {
            request = request.header(SECRET_HEADER, secret);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let status = response.status();
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.message,
                Err(_) => format!("rpc {method} to peer {peer} failed with {status}"),
            };
            Err(PinhiveError::Transport(message))
        }
    }

    pub async fn id(&self, peer: PeerId) -> Result<ClusterIdentity> {
        self.post(peer, "id", &Empty {}).await
    }

    pub async fn track(&self, peer: PeerId, spec: &PinSpec) -> Result<()> {
        let _: Empty = self
            .post(peer, "track", &SpecRequest { spec: spec.clone() })
            .await?;
        Ok(())
    }

    pub async fn untrack(&self, peer: PeerId, cid: &Cid) -> Result<()> {
        let _: Empty = self
            .post(peer, "untrack", &CidRequest { cid: cid.clone() })
            .await?;
        Ok(())
    }

    pub async fn tracker_status(&self, peer: PeerId, cid: &Cid) -> Result<PinInfo> {
        self.post(peer, "tracker_status", &CidRequest { cid: cid.clone() })
            .await
    }

    pub async fn tracker_status_all(&self, peer: PeerId) -> Result<Vec<PinInfo>> {
        self.post(peer, "tracker_status_all", &Empty {}).await
    }

    pub async fn tracker_sync(&self, peer: PeerId, cid: &Cid) -> Result<PinInfo> {
        self.post(peer, "tracker_sync", &CidRequest { cid: cid.clone() })
            .await
    }

    pub async fn tracker_sync_all(&self, peer: PeerId) -> Result<Vec<PinInfo>> {
        self.post(peer, "tracker_sync_all", &Empty {}).await
    }

    pub async fn tracker_recover(&self, peer: PeerId, cid: &Cid) -> Result<PinInfo> {
        self.post(peer, "tracker_recover", &CidRequest { cid: cid.clone() })
            .await
    }

    pub async fn daemon_pin(&self, peer: PeerId, cid: &Cid) -> Result<()> {
        let _: Empty = self
            .post(peer, "daemon_pin", &CidRequest { cid: cid.clone() })
            .await?;
        Ok(())
    }

    pub async fn daemon_unpin(&self, peer: PeerId, cid: &Cid) -> Result<()> {
        let _: Empty = self
            .post(peer, "daemon_unpin", &CidRequest { cid: cid.clone() })
            .await?;
        Ok(())
    }

    pub async fn daemon_pin_ls_cid(&self, peer: PeerId, cid: &Cid) -> Result<DaemonPinStatus> {
        self.post(peer, "daemon_pin_ls_cid", &CidRequest { cid: cid.clone() })
            .await
    }

    pub async fn daemon_pin_ls(
        &self,
        peer: PeerId,
        filter: &str,
    ) -> Result<HashMap<Cid, DaemonPinStatus>> {
        self.post(
            peer,
            "daemon_pin_ls",
            &FilterRequest {
                filter: filter.to_string(),
            },
        )
        .await
    }

    pub async fn consensus_log_pin(&self, peer: PeerId, spec: &PinSpec) -> Result<()> {
        let _: Empty = self
            .post(peer, "consensus_log_pin", &SpecRequest { spec: spec.clone() })
            .await?;
        Ok(())
    }

    pub async fn consensus_log_unpin(&self, peer: PeerId, cid: &Cid) -> Result<()> {
        let _: Empty = self
            .post(peer, "consensus_log_unpin", &CidRequest { cid: cid.clone() })
            .await?;
        Ok(())
    }

    pub async fn consensus_log_add_peer(&self, peer: PeerId, address: &PeerAddr) -> Result<()> {
        let _: Empty = self
            .post(
                peer,
                "consensus_log_add_peer",
                &AddrRequest {
                    address: address.clone(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn consensus_log_rm_peer(&self, peer: PeerId, target: PeerId) -> Result<()> {
        let _: Empty = self
            .post(peer, "consensus_log_rm_peer", &PeerRequest { peer: target })
            .await?;
        Ok(())
    }

    pub async fn peer_add(&self, peer: PeerId, address: &PeerAddr) -> Result<ClusterIdentity> {
        self.post(
            peer,
            "peer_add",
            &AddrRequest {
                address: address.clone(),
            },
        )
        .await
    }

    pub async fn peer_manager_add_peer(&self, peer: PeerId, address: &PeerAddr) -> Result<()> {
        let _: Empty = self
            .post(
                peer,
                "peer_manager_add_peer",
                &AddrRequest {
                    address: address.clone(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn peer_manager_rm_peer(&self, peer: PeerId, target: PeerId) -> Result<()> {
        let _: Empty = self
            .post(peer, "peer_manager_rm_peer", &PeerRequest { peer: target })
            .await?;
        Ok(())
    }

    pub async fn peer_manager_peers(&self, peer: PeerId) -> Result<Vec<PeerAddr>> {
        self.post(peer, "peer_manager_peers", &Empty {}).await
    }

    pub async fn monitor_log_metric(&self, peer: PeerId, metric: &Metric) -> Result<()> {
        let _: Empty = self
            .post(
                peer,
                "peer_monitor_log_metric",
                &MetricRequest {
                    metric: metric.clone(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn monitor_last_metrics(&self, peer: PeerId, name: &str) -> Result<Vec<Metric>> {
        self.post(
            peer,
            "peer_monitor_last_metrics",
            &NameRequest {
                name: name.to_string(),
            },
        )
        .await
    }

    /// The address `peer` has recorded for `target`: how the rest of the
    /// cluster sees it. Used when joining through another peer.
    pub async fn remote_addr_for_peer(&self, peer: PeerId, target: PeerId) -> Result<PeerAddr> {
        self.post(peer, "remote_addr_for_peer", &PeerRequest { peer: target })
            .await
    }
}

/// Raft transport over the same address book.
pub struct RaftHttpTransport {
    book: AddressBook,
    client: reqwest::Client,
    secret: Option<String>,
}

impl RaftHttpTransport {
    pub fn new(book: AddressBook, secret: Option<String>) -> Self {
        Self {
            book,
            client: build_client(RAFT_RPC_TIMEOUT),
            secret,
        }
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        peer: PeerId,
        endpoint: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = {
            let book = self.book.read();
            let addr = book.get(&peer).ok_or(PinhiveError::PeerNotFound(peer))?;
            format!("http://{addr}/raft/{endpoint}")
        };
        let mut request = self.client.post(&url).json(body);
        if let Some(secret) = &self.secret {
            request = request.header(SECRET_HEADER, secret);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PinhiveError::Transport(format!(
                "raft {endpoint} to peer {peer} failed with {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl RaftTransport for RaftHttpTransport {
    async fn request_vote(
        &self,
        target: PeerId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        self.post(target, "request_vote", &request).await
    }

    async fn append_entries(
        &self,
        target: PeerId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.post(target, "append_entries", &request).await
    }

    async fn install_snapshot(
        &self,
        target: PeerId,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.post(target, "install_snapshot", &request).await
    }
}
