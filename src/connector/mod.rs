//! Adapter to the local content-addressed storage daemon.
//!
//! The cluster only coordinates names; the daemon moves bytes. Everything
//! pinhive needs from it fits in the [`DaemonConnector`] trait, and
//! [`HttpConnector`] implements it against the daemon's HTTP API.

use crate::error::{PinhiveError, Result};
use crate::types::{Cid, DaemonPinStatus};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// How long a pin request may run. Pins legitimately take minutes while
/// the daemon fetches content.
const DAEMON_PIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Timeout for quick queries (id, pin listings, unpins).
const DAEMON_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Interface to the storage daemon.
///
/// All operations are idempotent: pinning a pinned CID succeeds, unpinning
/// an unpinned CID succeeds.
#[async_trait::async_trait]
pub trait DaemonConnector: Send + Sync {
    /// The daemon's own identity string.
    async fn id(&self) -> Result<String>;

    /// Ask the daemon to retain the content.
    async fn pin(&self, cid: &Cid) -> Result<()>;

    /// Ask the daemon to release the content.
    async fn unpin(&self, cid: &Cid) -> Result<()>;

    /// The daemon's view of one CID.
    async fn pin_ls_cid(&self, cid: &Cid) -> Result<DaemonPinStatus>;

    /// The daemon's full pin listing, optionally filtered by pin type.
    async fn pin_ls(&self, filter: &str) -> Result<HashMap<Cid, DaemonPinStatus>>;
}

#[derive(Debug, Deserialize)]
struct DaemonIdResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct DaemonPinLsResponse {
    #[serde(rename = "Keys", default)]
    keys: HashMap<String, DaemonPinEntry>,
}

#[derive(Debug, Deserialize)]
struct DaemonPinEntry {
    #[serde(rename = "Type")]
    pin_type: String,
}

/// HTTP client for the daemon's API (`/api/v0/...`).
pub struct HttpConnector {
    base_url: String,
    client: reqwest::Client,
    pin_client: reqwest::Client,
}

impl HttpConnector {
    /// Build a connector for a daemon listening at `host:port`.
    pub fn new(daemon_addr: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DAEMON_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PinhiveError::Daemon(e.to_string()))?;
        let pin_client = reqwest::Client::builder()
            .timeout(DAEMON_PIN_TIMEOUT)
            .build()
            .map_err(|e| PinhiveError::Daemon(e.to_string()))?;

        Ok(Self {
            base_url: format!("http://{daemon_addr}/api/v0"),
            client,
            pin_client,
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(PinhiveError::Daemon(format!("{status}: {body}")))
        }
    }

    fn parse_status(pin_type: &str) -> DaemonPinStatus {
        match pin_type {
            "recursive" | "direct" | "indirect" => DaemonPinStatus::Pinned,
            "pinning" => DaemonPinStatus::Pinning,
            "unpinning" => DaemonPinStatus::Unpinning,
            _ => DaemonPinStatus::Error,
        }
    }
}

#[async_trait::async_trait]
impl DaemonConnector for HttpConnector {
    async fn id(&self) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/id", self.base_url))
            .send()
            .await?;
        let body: DaemonIdResponse = Self::check(response).await?.json().await?;
        Ok(body.id)
    }

    async fn pin(&self, cid: &Cid) -> Result<()> {
        let response = self
            .pin_client
            .post(format!("{}/pin/add", self.base_url))
            .query(&[("arg", cid.as_str())])
            .send()
            .await?;
        Self::check(response).await?;
        tracing::debug!(%cid, "daemon pinned");
        Ok(())
    }

    async fn unpin(&self, cid: &Cid) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/pin/rm", self.base_url))
            .query(&[("arg", cid.as_str())])
            .send()
            .await?;

        // Unpinning something the daemon does not hold counts as success.
        match Self::check(response).await {
            Ok(_) => {
                tracing::debug!(%cid, "daemon unpinned");
                Ok(())
            }
            Err(PinhiveError::Daemon(msg)) if msg.contains("not pinned") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn pin_ls_cid(&self, cid: &Cid) -> Result<DaemonPinStatus> {
        let response = self
            .client
            .post(format!("{}/pin/ls", self.base_url))
            .query(&[("arg", cid.as_str())])
            .send()
            .await?;

        match Self::check(response).await {
            Ok(ok) => {
                let body: DaemonPinLsResponse = ok.json().await?;
                Ok(body
                    .keys
                    .get(cid.as_str())
                    .map(|e| Self::parse_status(&e.pin_type))
                    .unwrap_or(DaemonPinStatus::Unpinned))
            }
            // The daemon reports unknown CIDs as an error rather than an
            // empty listing.
            Err(PinhiveError::Daemon(msg)) if msg.contains("not pinned") => {
                Ok(DaemonPinStatus::Unpinned)
            }
            Err(e) => Err(e),
        }
    }

    async fn pin_ls(&self, filter: &str) -> Result<HashMap<Cid, DaemonPinStatus>> {
        let response = self
            .client
            .post(format!("{}/pin/ls", self.base_url))
            .query(&[("type", filter)])
            .send()
            .await?;
        let body: DaemonPinLsResponse = Self::check(response).await?.json().await?;

        let mut pins = HashMap::with_capacity(body.keys.len());
        for (raw, entry) in body.keys {
            match raw.parse::<Cid>() {
                Ok(cid) => {
                    pins.insert(cid, Self::parse_status(&entry.pin_type));
                }
                Err(_) => {
                    tracing::warn!(cid = %raw, "daemon reported an unparsable cid");
                }
            }
        }
        Ok(pins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(
            HttpConnector::parse_status("recursive"),
            DaemonPinStatus::Pinned
        );
        assert_eq!(
            HttpConnector::parse_status("indirect"),
            DaemonPinStatus::Pinned
        );
        assert_eq!(
            HttpConnector::parse_status("pinning"),
            DaemonPinStatus::Pinning
        );
        assert_eq!(
            HttpConnector::parse_status("garbage"),
            DaemonPinStatus::Error
        );
    }

    #[test]
    fn test_base_url() {
        let connector = HttpConnector::new("127.0.0.1:5001").unwrap();
        assert_eq!(connector.base_url, "http://127.0.0.1:5001/api/v0");
    }
}
