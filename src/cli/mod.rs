//! Command-line interface.
//!
//! `pinhive daemon` runs a peer; the remaining commands are thin HTTP
//! clients against a running peer's REST API.

use crate::error::{PinhiveError, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_HOST: &str = "127.0.0.1:9094";

/// pinhive - replicated pin orchestration for content-addressed storage.
#[derive(Parser)]
#[command(name = "pinhive")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "PINHIVE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a cluster peer
    Daemon {
        /// Configuration file path
        #[arg(short, long, env = "PINHIVE_CONFIG")]
        config: Option<PathBuf>,

        /// Peer id (overrides the config)
        #[arg(long)]
        id: Option<u64>,

        /// Data directory used when no config file is given
        #[arg(long, default_value = "/var/lib/pinhive")]
        data_dir: PathBuf,

        /// Cluster RPC bind address (overrides the config)
        #[arg(long)]
        cluster_addr: Option<String>,

        /// REST API bind address (overrides the config)
        #[arg(long)]
        api_addr: Option<String>,

        /// Storage daemon API address (overrides the config)
        #[arg(long)]
        daemon_addr: Option<String>,

        /// Peers to join through at startup, as id@host:port
        #[arg(long, value_delimiter = ',')]
        bootstrap: Vec<String>,
    },

    /// Show the identity of a peer
    Id {
        #[arg(long, default_value = DEFAULT_API_HOST)]
        host: String,
    },

    /// List cluster peers
    Peers {
        #[arg(long, default_value = DEFAULT_API_HOST)]
        host: String,
    },

    /// Pin management
    Pin {
        #[command(subcommand)]
        command: PinCommands,
    },

    /// Global status of one CID, or of every tracked CID
    Status {
        cid: Option<String>,

        #[arg(long, default_value = DEFAULT_API_HOST)]
        host: String,
    },

    /// Reconcile trackers against their daemons
    Sync {
        cid: Option<String>,

        #[arg(long, default_value = DEFAULT_API_HOST)]
        host: String,
    },

    /// Retry a CID stuck in an error state
    Recover {
        cid: String,

        #[arg(long, default_value = DEFAULT_API_HOST)]
        host: String,
    },

    /// Show version information
    Version,
}

/// Pin subcommands.
#[derive(Subcommand)]
pub enum PinCommands {
    /// Pin a CID across the cluster
    Add {
        cid: String,

        /// How many peers should hold it; omit for the cluster default
        #[arg(short, long)]
        replication_factor: Option<i32>,

        /// Optional label
        #[arg(short, long)]
        name: Option<String>,

        #[arg(long, default_value = DEFAULT_API_HOST)]
        host: String,
    },

    /// Unpin a CID across the cluster
    Rm {
        cid: String,

        #[arg(long, default_value = DEFAULT_API_HOST)]
        host: String,
    },

    /// Show the agreed pin set
    Ls {
        #[arg(long, default_value = DEFAULT_API_HOST)]
        host: String,
    },
}

/// REST client used by everything except `daemon`.
struct ApiClient {
    base: String,
    client: reqwest::Client,
}

impl ApiClient {
    fn new(host: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| PinhiveError::Transport(e.to_string()))?;
        Ok(Self {
            base: format!("http://{host}"),
            client,
        })
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let response = self.client.get(format!("{}{path}", self.base)).send().await?;
        Self::decode(response).await
    }

    async fn post(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .delete(format!("{}{path}", self.base))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() && status.as_u16() != 202 && status.as_u16() != 204 {
            let body = response.text().await.unwrap_or_default();
            return Err(PinhiveError::Transport(format!("{status}: {body}")));
        }
        if status.as_u16() == 202 || status.as_u16() == 204 {
            return Ok(Value::Null);
        }
        Ok(response.json().await?)
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{value}"),
    }
}

/// Run a client command against a peer's REST API.
pub async fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Daemon { .. } => unreachable!("daemon is handled by the binary"),
        Commands::Version => {
            println!("pinhive {}", crate::VERSION);
            Ok(())
        }
        Commands::Id { host } => {
            print_json(&ApiClient::new(&host)?.get("/id").await?);
            Ok(())
        }
        Commands::Peers { host } => {
            print_json(&ApiClient::new(&host)?.get("/peers").await?);
            Ok(())
        }
        Commands::Status { cid, host } => {
            let client = ApiClient::new(&host)?;
            let value = match cid {
                Some(cid) => client.get(&format!("/pins/{cid}")).await?,
                None => client.get("/pins").await?,
            };
            print_json(&value);
            Ok(())
        }
        Commands::Sync { cid, host } => {
            let client = ApiClient::new(&host)?;
            let value = match cid {
                Some(cid) => client.post(&format!("/pins/{cid}/sync")).await?,
                None => client.post("/pins/sync").await?,
            };
            print_json(&value);
            Ok(())
        }
        Commands::Recover { cid, host } => {
            print_json(
                &ApiClient::new(&host)?
                    .post(&format!("/pins/{cid}/recover"))
                    .await?,
            );
            Ok(())
        }
        Commands::Pin { command } => match command {
            PinCommands::Add {
                cid,
                replication_factor,
                name,
                host,
            } => {
                let mut path = format!("/pins/{cid}");
                let mut params = Vec::new();
                if let Some(factor) = replication_factor {
                    params.push(format!("replication_factor={factor}"));
                }
                if let Some(name) = name {
                    params.push(format!("name={name}"));
                }
                if !params.is_empty() {
                    path = format!("{path}?{}", params.join("&"));
                }
                ApiClient::new(&host)?.post(&path).await?;
                println!("pinned {cid}");
                Ok(())
            }
            PinCommands::Rm { cid, host } => {
                ApiClient::new(&host)?
                    .delete(&format!("/pins/{cid}"))
                    .await?;
                println!("unpinned {cid}");
                Ok(())
            }
            PinCommands::Ls { host } => {
                print_json(&ApiClient::new(&host)?.get("/pinlist").await?);
                Ok(())
            }
        },
    }
}
