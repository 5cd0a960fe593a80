//! pinhive binary: daemon plus REST client commands.

use clap::Parser;
use pinhive::cli::{Cli, Commands};
use pinhive::config::ClusterConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pinhive={}", cli.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Daemon {
            config,
            id,
            data_dir,
            cluster_addr,
            api_addr,
            daemon_addr,
            bootstrap,
        } => {
            let mut config = match config {
                Some(path) => ClusterConfig::load(&path)?,
                None => ClusterConfig::standalone(id.unwrap_or(1), &data_dir),
            };

            if let Some(id) = id {
                config.id = id;
            }
            if let Some(addr) = cluster_addr {
                config.cluster_listen_address = addr;
            }
            if let Some(addr) = api_addr {
                config.api_listen_address = addr;
            }
            if let Some(addr) = daemon_addr {
                config.daemon_node_address = addr;
            }
            for target in bootstrap {
                config.bootstrap.push(target.parse()?);
            }
            config.validate()?;

            pinhive::run(config).await?;
        }
        command => pinhive::cli::run_command(command).await?,
    }

    Ok(())
}
