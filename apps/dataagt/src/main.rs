//! Data agent entry point.

mod config;

use anyhow::Context;
use clap::Parser;
use knitfab_data_agent::{Bind, start};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AgentConfig::parse();
    let endpoint = config
        .mode
        .expose("/", &config.path)
        .with_context(|| format!("cannot {} {}", config.mode, config.path.display()))?;

    let cancel = CancellationToken::new();
    let server_config = config.server_config();
    let server = start(cancel.clone(), Bind::Port(config.port), endpoint, server_config.clone()).await?;
    info!(
        port = server.port,
        path = %config.path.display(),
        mode = %config.mode,
        deadline = ?server_config.deadline,
        "starting dataagt server on port {}, serving {} in {} mode",
        server.port,
        config.path.display(),
        config.mode,
    );

    let mut stopped = server.stopped;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("server stops by interrupt signal");
            cancel.cancel();
            // Teardown drains within the graceful period; wait for it.
            let _ = stopped.await;
        }
        outcome = &mut stopped => match outcome {
            Ok(Ok(reason)) => info!(?reason, "server stops"),
            Ok(Err(err)) => {
                error!(error = %err, "server stops by error");
                return Err(err.into());
            }
            Err(_) => anyhow::bail!("server task ended without reporting"),
        },
    }

    info!("bye");
    Ok(())
}
