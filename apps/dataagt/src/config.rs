//! Command-line configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use knitfab_data_agent::{Mode, ServerConfig};

/// Serves one directory tree to a single reader, or receives one from a
/// single writer, then exits.
#[derive(Debug, Parser)]
#[command(name = "dataagt", version, about, long_about = None)]
pub struct AgentConfig {
    /// read | write
    #[arg(long, env = "DATAAGT_MODE")]
    pub mode: Mode,

    /// Directory to be served or written.
    #[arg(long, env = "DATAAGT_PATH", default_value = "./contents")]
    pub path: PathBuf,

    /// Port to serve on.
    #[arg(long, env = "DATAAGT_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Seconds to wait for the first request.
    #[arg(long, env = "DATAAGT_DEADLINE", default_value_t = 180)]
    pub deadline: u64,

    /// Seconds open connections may drain during shutdown.
    #[arg(long, env = "DATAAGT_GRACEFUL_PERIOD", default_value_t = 30)]
    pub graceful_period: u64,
}

impl AgentConfig {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::default()
            .with_deadline(Duration::from_secs(self.deadline))
            .with_graceful_period(Duration::from_secs(self.graceful_period))
    }
}
