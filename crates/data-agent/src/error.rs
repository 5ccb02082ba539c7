//! Error types for the data agent.

use std::io;
use std::path::PathBuf;

/// Errors produced while setting up or running the agent server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("given path \"{}\" is not accessible: {source}", path.display())]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("given path \"{}\" is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("unknown mode {0:?} (expected \"read\" or \"write\")")]
    UnknownMode(String),
}
