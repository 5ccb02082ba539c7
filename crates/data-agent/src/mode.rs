//! Agent mode and the endpoint it exposes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use axum::Router;
use axum::http::Method;
use axum::routing::MethodRouter;

use crate::error::ServerError;
use crate::handlers::{reader, writer};

/// What the agent does with its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Serve the directory to one `GET`.
    Read,
    /// Fill the directory from one `POST`.
    Write,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Read => "read",
            Mode::Write => "write",
        }
    }

    /// Builds the endpoint serving `root` at `url_path`.
    ///
    /// `root` must already exist and be a directory; it is not followed
    /// if it is a symlink.
    pub fn expose(self, url_path: &str, root: impl AsRef<Path>) -> Result<Endpoint, ServerError> {
        let root = root.as_ref();
        let meta = std::fs::symlink_metadata(root).map_err(|source| ServerError::InvalidPath {
            path: root.to_path_buf(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ServerError::NotADirectory(root.to_path_buf()));
        }

        let root = PathBuf::from(root);
        Ok(match self {
            Mode::Read => Endpoint::new(Method::GET, url_path, reader(root)),
            Mode::Write => Endpoint::new(Method::POST, url_path, writer(root)),
        })
    }
}

impl FromStr for Mode {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Mode::Read),
            "write" => Ok(Mode::Write),
            other => Err(ServerError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single route a server exposes.
pub struct Endpoint {
    pub method: Method,
    pub path: String,
    handler: MethodRouter,
}

impl Endpoint {
    /// `handler` should answer `method`; other methods on `path` get 405.
    pub fn new(method: Method, path: impl Into<String>, handler: MethodRouter) -> Self {
        Self {
            method,
            path: path.into(),
            handler,
        }
    }

    pub(crate) fn into_router(self) -> Router {
        Router::new().route(&self.path, self.handler)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
