//! Data agent: a single-shot HTTP endpoint over one directory tree.
//!
//! In read mode the agent answers one `GET` with the tree as a tar+gzip
//! stream followed by an `x-checksum-md5` trailer. In write mode it
//! accepts one `POST` of such a stream and extracts it into an empty
//! directory, verifying the trailer if the client sent one. Either way
//! the server stops after that request, or after its deadline passes
//! without one.

mod api_error;
mod body;
mod error;
mod handlers;
mod mode;
mod server;

use std::time::Duration;

pub use api_error::ApiError;
pub use error::ServerError;
pub use handlers::{reader, writer};
pub use mode::{Endpoint, Mode};
pub use server::{Bind, Server, ServerConfig, StopReason, start};

/// Trailer carrying the hex MD5 of the uncompressed tar stream.
pub const CHECKSUM_TRAILER: &str = "x-checksum-md5";

/// Media type of the transferred archive.
pub const CONTENT_TYPE_TAR_GZIP: &str = "application/tar+gzip";

/// How long the server waits for its one request.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(180);

/// How long open connections may drain during shutdown.
pub const DEFAULT_GRACEFUL_PERIOD: Duration = Duration::from_secs(30);
