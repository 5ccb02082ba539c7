//! Directory tree archiving for data agents.
//!
//! Serialises a directory tree into a tar stream and restores it again,
//! each on a background thread reporting through a [`Progress`] handle.
//! Bytes can be observed with the MD5 [`checksum`] wrappers to bind a
//! transfer to its payload, and [`tar_gz_walk`] inspects a `.tar.gz`
//! stream without touching the disk.
//!
//! # Example
//!
//! ```no_run
//! use knitfab_archive::{TarOptions, go_tar};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dest = std::fs::File::create("/tmp/out.tar")?;
//! let progress = go_tar(CancellationToken::new(), "/data", dest, TarOptions::default());
//! progress.done().await;
//! if let Some(err) = progress.error() {
//!     eprintln!("archiving failed: {err}");
//! }
//! # Ok(())
//! # }
//! ```

mod archiver;
pub mod checksum;
mod error;
mod extractor;
mod io;
mod progress;
mod targz;
mod walk;

pub use archiver::{TarOptions, go_tar};
pub use checksum::{Checksum, Md5Reader, Md5Writer};
pub use error::ArchiveError;
pub use extractor::go_untar;
pub use io::CancelReader;
pub use progress::Progress;
pub use targz::{WalkError, tar_gz_walk};

/// Copy buffer size used when moving file contents (256 KB).
pub const COPY_BUFFER_SIZE: usize = 256 * 1024;
