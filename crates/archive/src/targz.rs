//! Streaming inspection of `.tar.gz` data.

use std::io::{self, Read};
use std::ops::ControlFlow;

use flate2::read::GzDecoder;

/// Error from [`tar_gz_walk`].
#[derive(Debug, thiserror::Error)]
pub enum WalkError<E> {
    /// The stream is not valid gzip or tar.
    #[error("malformed tar.gz stream: {0}")]
    Io(#[from] io::Error),

    /// The walker returned an error, which is passed through as is.
    #[error("walker failed: {0}")]
    Walker(E),
}

/// Decompresses `from` and calls `walker` on each tar entry in order.
///
/// The walker receives either the next entry, whose content it may read,
/// or the error hit while reading the entry's header. Returning
/// `Ok(ControlFlow::Break(()))` stops the walk early as a success; an
/// `Err` stops it and is returned as [`WalkError::Walker`].
///
/// A stream that is not gzip, or not tar inside, reaches the walker as an
/// `Err` for the entry that could not be read; the walker decides whether
/// to stop.
pub fn tar_gz_walk<R, E, F>(from: R, mut walker: F) -> Result<(), WalkError<E>>
where
    R: Read,
    F: FnMut(io::Result<&mut tar::Entry<'_, GzDecoder<R>>>) -> Result<ControlFlow<()>, E>,
{
    let mut archive = tar::Archive::new(GzDecoder::new(from));

    for entry in archive.entries()? {
        let flow = match entry {
            Ok(mut entry) => walker(Ok(&mut entry)),
            Err(err) => walker(Err(err)),
        };
        match flow {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => return Ok(()),
            Err(err) => return Err(WalkError::Walker(err)),
        }
    }
    Ok(())
}
