//! Error types for archiving and extraction.

use std::io;
use std::path::PathBuf;

use crate::io::Cancelled;

/// Errors produced while archiving or extracting a directory tree.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("root {} is not accessible: {source}", path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("symlink loop detected: {}", .0.display())]
    LoopSymlink(PathBuf),

    #[error("unsafe entry path: {0}")]
    UnsafePath(String),

    #[error("cancelled")]
    Cancelled,

    #[error("panicked: {0}")]
    Panicked(String),
}

impl ArchiveError {
    /// Returns `true` when the operation stopped because its token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ArchiveError::Cancelled)
    }
}

// I/O errors raised by a `CancelReader` carry the `Cancelled` marker and
// surface as the cancellation itself rather than as a generic I/O failure.
impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Cancelled>()) {
            ArchiveError::Cancelled
        } else {
            ArchiveError::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_io_error_maps_to_cancelled() {
        let err: ArchiveError = io::Error::other(Cancelled).into();
        assert!(err.is_cancelled());
    }

    #[test]
    fn plain_io_error_stays_io() {
        let err: ArchiveError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, ArchiveError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied));
    }
}
