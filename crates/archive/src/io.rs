//! Stream adaptors shared by the archiver and the extractor.

use std::io::{self, Read, Write};

use tokio_util::sync::CancellationToken;

use crate::progress::Progress;

/// Marker carried inside an [`io::Error`] raised because a token was cancelled.
#[derive(Debug, thiserror::Error)]
#[error("cancelled")]
pub(crate) struct Cancelled;

/// Reader that refuses to read once its token is cancelled.
///
/// Every `read` checks the token first; when it is cancelled the inner
/// reader is dropped (closing a file handle, for instance) and the call
/// fails without touching the underlying stream.
pub struct CancelReader<R> {
    cancel: CancellationToken,
    inner: Option<R>,
}

impl<R> CancelReader<R> {
    pub fn new(cancel: CancellationToken, inner: R) -> Self {
        Self {
            cancel,
            inner: Some(inner),
        }
    }
}

impl<R: Read> Read for CancelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            self.inner = None;
            return Err(io::Error::other(Cancelled));
        }
        match self.inner.as_mut() {
            Some(inner) => inner.read(buf),
            None => Err(io::Error::other(Cancelled)),
        }
    }
}

/// Reader that adds every byte it yields to the monitor's progressed size.
pub(crate) struct ReportingReader<'a, R, T> {
    source: R,
    progress: &'a Progress<T>,
    count: u64,
}

impl<'a, R, T> ReportingReader<'a, R, T> {
    pub(crate) fn new(source: R, progress: &'a Progress<T>) -> Self {
        Self {
            source,
            progress,
            count: 0,
        }
    }

    /// Bytes read so far.
    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read, T> Read for ReportingReader<'_, R, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.source.read(buf)?;
        self.count += n as u64;
        self.progress.add_progressed(n as i64);
        Ok(n)
    }
}

/// Writer that adds every byte it forwards to the monitor's progressed size.
pub(crate) struct ReportingWriter<'a, W, T> {
    dest: W,
    progress: &'a Progress<T>,
}

impl<'a, W, T> ReportingWriter<'a, W, T> {
    pub(crate) fn new(dest: W, progress: &'a Progress<T>) -> Self {
        Self { dest, progress }
    }
}

impl<W: Write, T> Write for ReportingWriter<'_, W, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.dest.write(buf)?;
        self.progress.add_progressed(n as i64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.dest.flush()
    }
}
