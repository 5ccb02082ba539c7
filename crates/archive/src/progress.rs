//! Progress monitor shared between a background worker and its observers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::ArchiveError;

/// Live accounting of one archive or extract operation.
///
/// The background operation is the only writer; any number of clones may
/// read it. [`done`](Self::done) resolves exactly once, on success, on
/// failure and on cancellation alike. Once it has resolved,
/// [`error`](Self::error) no longer changes.
///
/// `T` is the stream the operation was given (the destination writer of
/// [`go_tar`](crate::go_tar), the source reader of
/// [`go_untar`](crate::go_untar)). After a successful run it is handed
/// back through [`take_stream`](Self::take_stream) so the caller can
/// finish compression or read a checksum.
pub struct Progress<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    estimated_total: AtomicI64,
    progressed: AtomicI64,
    file: Mutex<String>,
    outcome: Mutex<Outcome<T>>,
    estimate_done: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

struct Outcome<T> {
    error: Option<Arc<ArchiveError>>,
    stream: Option<T>,
    done: bool,
}

impl<T> Clone for Progress<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Progress<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                estimated_total: AtomicI64::new(0),
                progressed: AtomicI64::new(0),
                file: Mutex::new(String::new()),
                outcome: Mutex::new(Outcome {
                    error: None,
                    stream: None,
                    done: false,
                }),
                estimate_done: watch::Sender::new(false),
                done: watch::Sender::new(false),
            }),
        }
    }

    /// A monitor that failed before any background work started.
    pub(crate) fn failed(err: ArchiveError) -> Self {
        let progress = Self::new();
        progress.fail(err);
        progress.finish_estimate();
        progress.finish(None);
        progress
    }

    /// Total size of regular files to be moved (uncompressed).
    ///
    /// Grows while the estimation runs; final once
    /// [`estimate_done`](Self::estimate_done) has resolved.
    pub fn estimated_total_size(&self) -> i64 {
        self.inner.estimated_total.load(Ordering::Relaxed)
    }

    /// Bytes of file content moved so far (uncompressed).
    pub fn progressed_size(&self) -> i64 {
        self.inner.progressed.load(Ordering::Relaxed)
    }

    /// Relative name of the entry currently being moved.
    pub fn progressing_file(&self) -> String {
        lock(&self.inner.file).clone()
    }

    /// The terminal error, if the operation failed.
    pub fn error(&self) -> Option<Arc<ArchiveError>> {
        lock(&self.inner.outcome).error.clone()
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Resolves when the estimated total size is known.
    pub async fn estimate_done(&self) {
        let mut rx = self.inner.estimate_done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Resolves when the whole operation has finished.
    pub async fn done(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Takes back the stream the operation was started with.
    ///
    /// Returns `None` before completion, after a failure, or when it has
    /// already been taken.
    pub fn take_stream(&self) -> Option<T> {
        lock(&self.inner.outcome).stream.take()
    }

    pub(crate) fn add_estimated(&self, n: i64) {
        self.inner.estimated_total.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_progressed(&self, n: i64) {
        self.inner.progressed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn set_file(&self, name: impl Into<String>) {
        *lock(&self.inner.file) = name.into();
    }

    pub(crate) fn has_error(&self) -> bool {
        lock(&self.inner.outcome).error.is_some()
    }

    /// Records `err` unless an earlier error won or the operation is over.
    pub(crate) fn fail(&self, err: ArchiveError) {
        let mut outcome = lock(&self.inner.outcome);
        if outcome.done || outcome.error.is_some() {
            return;
        }
        outcome.error = Some(Arc::new(err));
    }

    pub(crate) fn finish_estimate(&self) {
        self.inner.estimate_done.send_replace(true);
    }

    /// Closes `done`; later calls are no-ops.
    pub(crate) fn finish(&self, stream: Option<T>) {
        {
            let mut outcome = lock(&self.inner.outcome);
            if outcome.done {
                return;
            }
            outcome.done = true;
            if outcome.error.is_none() {
                outcome.stream = stream;
            }
        }
        self.inner.done.send_replace(true);
    }
}

/// Closes `done` when dropped, so a task that unwinds still completes.
pub(crate) struct DoneGuard<T>(pub(crate) Progress<T>);

impl<T> Drop for DoneGuard<T> {
    fn drop(&mut self) {
        self.0.finish(None);
    }
}

/// Closes `estimate_done` when dropped.
pub(crate) struct EstimateGuard<T>(pub(crate) Progress<T>);

impl<T> Drop for EstimateGuard<T> {
    fn drop(&mut self) {
        self.0.finish_estimate();
    }
}

/// Runs `work` on a named background thread.
pub(crate) fn spawn_worker<F>(name: &str, work: F) -> std::io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(work)
        .map(drop)
}

/// Renders a caught panic payload as a message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
