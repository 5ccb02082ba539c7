//! Tree archiver: directory tree to tar stream.

use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ArchiveError;
use crate::io::{CancelReader, ReportingReader};
use crate::progress::{DoneGuard, EstimateGuard, Progress, panic_message, spawn_worker};
use crate::walk::find_files;

/// Options for [`go_tar`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TarOptions {
    /// Archive what symlinks resolve to instead of the links themselves.
    pub follow_symlinks: bool,
}

impl TarOptions {
    pub fn follow_symlinks() -> Self {
        Self {
            follow_symlinks: true,
        }
    }
}

/// Archives the tree under `root` into `dest` as a tar stream.
///
/// Returns immediately. Two background threads run concurrently: one walks
/// the tree to estimate the total size of regular files, the other walks it
/// again and writes a tar entry per regular file or symlink, with names
/// relative to `root`. Directories are not written as entries of their own.
///
/// If `root` cannot be made absolute or does not exist, the returned
/// monitor has already failed and nothing runs in the background.
///
/// On success the monitor hands `dest` back through
/// [`Progress::take_stream`] with the tar trailer written and flushed; any
/// further framing (a gzip footer, say) is up to the caller.
pub fn go_tar<W>(
    cancel: CancellationToken,
    root: impl AsRef<Path>,
    dest: W,
    options: TarOptions,
) -> Progress<W>
where
    W: Write + Send + 'static,
{
    let root = match std::path::absolute(root.as_ref()) {
        Ok(root) => root,
        Err(source) => {
            return Progress::failed(ArchiveError::Root {
                path: root.as_ref().to_path_buf(),
                source,
            });
        }
    };
    if let Err(source) = fs::metadata(&root) {
        return Progress::failed(ArchiveError::Root { path: root, source });
    }

    let progress = Progress::new();

    {
        let estimator = progress.clone();
        let cancel = cancel.clone();
        let root = root.clone();
        let spawned = spawn_worker("knitfab-tar-estimate", move || {
            let _estimated = EstimateGuard(estimator.clone());
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                estimate(&cancel, &root, options.follow_symlinks, &estimator)
            }));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => estimator.fail(err),
                Err(payload) => estimator.fail(ArchiveError::Panicked(panic_message(payload))),
            }
        });
        if let Err(err) = spawned {
            warn!("failed to start size estimation: {err}");
            progress.finish_estimate();
        }
    }

    {
        let worker = progress.clone();
        let spawned = spawn_worker("knitfab-tar", move || {
            let _done = DoneGuard(worker.clone());
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                archive(&cancel, &root, dest, options, &worker)
            }));
            match result {
                Ok(Ok(dest)) => {
                    debug!(
                        root = %root.display(),
                        bytes = worker.progressed_size(),
                        "archive complete"
                    );
                    worker.finish(Some(dest));
                }
                Ok(Err(err)) => worker.fail(err),
                Err(payload) => worker.fail(ArchiveError::Panicked(panic_message(payload))),
            }
        });
        if let Err(err) = spawned {
            progress.fail(err.into());
            progress.finish(None);
        }
    }

    progress
}

/// Stops the walk when cancelled or when the other walker already failed.
fn checkpoint<T>(cancel: &CancellationToken, progress: &Progress<T>) -> Result<(), ArchiveError> {
    if cancel.is_cancelled() {
        return Err(ArchiveError::Cancelled);
    }
    if progress.has_error() {
        // The recorded error stays the terminal one; this only unwinds the walk.
        return Err(ArchiveError::Cancelled);
    }
    Ok(())
}

fn estimate<T>(
    cancel: &CancellationToken,
    root: &Path,
    follow_symlinks: bool,
    progress: &Progress<T>,
) -> Result<(), ArchiveError> {
    find_files(root, follow_symlinks, |_, meta| {
        checkpoint(cancel, progress)?;
        if meta.is_file() {
            progress.add_estimated(meta.len() as i64);
        }
        Ok(())
    })
}

fn archive<W: Write>(
    cancel: &CancellationToken,
    root: &Path,
    dest: W,
    options: TarOptions,
    progress: &Progress<W>,
) -> Result<W, ArchiveError> {
    let mut builder = tar::Builder::new(dest);

    find_files(root, options.follow_symlinks, |path, meta| {
        checkpoint(cancel, progress)?;

        let name = entry_name(root, path);
        progress.set_file(name.to_string_lossy());
        append_entry(cancel, &mut builder, path, &name, meta, progress)
    })?;

    let mut dest = builder.into_inner()?;
    dest.flush()?;
    Ok(dest)
}

/// Name of `path` inside the archive: relative to `root`, or the file name
/// itself when `root` is a single file.
fn entry_name(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| path.to_path_buf()),
    }
}

fn append_entry<W: Write>(
    cancel: &CancellationToken,
    builder: &mut tar::Builder<W>,
    path: &Path,
    name: &Path,
    meta: &Metadata,
    progress: &Progress<W>,
) -> Result<(), ArchiveError> {
    let file_type = meta.file_type();
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(meta, tar::HeaderMode::Complete);

    if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, name, &target)?;
        return Ok(());
    }

    if !file_type.is_file() {
        debug!(path = %path.display(), "skipping special file");
        return Ok(());
    }

    let size = meta.len();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);

    let file = File::open(path)?;
    let mut reader = ReportingReader::new(CancelReader::new(cancel.clone(), file), progress);
    builder.append_data(&mut header, name, io::Read::take(&mut reader, size))?;

    if reader.count() != size {
        return Err(ArchiveError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} shrank while being archived", path.display()),
        )));
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;
    use std::os::unix::fs::{PermissionsExt, symlink};
    use std::sync::{Arc, Mutex};

    /// Shareable in-memory sink.
    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, PartialEq)]
    enum Item {
        File { mode: u32, content: Vec<u8> },
        Link(PathBuf),
    }

    fn entries(tarball: &[u8]) -> BTreeMap<PathBuf, Item> {
        let mut archive = tar::Archive::new(tarball);
        let mut out = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().into_owned();
            let item = match entry.header().entry_type() {
                tar::EntryType::Symlink => Item::Link(entry.link_name().unwrap().unwrap().into_owned()),
                _ => {
                    let mode = entry.header().mode().unwrap() & 0o7777;
                    let mut content = Vec::new();
                    entry.read_to_end(&mut content).unwrap();
                    Item::File { mode, content }
                }
            };
            out.insert(path, item);
        }
        out
    }

    async fn tar_of(root: &Path, options: TarOptions) -> (Progress<Vec<u8>>, Vec<u8>) {
        let progress = go_tar(CancellationToken::new(), root, Vec::new(), options);
        progress.done().await;
        let bytes = progress.take_stream().unwrap_or_default();
        (progress, bytes)
    }

    #[tokio::test]
    async fn missing_root_fails_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let progress = go_tar(
            CancellationToken::new(),
            tmp.path().join("non-existing-path"),
            Vec::new(),
            TarOptions::default(),
        );
        assert!(progress.is_done());
        assert!(matches!(progress.error().as_deref(), Some(ArchiveError::Root { .. })));
        progress.estimate_done().await;
    }

    #[tokio::test]
    async fn archives_files_with_relative_names_and_modes() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("bar")).unwrap();
        fs::write(tmp.path().join("foo"), b"file1").unwrap();
        fs::write(tmp.path().join("bar/baz"), b"file2\n\ncontent").unwrap();
        fs::set_permissions(tmp.path().join("foo"), fs::Permissions::from_mode(0o750)).unwrap();

        let (progress, bytes) = tar_of(tmp.path(), TarOptions::default()).await;
        assert!(progress.error().is_none(), "{:?}", progress.error());

        let got = entries(&bytes);
        assert_eq!(
            got.get(Path::new("foo")),
            Some(&Item::File { mode: 0o750, content: b"file1".to_vec() })
        );
        assert!(matches!(got.get(Path::new("bar/baz")), Some(Item::File { content, .. }) if content == b"file2\n\ncontent"));
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn sizes_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a"), vec![1u8; 1000]).unwrap();
        fs::write(tmp.path().join("b"), vec![2u8; 24]).unwrap();

        let (progress, _) = tar_of(tmp.path(), TarOptions::default()).await;
        progress.estimate_done().await;
        assert_eq!(progress.estimated_total_size(), 1024);
        assert_eq!(progress.progressed_size(), 1024);
        assert_eq!(progress.progressing_file(), "b");
    }

    #[tokio::test]
    async fn symlinks_are_stored_as_links_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("dir")).unwrap();
        fs::write(tmp.path().join("dir/file"), b"x").unwrap();
        symlink("dir", tmp.path().join("to-dir")).unwrap();
        symlink("dir/file", tmp.path().join("to-file")).unwrap();

        let (progress, bytes) = tar_of(tmp.path(), TarOptions::default()).await;
        assert!(progress.error().is_none());

        let got = entries(&bytes);
        assert_eq!(got.get(Path::new("to-dir")), Some(&Item::Link("dir".into())));
        assert_eq!(got.get(Path::new("to-file")), Some(&Item::Link("dir/file".into())));
    }

    #[tokio::test]
    async fn follow_symlinks_matches_a_physical_copy() {
        let linked = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        fs::create_dir(target.path().join("sub")).unwrap();
        fs::write(target.path().join("sub/data"), b"payload").unwrap();
        fs::write(target.path().join("single"), b"one").unwrap();
        symlink(target.path().join("sub"), linked.path().join("dir")).unwrap();
        symlink(target.path().join("single"), linked.path().join("file")).unwrap();

        let resolved = tempfile::tempdir().unwrap();
        fs::create_dir(resolved.path().join("dir")).unwrap();
        fs::write(resolved.path().join("dir/data"), b"payload").unwrap();
        fs::write(resolved.path().join("file"), b"one").unwrap();
        for p in ["dir/data", "file"] {
            let mode = fs::metadata(target.path().join(if p == "file" { "single" } else { "sub/data" }))
                .unwrap()
                .permissions()
                .mode();
            fs::set_permissions(resolved.path().join(p), fs::Permissions::from_mode(mode)).unwrap();
        }

        let (p1, followed) = tar_of(linked.path(), TarOptions::follow_symlinks()).await;
        let (p2, physical) = tar_of(resolved.path(), TarOptions::default()).await;
        assert!(p1.error().is_none(), "{:?}", p1.error());
        assert!(p2.error().is_none());
        assert_eq!(entries(&followed), entries(&physical));
    }

    #[tokio::test]
    async fn follow_symlinks_detects_cycles() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        fs::write(tmp.path().join("a/b/file"), b"x").unwrap();
        symlink("..", tmp.path().join("a/b/parent")).unwrap();

        let (progress, bytes) = tar_of(tmp.path(), TarOptions::follow_symlinks()).await;
        assert!(progress.is_done());
        assert!(matches!(progress.error().as_deref(), Some(ArchiveError::LoopSymlink(_))));
        assert!(bytes.is_empty());

        let (progress, bytes) = tar_of(tmp.path(), TarOptions::default()).await;
        assert!(progress.error().is_none());
        assert_eq!(
            entries(&bytes).get(Path::new("a/b/parent")),
            Some(&Item::Link("..".into()))
        );
    }

    #[tokio::test]
    async fn flip_flop_links_only_fail_when_followed() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("x")).unwrap();
        fs::create_dir(tmp.path().join("y")).unwrap();
        symlink("../y", tmp.path().join("x/to-y")).unwrap();
        symlink("../x", tmp.path().join("y/to-x")).unwrap();

        let (progress, _) = tar_of(tmp.path(), TarOptions::default()).await;
        assert!(progress.error().is_none());

        let (progress, _) = tar_of(tmp.path(), TarOptions::follow_symlinks()).await;
        assert!(matches!(progress.error().as_deref(), Some(ArchiveError::LoopSymlink(_))));
    }

    #[tokio::test]
    async fn cancelled_before_start_reports_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a"), vec![0u8; 4096]).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let sink = Sink::default();
        let progress = go_tar(cancel, tmp.path(), sink.clone(), TarOptions::default());
        progress.done().await;

        assert!(progress.error().is_some_and(|e| e.is_cancelled()));
        assert!(progress.take_stream().is_none());
    }

    #[tokio::test]
    async fn writer_failure_becomes_terminal_error() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a"), b"data").unwrap();

        let progress = go_tar(CancellationToken::new(), tmp.path(), Broken, TarOptions::default());
        progress.done().await;
        assert!(matches!(progress.error().as_deref(), Some(ArchiveError::Io(_))));
    }

    #[tokio::test]
    async fn panicking_writer_is_recovered() {
        // Panics on the first write only: the tar builder writes its
        // trailer again while being dropped during the unwind.
        struct Panicky(bool);
        impl Write for Panicky {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if !self.0 {
                    self.0 = true;
                    panic!("writer exploded");
                }
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a"), b"data").unwrap();

        let progress = go_tar(CancellationToken::new(), tmp.path(), Panicky(false), TarOptions::default());
        progress.done().await;
        match progress.error().as_deref() {
            Some(ArchiveError::Panicked(msg)) => assert!(msg.contains("writer exploded")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
