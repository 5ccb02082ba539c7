//! Tree extractor: tar stream to directory tree.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Component, Path};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ArchiveError;
use crate::io::{CancelReader, ReportingWriter};
use crate::progress::{DoneGuard, EstimateGuard, Progress, panic_message, spawn_worker};

/// Mode for directories created on the way to an entry.
const PARENT_DIR_MODE: u32 = 0o755;

/// Restores the tar stream `src` under `dest`.
///
/// Returns immediately; entries are processed in stream order on a
/// background thread. Regular files are created (or truncated) with the
/// entry's permission bits, symlinks are recreated with their target
/// verbatim, directory entries become directories, and every other kind
/// is skipped. Missing parent directories are created along the way.
///
/// There is no estimation phase: `estimate_done` resolves together with
/// `done`. On success the monitor hands `src` back through
/// [`Progress::take_stream`], positioned after the tar trailer.
pub fn go_untar<R>(cancel: CancellationToken, src: R, dest: impl AsRef<Path>) -> Progress<R>
where
    R: Read + Send + 'static,
{
    let dest = dest.as_ref().to_path_buf();
    let progress = Progress::new();

    let worker = progress.clone();
    let spawned = spawn_worker("knitfab-untar", move || {
        let _done = DoneGuard(worker.clone());
        let _estimated = EstimateGuard(worker.clone());
        let result = panic::catch_unwind(AssertUnwindSafe(|| extract(&cancel, src, &dest, &worker)));
        match result {
            Ok(Ok(src)) => {
                debug!(
                    dest = %dest.display(),
                    bytes = worker.progressed_size(),
                    "extraction complete"
                );
                worker.finish(Some(src));
            }
            Ok(Err(err)) => worker.fail(err),
            Err(payload) => worker.fail(ArchiveError::Panicked(panic_message(payload))),
        }
    });
    if let Err(err) = spawned {
        progress.fail(err.into());
        progress.finish_estimate();
        progress.finish(None);
    }

    progress
}

fn extract<R: Read>(
    cancel: &CancellationToken,
    src: R,
    dest: &Path,
    progress: &Progress<R>,
) -> Result<R, ArchiveError> {
    let mut archive = tar::Archive::new(src);

    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = entry?;

        let name = entry.path()?.into_owned();
        if name.as_os_str().is_empty() {
            continue;
        }
        check_entry_name(&name)?;
        check_no_symlink_on_path(dest, &name)?;

        let fullpath = dest.join(&name);
        progress.set_file(name.to_string_lossy());

        if let Some(parent) = fullpath.parent() {
            create_dirs(parent)?;
        }

        match entry.header().entry_type() {
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()?
                    .ok_or_else(|| ArchiveError::UnsafePath(format!("{}: symlink without target", name.display())))?;
                symlink(&target, &fullpath)?;
            }
            tar::EntryType::Directory => {
                create_dirs(&fullpath)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mode = entry.header().mode()?;
                let size = entry.size();
                let mut file = create_file(&fullpath, mode)?;
                let mut reader = CancelReader::new(cancel.clone(), &mut entry);
                let copied = io::copy(&mut reader, &mut ReportingWriter::new(&mut file, progress))?;
                if copied != size {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{}: expected {size} bytes, got {copied}", name.display()),
                    )
                    .into());
                }
            }
            other => {
                debug!(entry = %name.display(), kind = ?other, "skipping unsupported entry");
            }
        }
    }

    Ok(archive.into_inner())
}

/// Rejects entry names that would land outside the destination.
fn check_entry_name(name: &Path) -> Result<(), ArchiveError> {
    for component in name.components() {
        match component {
            Component::ParentDir => {
                return Err(ArchiveError::UnsafePath(format!(
                    "parent directory traversal not allowed: {}",
                    name.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::UnsafePath(format!(
                    "absolute path not allowed: {}",
                    name.display()
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

/// Rejects entries whose path under `dest` passes through a symlink that
/// is already on disk, including one restored earlier from this stream.
fn check_no_symlink_on_path(dest: &Path, name: &Path) -> Result<(), ArchiveError> {
    let mut current = dest.to_path_buf();
    for component in name.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(ArchiveError::UnsafePath(format!(
                    "{} passes through symlink {}",
                    name.display(),
                    current.display()
                )));
            }
            Ok(_) => {}
            // Nothing below a missing component exists yet.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn create_dirs(path: &Path) -> io::Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(PARENT_DIR_MODE);
    }
    builder.create(path)
}

fn create_file(path: &Path, mode: u32) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(mode & 0o7777);
        let file = options.open(path)?;
        // The open mode is filtered by the umask; restore the archived bits.
        file.set_permissions(fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(file)
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        options.open(path)
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
