//! Depth-first tree walk with optional symlink resolution.

use std::collections::HashSet;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

use crate::ArchiveError;

/// Visits every non-directory item under `from`, depth first.
///
/// Entries of a directory are visited in file-name order. Directories are
/// descended into but never passed to `visit`.
///
/// Without `follow_links`, a symlink is visited as itself (with its lstat
/// metadata) and never dereferenced, so link cycles are harmless. With
/// `follow_links`, a symlink is replaced by what it resolves to: a linked
/// file is visited under the link's path, a linked directory is walked
/// under it. The real paths of the directories on the current branch are
/// kept in a set; resolving into one of them is a loop and fails with
/// [`ArchiveError::LoopSymlink`]. The same directory may still be reached
/// again through a different, non-nested branch.
pub(crate) fn find_files<F>(from: &Path, follow_links: bool, mut visit: F) -> Result<(), ArchiveError>
where
    F: FnMut(&Path, &Metadata) -> Result<(), ArchiveError>,
{
    let meta = if follow_links {
        fs::metadata(from)?
    } else {
        fs::symlink_metadata(from)?
    };

    if !meta.is_dir() {
        return visit(from, &meta);
    }

    let mut branch = HashSet::new();
    walk_dir(from, follow_links, &mut branch, &mut visit)
}

fn walk_dir<F>(
    dir: &Path,
    follow_links: bool,
    branch: &mut HashSet<PathBuf>,
    visit: &mut F,
) -> Result<(), ArchiveError>
where
    F: FnMut(&Path, &Metadata) -> Result<(), ArchiveError>,
{
    let entered = if follow_links {
        let real = fs::canonicalize(dir)?;
        if !branch.insert(real.clone()) {
            return Err(ArchiveError::LoopSymlink(dir.to_path_buf()));
        }
        Some(real)
    } else {
        None
    };

    let result = walk_entries(dir, follow_links, branch, visit);

    if let Some(real) = entered {
        branch.remove(&real);
    }
    result
}

fn walk_entries<F>(
    dir: &Path,
    follow_links: bool,
    branch: &mut HashSet<PathBuf>,
    visit: &mut F,
) -> Result<(), ArchiveError>
where
    F: FnMut(&Path, &Metadata) -> Result<(), ArchiveError>,
{
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let mut meta = fs::symlink_metadata(&path)?;
        if follow_links && meta.file_type().is_symlink() {
            meta = fs::metadata(&path)?;
        }

        if meta.is_dir() {
            walk_dir(&path, follow_links, branch, visit)?;
        } else {
            visit(&path, &meta)?;
        }
    }
    Ok(())
}
