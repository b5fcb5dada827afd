//! Install directory normalization.
//!
//! Some archives put their content directly at the root, others wrap it in
//! one extra directory such as `cmake-4.0.1-windows-x86_64/`. Normalization
//! lifts the content of a single wrapping directory into the install root so
//! the binary subdirectory sits at a fixed depth.
//!
//! This is a bounded heuristic: only one level is collapsed, and a root with
//! zero or several subdirectories is left alone.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::error::{InstallError, InstallResult};

/// Normalizes the layout under `base_dir` and returns `base_dir`.
///
/// Filesystem errors are logged and leave the layout as it is.
pub fn normalize(base_dir: &Path, bin_subdir: &str, single_executable: bool) -> PathBuf {
    if let Err(e) = try_normalize(base_dir, bin_subdir, single_executable) {
        warn!("{}; keeping the extracted layout", e);
    }
    base_dir.to_path_buf()
}

/// Returns the directory that should be put on the search path.
pub fn resolve_bin_dir(base_dir: &Path, bin_subdir: &str, single_executable: bool) -> PathBuf {
    if single_executable || bin_subdir.is_empty() {
        base_dir.to_path_buf()
    } else {
        base_dir.join(bin_subdir)
    }
}

fn try_normalize(base_dir: &Path, bin_subdir: &str, single_executable: bool) -> InstallResult<()> {
    if single_executable {
        return Ok(());
    }

    let layout_err = |source| InstallError::Layout {
        dir: base_dir.to_path_buf(),
        source,
    };

    if is_non_empty_dir(&base_dir.join(bin_subdir)).map_err(layout_err)? {
        debug!("{} already has {}/", base_dir.display(), bin_subdir);
        return Ok(());
    }

    let subdirs = list_subdirs(base_dir).map_err(layout_err)?;
    let nested = match subdirs.as_slice() {
        [only] => only,
        _ => {
            debug!(
                "{} has {} subdirectories, leaving layout unchanged",
                base_dir.display(),
                subdirs.len()
            );
            return Ok(());
        }
    };

    if !is_non_empty_dir(&nested.join(bin_subdir)).map_err(layout_err)? {
        debug!(
            "{} has no populated {}/, leaving layout unchanged",
            nested.display(),
            bin_subdir
        );
        return Ok(());
    }

    info!(
        "Collapsing wrapper directory {} into {}",
        nested.display(),
        base_dir.display()
    );

    // Rename first so a child named like its parent cannot collide with it.
    let staging = staging_path(base_dir, nested);
    fs::rename(nested, &staging).map_err(layout_err)?;
    move_contents(&staging, base_dir).map_err(layout_err)?;

    if let Err(e) = fs::remove_dir_all(&staging) {
        warn!(
            "Could not remove emptied directory {}: {}",
            staging.display(),
            e
        );
    }

    Ok(())
}

fn is_non_empty_dir(path: &Path) -> std::io::Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(fs::read_dir(path)?.next().is_some())
}

fn list_subdirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut subdirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            subdirs.push(entry.path());
        }
    }
    Ok(subdirs)
}

fn staging_path(base_dir: &Path, nested: &Path) -> PathBuf {
    let name = nested
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut candidate = base_dir.join(format!(".{}.flatten", name));
    let mut n = 1;
    while candidate.exists() {
        candidate = base_dir.join(format!(".{}.flatten{}", name, n));
        n += 1;
    }
    candidate
}

/// Moves every entry of `from` into `to`, replacing same-named entries.
fn move_contents(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let dest = to.join(entry.file_name());

        if dest.is_dir() && !dest.is_symlink() {
            fs::remove_dir_all(&dest)?;
        } else if dest.exists() || dest.is_symlink() {
            fs::remove_file(&dest)?;
        }

        fs::rename(&source, &dest)?;
    }
    Ok(())
}
