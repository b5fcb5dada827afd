//! Archive extraction for downloaded tool packages.
//!
//! This module unpacks zip, tar.gz and tar.xz archives entry by entry,
//! reporting progress after each entry and checking for cancellation before
//! each one. A failed or cancelled extraction leaves no output directory.
//!
//! Extraction is blocking I/O and is meant to run on a blocking worker.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{InstallError, InstallResult};
use super::types::{ArchiveFormat, Completion};

// ============================================================================
// Archive Extraction
// ============================================================================

/// Extracts an archive into `dest_dir`, replacing any previous contents.
///
/// `on_progress` receives `entries_done / total_entries` after each entry.
/// Returns the number of entries processed.
///
/// # Errors
///
/// Returns [`InstallError::Extract`] if the archive cannot be opened, is not
/// a valid archive of `format`, or an entry cannot be written. The
/// destination directory is removed in that case.
pub fn extract_archive(
    archive_path: &Path,
    dest_dir: &Path,
    format: ArchiveFormat,
    on_progress: &dyn Fn(f64),
    cancel: &CancellationToken,
) -> InstallResult<Completion<usize>> {
    info!(
        "Extracting {} archive {} to {}",
        format,
        archive_path.display(),
        dest_dir.display()
    );

    if dest_dir.exists() {
        fs::remove_dir_all(dest_dir).map_err(|e| {
            InstallError::extract(
                archive_path,
                format!("Failed to remove previous {}: {}", dest_dir.display(), e),
            )
        })?;
    }

    fs::create_dir_all(dest_dir).map_err(|e| {
        InstallError::extract(
            archive_path,
            format!("Failed to create directory {}: {}", dest_dir.display(), e),
        )
    })?;

    let result = match format {
        ArchiveFormat::Zip => extract_zip(archive_path, dest_dir, on_progress, cancel),
        ArchiveFormat::TarGz | ArchiveFormat::TarXz => {
            extract_tar_archive(archive_path, dest_dir, format, on_progress, cancel)
        }
    };

    match result {
        Ok(Completion::Finished(entries)) => {
            debug!("Extracted {} entries", entries);
            Ok(Completion::Finished(entries))
        }
        Ok(Completion::Cancelled) => {
            remove_output(dest_dir);
            info!("Extraction of {} cancelled", archive_path.display());
            Ok(Completion::Cancelled)
        }
        Err(e) => {
            remove_output(dest_dir);
            Err(InstallError::extract(archive_path, format!("{:#}", e)))
        }
    }
}

fn remove_output(dest_dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dest_dir) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to clean up {}: {}", dest_dir.display(), e);
        }
    }
}

fn report(on_progress: &dyn Fn(f64), done: usize, total: usize) {
    if total == 0 {
        on_progress(1.0);
    } else {
        on_progress(done as f64 / total as f64);
    }
}

// ============================================================================
// ZIP Extraction
// ============================================================================

fn extract_zip(
    archive_path: &Path,
    dest_dir: &Path,
    on_progress: &dyn Fn(f64),
    cancel: &CancellationToken,
) -> Result<Completion<usize>> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open zip: {}", archive_path.display()))?;

    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("Failed to read zip: {}", archive_path.display()))?;

    let total = archive.len();
    if total == 0 {
        report(on_progress, 0, 0);
        return Ok(Completion::Finished(0));
    }

    for i in 0..total {
        if cancel.is_cancelled() {
            return Ok(Completion::Cancelled);
        }

        let mut entry = archive.by_index(i)?;
        match entry.enclosed_name() {
            Some(relative) => {
                let dest_path = dest_dir.join(&relative);

                if entry.is_dir() {
                    fs::create_dir_all(&dest_path)?;
                } else {
                    if let Some(parent) = dest_path.parent() {
                        fs::create_dir_all(parent)?;
                    }

                    let mut outfile = File::create(&dest_path)
                        .with_context(|| format!("Failed to create: {}", dest_path.display()))?;
                    io::copy(&mut entry, &mut outfile)
                        .with_context(|| format!("Failed to write: {}", dest_path.display()))?;

                    #[cfg(unix)]
                    set_unix_permissions(&dest_path, entry.unix_mode())?;
                }
            }
            None => warn!("Skipping unsafe path in zip: {}", entry.name()),
        }

        report(on_progress, i + 1, total);
    }

    Ok(Completion::Finished(total))
}

// ============================================================================
// TAR Extraction
// ============================================================================

fn open_tar_stream(archive_path: &Path, format: ArchiveFormat) -> Result<Box<dyn Read>> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open {}: {}", format, archive_path.display()))?;
    let reader = BufReader::new(file);

    match format {
        ArchiveFormat::TarGz => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
        ArchiveFormat::TarXz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        ArchiveFormat::Zip => anyhow::bail!("Zip archives are not tar streams"),
    }
}

fn extract_tar_archive(
    archive_path: &Path,
    dest_dir: &Path,
    format: ArchiveFormat,
    on_progress: &dyn Fn(f64),
    cancel: &CancellationToken,
) -> Result<Completion<usize>> {
    // Tar streams carry no index, so the entries are counted in a first pass.
    let total = {
        let mut counting = tar::Archive::new(open_tar_stream(archive_path, format)?);
        let mut count = 0usize;
        for entry in counting
            .entries()
            .with_context(|| format!("Failed to read {}", archive_path.display()))?
        {
            entry.with_context(|| format!("Corrupt entry in {}", archive_path.display()))?;
            count += 1;
        }
        count
    };

    let archive = tar::Archive::new(open_tar_stream(archive_path, format)?);
    extract_tar(archive, total, dest_dir, on_progress, cancel)
}

fn extract_tar<R: Read>(
    mut archive: tar::Archive<R>,
    total: usize,
    dest_dir: &Path,
    on_progress: &dyn Fn(f64),
    cancel: &CancellationToken,
) -> Result<Completion<usize>> {
    let dest_dir_canonical = dest_dir
        .canonicalize()
        .unwrap_or_else(|_| dest_dir.to_path_buf());

    if total == 0 {
        report(on_progress, 0, 0);
        return Ok(Completion::Finished(0));
    }

    let mut done = 0usize;
    for entry_result in archive.entries()? {
        if cancel.is_cancelled() {
            return Ok(Completion::Cancelled);
        }

        let mut entry = entry_result?;
        done += 1;
        let entry_type = entry.header().entry_type();

        // Links could point outside dest_dir
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            warn!("Skipping symlink/hardlink in tar archive");
            report(on_progress, done, total);
            continue;
        }

        let path = entry.path()?.into_owned();

        if path.is_absolute()
            || path
                .components()
                .any(|c| c == std::path::Component::ParentDir)
        {
            warn!("Skipping unsafe path in tar: {:?}", path);
            report(on_progress, done, total);
            continue;
        }

        let dest_path = dest_dir.join(&path);

        let dest_canonical = if dest_path.exists() {
            dest_path.canonicalize()?
        } else if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
            let parent_canonical = parent.canonicalize()?;
            parent_canonical.join(dest_path.file_name().unwrap_or_default())
        } else {
            dest_path.clone()
        };

        if !dest_canonical.starts_with(&dest_dir_canonical) {
            warn!(
                "Skipping path that escapes dest_dir: {:?} -> {:?}",
                path, dest_canonical
            );
            report(on_progress, done, total);
            continue;
        }

        if entry_type.is_dir() {
            fs::create_dir_all(&dest_path)?;
        } else if entry_type.is_file() {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut outfile = File::create(&dest_path)
                .with_context(|| format!("Failed to create: {}", dest_path.display()))?;
            io::copy(&mut entry, &mut outfile)?;
            outfile.flush()?;

            #[cfg(unix)]
            {
                if let Ok(mode) = entry.header().mode() {
                    set_unix_permissions(&dest_path, Some(mode))?;
                }
            }
        }

        report(on_progress, done, total);
    }

    Ok(Completion::Finished(done))
}

// ============================================================================
// Unix Permissions
// ============================================================================

#[cfg(unix)]
fn set_unix_permissions(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        if mode & 0o111 != 0 {
            let permissions = fs::Permissions::from_mode(mode | 0o755);
            fs::set_permissions(path, permissions)
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }
    }

    Ok(())
}
