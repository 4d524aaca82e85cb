//! Checkpoint archival: pack the three checkpoint files into a gzip tar,
//! and restore one with staging: extract to a temporary directory, verify,
//! then swap into place. An archive is never trusted before it proves it
//! contains exactly the expected entries and extracts cleanly.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::checkpoint::{CONTROL_FILE, DB_FILE, TOPOLOGY_FILE};
use crate::error::EchomapError;

/// A restorable archive can't plausibly be smaller than this (the SQLite
/// file alone is at least 8 KB before compression headroom).
pub const MIN_ARCHIVE_BYTES: u64 = 100 * 1024;
pub const MAX_ARCHIVE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

const EXPECTED_ENTRIES: [&str; 3] = [TOPOLOGY_FILE, DB_FILE, CONTROL_FILE];

/// Tar the three checkpoint files into a gzip archive at `archive_path`,
/// then verify the result extracts before returning.
pub fn pack(checkpoint_dir: &Path, archive_path: &Path) -> Result<(), EchomapError> {
    for name in EXPECTED_ENTRIES {
        let path = checkpoint_dir.join(name);
        if !path.is_file() {
            return Err(EchomapError::Archive(format!(
                "cannot pack: {} missing from {}",
                name,
                checkpoint_dir.display()
            )));
        }
    }

    let file = File::create(archive_path).map_err(|e| EchomapError::io(archive_path, e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for name in EXPECTED_ENTRIES {
        let path = checkpoint_dir.join(name);
        builder
            .append_path_with_name(&path, name)
            .map_err(|e| EchomapError::io(&path, e))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| EchomapError::io(archive_path, e))?;
    let file = encoder
        .finish()
        .map_err(|e| EchomapError::io(archive_path, e))?;
    file.sync_all()
        .map_err(|e| EchomapError::io(archive_path, e))?;

    verify(archive_path)?;
    tracing::info!(archive = %archive_path.display(), "checkpoint packed and verified");
    Ok(())
}

/// Prove the archive is non-empty, names exactly the expected entries, and
/// extracts successfully (into a throwaway directory).
pub fn verify(archive_path: &Path) -> Result<(), EchomapError> {
    let meta = fs::metadata(archive_path).map_err(|e| EchomapError::io(archive_path, e))?;
    if meta.len() == 0 {
        return Err(EchomapError::Archive("archive is empty".into()));
    }

    let staging = tempfile::tempdir().map_err(|e| EchomapError::io(archive_path, e))?;
    let extracted = extract_entries(archive_path, staging.path())?;

    let expected: HashSet<&str> = EXPECTED_ENTRIES.into_iter().collect();
    let got: HashSet<&str> = extracted.iter().map(String::as_str).collect();
    if got != expected {
        return Err(EchomapError::Archive(format!(
            "archive entries {:?} do not match the expected checkpoint set",
            extracted
        )));
    }
    Ok(())
}

/// Restore an archive into `checkpoint_dir`, replacing whatever is there.
/// The archive is validated and fully extracted to a staging directory
/// first; the live directory is only touched by the final swap.
pub fn unpack(archive_path: &Path, checkpoint_dir: &Path) -> Result<(), EchomapError> {
    let meta = fs::metadata(archive_path).map_err(|e| EchomapError::io(archive_path, e))?;
    if meta.len() < MIN_ARCHIVE_BYTES {
        return Err(EchomapError::Archive(format!(
            "archive is {} bytes — below the {} byte minimum, refusing to restore",
            meta.len(),
            MIN_ARCHIVE_BYTES
        )));
    }
    if meta.len() > MAX_ARCHIVE_BYTES {
        return Err(EchomapError::Archive(format!(
            "archive is {} bytes — above the {} byte maximum, refusing to restore",
            meta.len(),
            MAX_ARCHIVE_BYTES
        )));
    }

    let parent = checkpoint_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|e| EchomapError::io(parent, e))?;

    // Stage next to the target so the final rename stays on one filesystem.
    let staging = tempfile::tempdir_in(parent).map_err(|e| EchomapError::io(parent, e))?;
    let extracted = extract_entries(archive_path, staging.path())?;

    let expected: HashSet<&str> = EXPECTED_ENTRIES.into_iter().collect();
    let got: HashSet<&str> = extracted.iter().map(String::as_str).collect();
    if got != expected {
        return Err(EchomapError::Archive(format!(
            "archive entries {:?} do not match the expected checkpoint set",
            extracted
        )));
    }

    let staged = staging.into_path();
    let displaced = checkpoint_dir.with_extension("replaced");

    if checkpoint_dir.exists() {
        if displaced.exists() {
            fs::remove_dir_all(&displaced).map_err(|e| EchomapError::io(&displaced, e))?;
        }
        fs::rename(checkpoint_dir, &displaced)
            .map_err(|e| EchomapError::io(checkpoint_dir, e))?;
    }

    if let Err(e) = fs::rename(&staged, checkpoint_dir) {
        // Put the previous directory back before failing.
        if displaced.exists() {
            let _ = fs::rename(&displaced, checkpoint_dir);
        }
        let _ = fs::remove_dir_all(&staged);
        return Err(EchomapError::io(checkpoint_dir, e));
    }

    if displaced.exists() {
        if let Err(e) = fs::remove_dir_all(&displaced) {
            tracing::warn!(
                path = %displaced.display(),
                "could not remove displaced checkpoint directory: {e}"
            );
        }
    }

    tracing::info!(
        archive = %archive_path.display(),
        dir = %checkpoint_dir.display(),
        "checkpoint restored from archive"
    );
    Ok(())
}

/// Extract every entry into `dest`, refusing entry names that are not plain
/// top-level file names. Returns the entry names seen.
fn extract_entries(archive_path: &Path, dest: &Path) -> Result<Vec<String>, EchomapError> {
    let file = File::open(archive_path).map_err(|e| EchomapError::io(archive_path, e))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let mut names = Vec::new();
    let entries = archive
        .entries()
        .map_err(|e| EchomapError::Archive(format!("unreadable archive: {e}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| EchomapError::Archive(format!("corrupt archive entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| EchomapError::Archive(format!("bad entry path: {e}")))?
            .into_owned();

        let name = plain_file_name(&path).ok_or_else(|| {
            EchomapError::Archive(format!(
                "archive entry '{}' is not a plain top-level file",
                path.display()
            ))
        })?;

        entry
            .unpack(dest.join(&name))
            .map_err(|e| EchomapError::Archive(format!("failed to extract '{name}': {e}")))?;
        names.push(name);
    }

    if names.is_empty() {
        return Err(EchomapError::Archive("archive contains no entries".into()));
    }
    Ok(names)
}

/// Accept only `name` or `./name`: no directories, no parent traversal.
fn plain_file_name(path: &Path) -> Option<String> {
    let mut parts = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir));
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(name)), None) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}
