//! Durable filesystem primitives: renames and deletes that survive a crash
//! need the parent directory synced as well as the file.

use crate::error::CapstanError;
use std::fs;
use std::path::Path;

pub fn fsync_file(path: &Path) -> Result<(), CapstanError> {
    let file = fs::OpenOptions::new().read(true).open(path)?;
    file.sync_all()?;
    Ok(())
}

pub fn fsync_dir(path: &Path) -> Result<(), CapstanError> {
    let dir = fs::File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

pub fn fsync_parent_dir(path: &Path) -> Result<(), CapstanError> {
    match path.parent() {
        Some(parent) => fsync_dir(parent),
        None => Ok(()),
    }
}

/// Rename with the destination's parent directory synced afterwards, so the
/// rename itself is durable.
pub fn fsync_rename(from: &Path, to: &Path) -> Result<(), CapstanError> {
    fs::rename(from, to)?;
    fsync_parent_dir(to)
}
