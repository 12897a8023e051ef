//! On-disk folders of the embedded engine
//!
//! Folders the harness manages itself (the defaults under
//! `target/cassandra_embedded`) are created on demand. Any other folder is
//! the caller's and must already exist with read and write permission for
//! the current user.

use std::fs;
use std::path::Path;

use nix::unistd::{access, AccessFlags, Uid, User};
use tracing::{debug, info};

use crate::error::{HarnessError, Result};

/// Check that `folder` is usable as an engine data folder.
///
/// `test_managed` folders are created when missing; any other folder must
/// exist, be a directory, and be readable and writable.
pub fn validate_folder(folder: &Path, test_managed: bool) -> Result<()> {
    if test_managed {
        if folder.exists() {
            info!(folder = %folder.display(), "Using existing data folder for tests");
        } else {
            info!(folder = %folder.display(), "Creating folder");
            fs::create_dir_all(folder).map_err(|e| HarnessError::io(folder, e))?;
        }
        return Ok(());
    }

    let shown = folder.display();
    if !folder.exists() {
        return Err(HarnessError::config(format!("Folder '{shown}' does not exist")));
    }
    if !folder.is_dir() {
        return Err(HarnessError::config(format!("Folder '{shown}' is not a directory")));
    }
    if access(folder, AccessFlags::R_OK).is_err() {
        return Err(HarnessError::config(format!(
            "No read credential. Please grant read permission for the current user '{}' on folder '{shown}'",
            current_user_name()
        )));
    }
    if access(folder, AccessFlags::W_OK).is_err() {
        return Err(HarnessError::config(format!(
            "No write credential. Please grant write permission for the current user '{}' on folder '{shown}'",
            current_user_name()
        )));
    }
    debug!(folder = %shown, "Folder validated");
    Ok(())
}

/// Delete everything inside `folder`, keeping the folder itself.
///
/// Missing folders are ignored.
pub fn clean_folder(folder: &Path) -> Result<()> {
    if !folder.is_dir() {
        return Ok(());
    }
    info!(folder = %folder.display(), "Cleaning up embedded data directory");
    let entries = fs::read_dir(folder).map_err(|e| HarnessError::io(folder, e))?;
    for entry in entries {
        let path = entry.map_err(|e| HarnessError::io(folder, e))?.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| HarnessError::io(&path, e))?;
    }
    Ok(())
}

/// Create `folder` if needed.
pub fn ensure_folder(folder: &Path) -> Result<()> {
    if !folder.exists() {
        debug!(folder = %folder.display(), "Creating folder");
        fs::create_dir_all(folder).map_err(|e| HarnessError::io(folder, e))?;
    }
    Ok(())
}

/// Login name of the current user, or the numeric uid when unknown.
pub fn current_user_name() -> String {
    let uid = Uid::current();
    match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}
