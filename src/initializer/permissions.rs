//! Recursive ownership and mode changes on a local directory tree.

use serde_derive::{Deserialize, Serialize};

use std::fs;
use std::io;
use std::os::unix::fs::{chown, MetadataExt, PermissionsExt};
use std::path::Path;

use crate::errors::Error;

/// Owner and group ids.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl Owner {
    /// The `node` user of the n8n image.
    pub const NODE: Owner = Owner {
        uid: 1000,
        gid: 1000,
    };
}

/// What a permission pass did.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionReport {
    /// Entries looked at, symbolic links excluded.
    pub examined: usize,
    /// Entries whose owner or mode was changed.
    pub changed: usize,
}

fn permission_error(path: &Path, err: io::Error) -> Error {
    let message = match err.kind() {
        io::ErrorKind::NotFound => String::from("no such file or directory"),
        _ => err.to_string(),
    };
    Error::PermissionSetup {
        path: path.display().to_string(),
        message,
    }
}

/// Give `root` and everything below it the owner and mode given. Symbolic links are neither
/// followed nor changed. Entries that already conform are left alone.
pub fn apply(root: &Path, owner: Owner, mode: u32) -> Result<PermissionReport, Error> {
    let metadata = fs::symlink_metadata(root).map_err(|e| permission_error(root, e))?;
    let mut report = PermissionReport::default();
    visit(root, &metadata, owner, mode, &mut report)?;
    Ok(report)
}

fn visit(
    path: &Path,
    metadata: &fs::Metadata,
    owner: Owner,
    mode: u32,
    report: &mut PermissionReport,
) -> Result<(), Error> {
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    report.examined += 1;

    let mut changed = false;
    if metadata.uid() != owner.uid || metadata.gid() != owner.gid {
        chown(path, Some(owner.uid), Some(owner.gid)).map_err(|e| permission_error(path, e))?;
        changed = true;
    }
    if metadata.mode() & 0o7777 != mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| permission_error(path, e))?;
        changed = true;
    }
    if changed {
        trace!("changed {}", path.display());
        report.changed += 1;
    }

    if metadata.is_dir() {
        let entries = fs::read_dir(path).map_err(|e| permission_error(path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| permission_error(path, e))?;
            let child = entry.path();
            let child_metadata =
                fs::symlink_metadata(&child).map_err(|e| permission_error(&child, e))?;
            visit(&child, &child_metadata, owner, mode, report)?;
        }
    }
    Ok(())
}
