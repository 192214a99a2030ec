//! Owner-only permissions for the ledger database, its directory and the
//! WAL sidecars SQLite creates next to it.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const SIDECAR_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// Create the parent directory and database file if missing. On Unix the
/// directory is tightened to 0o700 and the file to 0o600.
pub(crate) fn prepare_db_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create ledger directory: {}", parent.display()))?;
        #[cfg(unix)]
        restrict_owned_dir(parent)?;
    }

    if !path.exists() {
        let mut options = OpenOptions::new();
        options.create(true).truncate(false).read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options
            .open(path)
            .with_context(|| format!("Failed to create ledger file: {}", path.display()))?;
    }

    #[cfg(unix)]
    set_owner_only(path)
        .with_context(|| format!("Failed to set ledger permissions: {}", path.display()))?;
    Ok(())
}

/// Tighten the `-wal`/`-shm` files of the database at `path`.
///
/// They only exist while a connection in WAL mode is open, so this runs after
/// the journal-mode pragma. Missing sidecars are skipped.
pub(crate) fn secure_wal_sidecars(path: &Path) {
    #[cfg(unix)]
    for sidecar in sidecar_paths(path) {
        if !sidecar.exists() {
            continue;
        }
        if let Err(e) = set_owner_only(&sidecar) {
            tracing::warn!(path = %sidecar.display(), "Failed to restrict ledger sidecar: {e}");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn sidecar_paths(path: &Path) -> Vec<PathBuf> {
    let Some(name) = path.file_name() else {
        return Vec::new();
    };
    let name = name.to_string_lossy();
    SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| path.with_file_name(format!("{name}{suffix}")))
        .collect()
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(unix)]
fn restrict_owned_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to read directory metadata: {}", path.display()))?;

    // Shared directories such as /tmp are left alone.
    let our_uid = unsafe { libc::getuid() };
    if metadata.uid() != our_uid || metadata.permissions().mode() & 0o077 == 0 {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to set directory permissions: {}", path.display()))
}
