//! Owner-only file and directory permissions.

use crate::error::Result;
use std::path::Path;
use tracing::debug;

/// Set file permissions to be readable and writable by owner only.
///
/// # Platform Behavior
/// - **Linux/macOS**: Sets mode 0o600
/// - **Windows**: No-op; access is governed by the parent directory's ACL
///   (files under the per-user local data directory inherit the user's DACL)
pub fn set_private(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        set_mode(path, 0o600)?;
        debug!("Set private permissions (0600) on: {}", path.display());
    }

    #[cfg(windows)]
    {
        debug!(
            "Relying on inherited ACL for private file on Windows: {}",
            path.display()
        );
    }

    Ok(())
}

/// Restrict a directory to its owner.
///
/// # Platform Behavior
/// - **Linux/macOS**: Sets mode 0o700
/// - **Windows**: No-op (see [`set_private`])
pub fn set_private_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        set_mode(path, 0o700)?;
        debug!("Set private permissions (0700) on: {}", path.display());
    }

    #[cfg(windows)]
    {
        let _ = path;
    }

    Ok(())
}

/// Check that nobody but the owner can access `path`.
///
/// Always true on Windows.
pub fn is_private(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o077 == 0)
            .unwrap_or(false)
    }

    #[cfg(windows)]
    {
        let _ = path;
        true
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use crate::error::IpcError;
    use std::os::unix::fs::PermissionsExt;
    let metadata = std::fs::metadata(path).map_err(|e| IpcError::io_with_path(e, path))?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(mode);
    std::fs::set_permissions(path, permissions).map_err(|e| IpcError::io_with_path(e, path))
}
