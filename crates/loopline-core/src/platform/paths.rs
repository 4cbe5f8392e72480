//! Platform-specific runtime paths.
//!
//! This module resolves where the daemon keeps its per-user runtime state:
//! - The runtime directory (socket file, discovery file)
//! - The default transport address
//! - The discovery file location

use crate::config::PathsConfig;
use crate::error::{IpcError, Result};
use crate::transport::Address;
use std::path::{Path, PathBuf};

/// Get the per-user runtime directory.
///
/// # Platform Behavior
/// - **Linux**: `$XDG_RUNTIME_DIR/loopline`, else `{tmp}/loopline-{uid}`
/// - **macOS**: `{tmp}/loopline-{uid}` (`$TMPDIR` is already per-user)
/// - **Windows**: `%LOCALAPPDATA%/loopline`
pub fn runtime_dir() -> Result<PathBuf> {
    #[cfg(unix)]
    {
        if let Some(dir) = dirs::runtime_dir() {
            return Ok(dir.join(PathsConfig::APP_DIR_NAME));
        }
        let uid = nix::unistd::Uid::effective().as_raw();
        Ok(std::env::temp_dir().join(format!("{}-{}", PathsConfig::APP_DIR_NAME, uid)))
    }

    #[cfg(windows)]
    {
        let data_dir = dirs::data_local_dir().ok_or_else(|| IpcError::Config {
            message: "Could not determine local app data directory".to_string(),
        })?;
        Ok(data_dir.join(PathsConfig::APP_DIR_NAME))
    }
}

/// Create the runtime directory if needed and restrict it to the owner.
///
/// On Unix, a pre-existing directory owned by another user is refused, since
/// whoever owns it could swap the socket file underneath us.
pub fn ensure_runtime_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| IpcError::io_with_path(e, dir))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let metadata = std::fs::metadata(dir).map_err(|e| IpcError::io_with_path(e, dir))?;
        if metadata.uid() != nix::unistd::Uid::effective().as_raw() {
            return Err(IpcError::PermissionDenied(dir.to_path_buf()));
        }
    }

    super::permissions::set_private_dir(dir)
}

/// Default transport address for a runtime directory.
///
/// # Platform Behavior
/// - **Linux/macOS**: `{runtime_dir}/loopline.sock`
/// - **Windows**: `\\.\pipe\loopline-{username}` (pipes have no filesystem home)
pub fn default_address(runtime_dir: &Path) -> Address {
    #[cfg(unix)]
    {
        Address::UnixSocket(runtime_dir.join(PathsConfig::SOCKET_FILE_NAME))
    }

    #[cfg(windows)]
    {
        let _ = runtime_dir;
        let user = std::env::var("USERNAME").unwrap_or_else(|_| "user".to_string());
        let sanitized: String = user
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Address::NamedPipe(format!("{}{}", PathsConfig::PIPE_NAME_PREFIX, sanitized))
    }
}

/// Location of the discovery file within a runtime directory.
pub fn discovery_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(PathsConfig::DISCOVERY_FILE_NAME)
}
