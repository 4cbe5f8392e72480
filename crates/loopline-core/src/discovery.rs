//! Discovery file: how clients find a running server.
//!
//! The server writes a small JSON document into the per-user runtime
//! directory naming its transport address, pid, protocol version, and start
//! time. Writes are atomic (temp file, flush, fsync, rename) and the file is
//! owner-only from the moment it is created.

use crate::config::ProtocolConfig;
use crate::error::{IpcError, Result};
use crate::platform::{self, is_process_alive};
use crate::transport::{Address, TransportKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Contents of the discovery file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryInfo {
    pub transport: TransportKind,
    pub address: String,
    pub pid: u32,
    pub protocol_version: u32,
    pub started_at: DateTime<Utc>,
}

impl DiscoveryInfo {
    /// Describe the current process serving on `address`.
    pub fn for_current_process(address: &Address, started_at: DateTime<Utc>) -> Self {
        Self {
            transport: address.kind(),
            address: address.to_string(),
            pid: std::process::id(),
            protocol_version: ProtocolConfig::VERSION,
            started_at,
        }
    }

    pub fn address(&self) -> Address {
        Address::from_parts(self.transport, &self.address)
    }

    /// Read a discovery file.
    ///
    /// Returns `None` if the file doesn't exist, or an error if parsing fails.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(IpcError::io_with_path(e, path)),
        };

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| IpcError::io_with_path(e, path))?;

        let info = serde_json::from_str(&contents).map_err(|e| IpcError::Json {
            message: format!("Failed to parse {}: {}", path.display(), e),
            source: Some(e),
        })?;
        Ok(Some(info))
    }

    /// Write the discovery file atomically with owner-only permissions.
    pub fn write(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));

        {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }

            let mut file = options
                .open(&temp_path)
                .map_err(|e| IpcError::io_with_path(e, &temp_path))?;
            file.write_all(serialized.as_bytes())
                .map_err(|e| IpcError::io_with_path(e, &temp_path))?;
            file.flush()
                .map_err(|e| IpcError::io_with_path(e, &temp_path))?;
            file.sync_all()
                .map_err(|e| IpcError::io_with_path(e, &temp_path))?;
        }

        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(IpcError::io_with_path(e, path));
        }
        platform::set_private(path)?;

        info!("Published discovery file {}", path.display());
        Ok(())
    }

    /// Remove the discovery file if it still names process `pid`.
    ///
    /// A newer server may have replaced the file; that one is left alone.
    /// Returns whether a file was removed.
    pub fn remove_if_owned(path: &Path, pid: u32) -> Result<bool> {
        match Self::read(path) {
            Ok(Some(info)) if info.pid == pid => {
                fs::remove_file(path).map_err(|e| IpcError::io_with_path(e, path))?;
                debug!("Removed discovery file {}", path.display());
                Ok(true)
            }
            Ok(Some(info)) => {
                debug!(
                    "Discovery file {} now belongs to pid {}, leaving it",
                    path.display(),
                    info.pid
                );
                Ok(false)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!("Unreadable discovery file {}: {}", path.display(), e);
                Ok(false)
            }
        }
    }
}

/// Locate the live server published in `runtime_dir`.
///
/// Returns `None` if no discovery file exists or the process it names has
/// exited. A server speaking a different protocol version is an error.
pub fn discover(runtime_dir: &Path) -> Result<Option<DiscoveryInfo>> {
    let path = platform::discovery_path(runtime_dir);
    let Some(info) = DiscoveryInfo::read(&path)? else {
        debug!("No discovery file at {}", path.display());
        return Ok(None);
    };

    if !is_process_alive(info.pid) {
        warn!(
            "Discovery file {} names dead pid {}, ignoring",
            path.display(),
            info.pid
        );
        return Ok(None);
    }

    if info.protocol_version != ProtocolConfig::VERSION {
        return Err(IpcError::protocol(format!(
            "Server speaks protocol version {}, client expects {}",
            info.protocol_version,
            ProtocolConfig::VERSION
        )));
    }

    Ok(Some(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sample(pid: u32) -> DiscoveryInfo {
        DiscoveryInfo {
            transport: TransportKind::Unix,
            address: "/run/user/1000/loopline/loopline.sock".to_string(),
            pid,
            protocol_version: ProtocolConfig::VERSION,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_read_missing_returns_none() {
        let temp_dir = TempDir::new().unwrap();
        assert!(DiscoveryInfo::read(&temp_dir.path().join("loopline.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("loopline.json");
        let info = sample(std::process::id());
        info.write(&path).unwrap();

        assert_eq!(DiscoveryInfo::read(&path).unwrap(), Some(info.clone()));
        assert_eq!(
            info.address(),
            Address::UnixSocket(PathBuf::from("/run/user/1000/loopline/loopline.sock"))
        );

        // No temp files left behind
        let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_written_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("loopline.json");
        sample(1).write(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(sample(7)).unwrap();
        assert_eq!(json["transport"], "unix");
        assert_eq!(json["pid"], 7);
        assert!(json["started_at"].is_string());
    }

    #[test]
    fn test_discover_live_server() {
        let temp_dir = TempDir::new().unwrap();
        let info = sample(std::process::id());
        info.write(&platform::discovery_path(temp_dir.path())).unwrap();
        assert_eq!(discover(temp_dir.path()).unwrap(), Some(info));
    }

    #[test]
    fn test_discover_ignores_dead_pid() {
        let temp_dir = TempDir::new().unwrap();
        sample(u32::MAX - 1)
            .write(&platform::discovery_path(temp_dir.path()))
            .unwrap();
        assert!(discover(temp_dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_discover_rejects_version_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let mut info = sample(std::process::id());
        info.protocol_version = ProtocolConfig::VERSION + 1;
        info.write(&platform::discovery_path(temp_dir.path())).unwrap();

        let err = discover(temp_dir.path()).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_remove_only_when_owned() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("loopline.json");
        sample(100).write(&path).unwrap();

        assert!(!DiscoveryInfo::remove_if_owned(&path, 200).unwrap());
        assert!(path.exists());
        assert!(DiscoveryInfo::remove_if_owned(&path, 100).unwrap());
        assert!(!path.exists());
    }
}
