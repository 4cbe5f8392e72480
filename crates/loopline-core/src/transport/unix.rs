//! Unix domain socket backend.

use super::Accepted;
use crate::error::{IpcError, Result};
use crate::peer::{PeerCredentials, UserId};
use crate::platform::set_private;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tokio::net::{UnixListener, UnixSocket, UnixStream};
use tracing::{debug, warn};

pub(super) struct UnixSocketListener {
    listener: UnixListener,
}

impl UnixSocketListener {
    pub(super) async fn bind(path: &Path, backlog: u32) -> Result<Self> {
        clear_stale_socket(path).await?;

        let socket = UnixSocket::new_stream()?;
        socket
            .bind(path)
            .map_err(|e| IpcError::io_with_path(e, path))?;
        // Restrict before listen() so no connection is accepted while the
        // socket still carries the umask default.
        set_private(path)?;
        let listener = socket
            .listen(backlog)
            .map_err(|e| IpcError::io_with_path(e, path))?;

        Ok(Self { listener })
    }

    pub(super) async fn accept(&mut self) -> Result<Accepted> {
        let (stream, _) = self.listener.accept().await?;
        let credentials = peer_credentials(&stream);
        Ok(Accepted {
            stream: Box::new(stream),
            credentials,
        })
    }
}

pub(super) async fn connect(path: &Path) -> Result<super::BoxedStream> {
    let stream = UnixStream::connect(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
            IpcError::connection_lost(format!("No server at {}: {}", path.display(), e))
        }
        _ => IpcError::io_with_path(e, path),
    })?;
    Ok(Box::new(stream))
}

fn peer_credentials(stream: &UnixStream) -> std::io::Result<PeerCredentials> {
    let cred = stream.peer_cred()?;
    Ok(PeerCredentials {
        user: UserId::from_uid(cred.uid()),
        pid: cred.pid().and_then(|pid| u32::try_from(pid).ok()),
    })
}

/// Remove a socket file left behind by a server that is no longer running.
///
/// A socket that still accepts connections belongs to a live server, so the
/// bind is refused instead. Anything at the path that is not a socket is
/// left untouched.
async fn clear_stale_socket(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(IpcError::io_with_path(e, path)),
    };
    if !metadata.file_type().is_socket() {
        return Err(IpcError::Config {
            message: format!("{} exists and is not a socket", path.display()),
        });
    }

    if UnixStream::connect(path).await.is_ok() {
        return Err(IpcError::AddressInUse {
            address: path.display().to_string(),
        });
    }

    warn!("Removing stale socket file {}", path.display());
    std::fs::remove_file(path).map_err(|e| IpcError::io_with_path(e, path))?;
    debug!("Stale socket removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.sock");
        let _listener = UnixSocketListener::bind(&path, 8).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.sock");
        {
            let _first = UnixSocketListener::bind(&path, 8).await.unwrap();
        }
        assert!(path.exists(), "dropping a listener leaves the file behind");

        let _second = UnixSocketListener::bind(&path, 8).await.unwrap();
    }

    #[tokio::test]
    async fn test_live_socket_is_address_in_use() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.sock");
        let _first = UnixSocketListener::bind(&path, 8).await.unwrap();

        match UnixSocketListener::bind(&path, 8).await {
            Err(IpcError::AddressInUse { .. }) => {}
            Err(other) => panic!("Expected AddressInUse, got: {:?}", other),
            Ok(_) => panic!("Expected AddressInUse, got a listener"),
        }
    }

    #[tokio::test]
    async fn test_regular_file_is_never_removed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("notes.txt");
        std::fs::write(&path, "keep me").unwrap();

        match UnixSocketListener::bind(&path, 8).await {
            Err(IpcError::Config { .. }) => {}
            Err(other) => panic!("Expected Config error, got: {:?}", other),
            Ok(_) => panic!("Bound over a regular file"),
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[tokio::test]
    async fn test_accept_reports_own_uid() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("t.sock");
        let mut listener = UnixSocketListener::bind(&path, 8).await.unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move { connect(&path).await.unwrap() }
        });
        let accepted = listener.accept().await.unwrap();
        let _client = client.await.unwrap();

        let credentials = accepted.credentials.unwrap();
        assert_eq!(
            credentials.user,
            UserId::from_uid(nix::unistd::Uid::effective().as_raw())
        );
        assert_eq!(credentials.pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_connect_without_server_is_connection_lost() {
        let temp_dir = TempDir::new().unwrap();
        let err = connect(&temp_dir.path().join("absent.sock"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, IpcError::ConnectionLost { .. }));
    }
}
