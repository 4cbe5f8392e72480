//! Platform transport: a private, machine-local byte stream.
//!
//! Two backends sit behind one surface:
//! - **Unix**: a filesystem socket, chmod 0600 right after bind, inside a
//!   0700 runtime directory
//! - **Windows**: a named pipe whose DACL admits only the server's user and
//!   which rejects remote clients
//!
//! Nothing above this module sees an OS handle type. Accepted connections are
//! boxed [`IpcStream`]s plus the raw [`PeerCredentials`] read from the OS at
//! accept time.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use crate::config::ClientConfig;
use crate::error::{IpcError, Result};
use crate::peer::PeerCredentials;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Any bidirectional byte stream the transport produces.
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> IpcStream for T {}

pub type BoxedStream = Box<dyn IpcStream>;

/// Which backend an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Unix,
    NamedPipe,
}

/// Where a server listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    UnixSocket(PathBuf),
    NamedPipe(String),
}

impl Address {
    /// Interpret a user-supplied address string. Anything that looks like a
    /// pipe name is a pipe; everything else is a socket path.
    pub fn parse(s: &str) -> Self {
        if s.starts_with(r"\\.\pipe\") {
            Address::NamedPipe(s.to_string())
        } else {
            Address::UnixSocket(PathBuf::from(s))
        }
    }

    pub fn from_parts(kind: TransportKind, address: &str) -> Self {
        match kind {
            TransportKind::Unix => Address::UnixSocket(PathBuf::from(address)),
            TransportKind::NamedPipe => Address::NamedPipe(address.to_string()),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Address::UnixSocket(_) => TransportKind::Unix,
            Address::NamedPipe(_) => TransportKind::NamedPipe,
        }
    }

    fn unsupported(&self) -> IpcError {
        IpcError::Config {
            message: format!(
                "{:?} transport is not available on {}",
                self.kind(),
                crate::platform::current_platform()
            ),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::UnixSocket(path) => write!(f, "{}", path.display()),
            Address::NamedPipe(name) => f.write_str(name),
        }
    }
}

/// A freshly accepted connection.
pub struct Accepted {
    pub stream: BoxedStream,
    /// OS-reported identity of the connecting process. An error here must be
    /// treated as an unauthenticated peer.
    pub credentials: std::io::Result<PeerCredentials>,
}

enum ListenerImpl {
    #[cfg(unix)]
    Unix(unix::UnixSocketListener),
    #[cfg(windows)]
    Pipe(windows::NamedPipeListener),
}

/// A bound listening endpoint.
pub struct IpcListener {
    address: Address,
    inner: ListenerImpl,
}

impl IpcListener {
    /// Bind `address` with a bounded accept backlog.
    ///
    /// Fails with [`IpcError::AddressInUse`] if another live server owns the
    /// address. Stale socket files left by a crashed server are replaced.
    pub async fn bind(address: &Address, backlog: u32) -> Result<Self> {
        let inner = match address {
            #[cfg(unix)]
            Address::UnixSocket(path) => {
                ListenerImpl::Unix(unix::UnixSocketListener::bind(path, backlog).await?)
            }
            #[cfg(windows)]
            Address::NamedPipe(name) => {
                ListenerImpl::Pipe(windows::NamedPipeListener::bind(name, backlog)?)
            }
            other => return Err(other.unsupported()),
        };
        info!("IPC transport listening on {}", address);
        Ok(Self {
            address: address.clone(),
            inner,
        })
    }

    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Result<Accepted> {
        match &mut self.inner {
            #[cfg(unix)]
            ListenerImpl::Unix(listener) => listener.accept().await,
            #[cfg(windows)]
            ListenerImpl::Pipe(listener) => listener.accept().await,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

/// Open a client connection to `address`.
pub async fn connect(address: &Address) -> Result<BoxedStream> {
    let attempt = async {
        match address {
            #[cfg(unix)]
            Address::UnixSocket(path) => unix::connect(path).await,
            #[cfg(windows)]
            Address::NamedPipe(name) => windows::connect(name).await,
            other => Err(other.unsupported()),
        }
    };

    tokio::time::timeout(ClientConfig::CONNECT_TIMEOUT, attempt)
        .await
        .map_err(|_| IpcError::connection_lost(format!("Timed out connecting to {}", address)))?
}

/// Release the address after the listener is gone.
///
/// Removes the socket file on Unix; named pipes vanish with their last handle.
pub fn remove_address(address: &Address) -> Result<()> {
    match address {
        Address::UnixSocket(path) => match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed socket file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IpcError::io_with_path(e, path)),
        },
        Address::NamedPipe(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            Address::parse(r"\\.\pipe\loopline-alice"),
            Address::NamedPipe(r"\\.\pipe\loopline-alice".into())
        );
        assert_eq!(
            Address::parse("/run/user/1000/loopline/loopline.sock"),
            Address::UnixSocket("/run/user/1000/loopline/loopline.sock".into())
        );
    }

    #[test]
    fn test_from_parts_matches_kind() {
        let address = Address::from_parts(TransportKind::NamedPipe, r"\\.\pipe\x");
        assert_eq!(address.kind(), TransportKind::NamedPipe);
        assert_eq!(address.to_string(), r"\\.\pipe\x");
    }

    #[test]
    fn test_remove_missing_socket_is_ok() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let address = Address::UnixSocket(temp_dir.path().join("gone.sock"));
        remove_address(&address).unwrap();
    }
}
