//! Named pipe backend.
//!
//! A server pipe instance is created ahead of time and waits for a client;
//! once one connects, the next instance is created before the connected one
//! is handed out so the name is never unclaimed.
#![allow(unsafe_code)]

use super::Accepted;
use crate::config::ClientConfig;
use crate::error::{IpcError, Result};
use crate::peer::{PeerCredentials, UserId};
use crate::platform::windows::{current_user_sid, pipe_client_pid, process_user_sid, PipeSecurity};
use std::os::windows::io::AsRawHandle;
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, PipeMode, ServerOptions};
use tracing::debug;
use windows_sys::Win32::Foundation::{ERROR_ACCESS_DENIED, ERROR_PIPE_BUSY};

pub(super) struct NamedPipeListener {
    name: String,
    security: PipeSecurity,
    pending: NamedPipeServer,
}

impl NamedPipeListener {
    /// Claim the pipe name.
    ///
    /// The backlog is not configurable for pipes: exactly one unconnected
    /// instance waits at a time.
    pub(super) fn bind(name: &str, backlog: u32) -> Result<Self> {
        debug!("Named pipe ignores backlog {}", backlog);
        let security = PipeSecurity::for_user(&current_user_sid()?)?;
        let pending = create_instance(name, &security, true).map_err(|e| {
            if e.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) {
                IpcError::AddressInUse {
                    address: name.to_string(),
                }
            } else {
                IpcError::from(e)
            }
        })?;

        Ok(Self {
            name: name.to_string(),
            security,
            pending,
        })
    }

    pub(super) async fn accept(&mut self) -> Result<Accepted> {
        self.pending.connect().await?;
        let next = create_instance(&self.name, &self.security, false)?;
        let connected = std::mem::replace(&mut self.pending, next);

        let credentials = peer_credentials(&connected);
        Ok(Accepted {
            stream: Box::new(connected),
            credentials,
        })
    }
}

fn create_instance(
    name: &str,
    security: &PipeSecurity,
    first: bool,
) -> std::io::Result<NamedPipeServer> {
    let mut options = ServerOptions::new();
    options
        .first_pipe_instance(first)
        .reject_remote_clients(true)
        .pipe_mode(PipeMode::Byte);
    // SAFETY: `security.as_raw()` points to a SECURITY_ATTRIBUTES whose
    // descriptor lives as long as `security`, which outlives this call.
    unsafe { options.create_with_security_attributes_raw(name, security.as_raw()) }
}

fn peer_credentials(pipe: &NamedPipeServer) -> std::io::Result<PeerCredentials> {
    let pid = pipe_client_pid(pipe.as_raw_handle())?;
    let sid = process_user_sid(pid)?;
    Ok(PeerCredentials {
        user: UserId::from_sid(sid),
        pid: Some(pid),
    })
}

pub(super) async fn connect(name: &str) -> Result<super::BoxedStream> {
    loop {
        match ClientOptions::new().open(name) {
            Ok(client) => return Ok(Box::new(client)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IpcError::connection_lost(format!(
                    "No server at {}: {}",
                    name, e
                )))
            }
            Err(e) => return Err(e.into()),
        }
        tokio::time::sleep(ClientConfig::PIPE_BUSY_RETRY_DELAY).await;
    }
}
