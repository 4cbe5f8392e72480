//! Peer identity resolution.
//!
//! The transport hands over raw OS credentials for each accepted connection
//! ([`PeerCredentials`]); this module turns them into a [`PeerIdentity`] by
//! attaching the process name and executable used by the allow-list.
//! Resolution fails closed: a connection whose credentials cannot be read is
//! rejected, never trusted.

use crate::error::{IpcError, Result};
use crate::platform::{self, ProcessDescription};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Platform-neutral user identifier.
///
/// A decimal uid on Unix, a string SID on Windows. Only ever compared for
/// equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn from_uid(uid: u32) -> Self {
        Self(uid.to_string())
    }

    pub fn from_sid(sid: impl Into<String>) -> Self {
        Self(sid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw credentials read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCredentials {
    pub user: UserId,
    pub pid: Option<u32>,
}

/// Rate-limit key: one bucket per peer process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub user: UserId,
    pub pid: u32,
}

/// Resolved identity of a connected process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub user: UserId,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
}

impl PeerIdentity {
    pub fn key(&self) -> PeerKey {
        PeerKey {
            user: self.user.clone(),
            pid: self.pid,
        }
    }
}

/// Source of process names for the allow-list.
pub trait ProcessInspector: Send + Sync + 'static {
    fn describe(&self, pid: u32) -> Option<ProcessDescription>;
}

/// Inspector backed by the OS process table.
#[derive(Debug, Default)]
pub struct SystemInspector;

impl ProcessInspector for SystemInspector {
    fn describe(&self, pid: u32) -> Option<ProcessDescription> {
        platform::describe_process(pid)
    }
}

/// Turns transport credentials into identities.
#[derive(Clone)]
pub struct PeerResolver {
    inspector: Arc<dyn ProcessInspector>,
}

impl Default for PeerResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemInspector))
    }
}

impl std::fmt::Debug for PeerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerResolver").finish_non_exhaustive()
    }
}

impl PeerResolver {
    pub fn new(inspector: Arc<dyn ProcessInspector>) -> Self {
        Self { inspector }
    }

    /// Resolve the identity behind a just-accepted connection.
    ///
    /// Runs the process-table lookup on the blocking pool so a slow `/proc`
    /// read never stalls the accept loop.
    pub async fn resolve(
        &self,
        credentials: std::io::Result<PeerCredentials>,
    ) -> Result<PeerIdentity> {
        let credentials = credentials.map_err(|e| IpcError::Unauthenticated {
            reason: format!("peer credentials unavailable: {}", e),
        })?;
        let pid = credentials.pid.ok_or_else(|| IpcError::Unauthenticated {
            reason: "peer process id unavailable".to_string(),
        })?;

        let inspector = self.inspector.clone();
        let description = tokio::task::spawn_blocking(move || inspector.describe(pid))
            .await
            .ok()
            .flatten();

        Ok(PeerIdentity {
            user: credentials.user,
            pid,
            process_name: description.as_ref().map(|d| d.name.clone()),
            executable: description.and_then(|d| d.executable),
        })
    }
}
