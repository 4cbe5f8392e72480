//! Centralized configuration for the loopline IPC layer.
//!
//! Compile-time constants live in unit structs; runtime knobs live in
//! [`ServerConfig`], which is deserialized from JSON with per-field defaults
//! and is immutable once the server has started.

use crate::error::{IpcError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Version published in the discovery file. Bumped on wire-incompatible changes.
    pub const VERSION: u32 = 1;
    pub const LENGTH_PREFIX_BYTES: usize = 4;
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MiB
    /// No configuration may raise the frame limit above this.
    pub const MAX_FRAME_CEILING: usize = 64 * 1024 * 1024; // 64 MiB
    pub const API_PREFIX: &'static str = "/api";
}

/// File and directory names used under the runtime directory.
pub struct PathsConfig;

impl PathsConfig {
    pub const APP_DIR_NAME: &'static str = "loopline";
    pub const SOCKET_FILE_NAME: &'static str = "loopline.sock";
    pub const DISCOVERY_FILE_NAME: &'static str = "loopline.json";
    pub const PIPE_NAME_PREFIX: &'static str = r"\\.\pipe\loopline-";
}

/// Client-side defaults.
pub struct ClientConfig;

impl ClientConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const PIPE_BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);
}

/// Token bucket settings applied per peer process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Steady-state refill rate.
    pub requests_per_second: u32,
    /// Bucket capacity.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 20,
            burst: 40,
        }
    }
}

/// Peer trust policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Reject peers running under a different user than the server.
    pub require_same_user: bool,
    /// Regex patterns matched against the peer's process name and
    /// executable path. Empty means any same-user process is accepted.
    pub allowed_processes: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_same_user: true,
            allowed_processes: Vec::new(),
        }
    }
}

/// Route namespace versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiVersionConfig {
    /// Accepted version segments, e.g. `v1` for `/api/v1/...`.
    pub supported: Vec<String>,
    /// Subset of `supported` still served during a deprecation window.
    pub deprecated: Vec<String>,
}

impl Default for ApiVersionConfig {
    fn default() -> Self {
        Self {
            supported: vec!["v1".to_string()],
            deprecated: Vec::new(),
        }
    }
}

/// Runtime configuration for an IPC server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Explicit socket path or pipe name. Defaults to one derived from the
    /// runtime directory.
    pub address: Option<String>,
    /// Per-user directory for the socket and discovery file.
    pub runtime_dir: Option<PathBuf>,
    /// Write a discovery file on start and remove it on shutdown.
    pub publish_discovery: bool,
    pub max_frame_size: usize,
    pub max_connections: usize,
    pub accept_backlog: u32,
    pub default_request_timeout_ms: u64,
    pub max_request_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    /// Close connections with no inbound frame for this long.
    pub idle_timeout_ms: Option<u64>,
    pub rate_limit: RateLimitConfig,
    pub auth: AuthConfig,
    pub api_versions: ApiVersionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: None,
            runtime_dir: None,
            publish_discovery: true,
            max_frame_size: ProtocolConfig::DEFAULT_MAX_FRAME_SIZE,
            max_connections: 64,
            accept_backlog: 128,
            default_request_timeout_ms: 30_000,
            max_request_timeout_ms: 300_000,
            drain_timeout_ms: 10_000,
            idle_timeout_ms: None,
            rate_limit: RateLimitConfig::default(),
            auth: AuthConfig::default(),
            api_versions: ApiVersionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| IpcError::io_with_path(e, path))?;
        let config: ServerConfig =
            serde_json::from_str(&contents).map_err(|e| IpcError::Config {
                message: format!("Failed to parse {}: {}", path.display(), e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 || self.max_frame_size > ProtocolConfig::MAX_FRAME_CEILING {
            return Err(config_error(format!(
                "max_frame_size must be between 1 and {} bytes",
                ProtocolConfig::MAX_FRAME_CEILING
            )));
        }
        if self.max_connections == 0 {
            return Err(config_error("max_connections must be at least 1"));
        }
        if self.accept_backlog == 0 {
            return Err(config_error("accept_backlog must be at least 1"));
        }
        if self.default_request_timeout_ms == 0
            || self.default_request_timeout_ms > self.max_request_timeout_ms
        {
            return Err(config_error(
                "default_request_timeout_ms must be non-zero and not exceed max_request_timeout_ms",
            ));
        }
        if self.idle_timeout_ms == Some(0) {
            return Err(config_error("idle_timeout_ms must be non-zero when set"));
        }
        if self.rate_limit.enabled {
            if self.rate_limit.requests_per_second == 0 {
                return Err(config_error("rate_limit.requests_per_second must be non-zero"));
            }
            if self.rate_limit.burst < self.rate_limit.requests_per_second {
                return Err(config_error(
                    "rate_limit.burst must be at least requests_per_second",
                ));
            }
        }
        if self.api_versions.supported.is_empty() {
            return Err(config_error("api_versions.supported must not be empty"));
        }
        if let Some(v) = self
            .api_versions
            .deprecated
            .iter()
            .find(|v| !self.api_versions.supported.contains(v))
        {
            return Err(config_error(format!(
                "deprecated API version {} is not in the supported list",
                v
            )));
        }
        Ok(())
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    pub fn max_request_timeout(&self) -> Duration {
        Duration::from_millis(self.max_request_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

fn config_error(message: impl Into<String>) -> IpcError {
    IpcError::Config {
        message: message.into(),
    }
}
