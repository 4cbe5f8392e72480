//! Platform abstraction layer for cross-platform compatibility.
//!
//! All `#[cfg]` blocks for OS-specific behavior outside the transport
//! backends live here: runtime directory layout, owner-only permissions,
//! process identity and liveness.
//!
//! # Supported Platforms
//!
//! - **Linux / macOS**: Unix domain sockets, `SO_PEERCRED` / `LOCAL_PEERCRED`
//! - **Windows**: named pipes with a same-user DACL

pub mod paths;
pub mod permissions;
pub mod process;
#[cfg(windows)]
pub(crate) mod windows;

pub use paths::{default_address, discovery_path, ensure_runtime_dir, runtime_dir};
pub use permissions::{set_private, set_private_dir};
pub use process::{current_user, describe_process, is_process_alive, ProcessDescription};

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        "unknown"
    }
}
