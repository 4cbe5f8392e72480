//! Process identity and liveness.
//!
//! Used by the peer identity resolver (who is on the other end of a
//! connection) and by discovery (is the server named in a discovery file
//! still running).

use crate::error::Result;
use crate::peer::UserId;
use std::path::PathBuf;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

/// Name and executable of a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescription {
    pub name: String,
    pub executable: Option<PathBuf>,
}

/// Effective user identity of the current process.
///
/// # Platform Behavior
/// - **Linux/macOS**: effective uid via `geteuid`
/// - **Windows**: string SID of the process token's user
pub fn current_user() -> Result<UserId> {
    #[cfg(unix)]
    {
        Ok(UserId::from_uid(nix::unistd::Uid::effective().as_raw()))
    }

    #[cfg(windows)]
    {
        super::windows::current_user_sid().map(UserId::from_sid)
    }
}

/// Look up the name and executable path of a process.
///
/// Returns `None` if the process has exited or cannot be inspected.
pub fn describe_process(pid: u32) -> Option<ProcessDescription> {
    let sysinfo_pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sysinfo_pid]),
        true,
        ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
    );

    let process = system.process(sysinfo_pid)?;
    let description = ProcessDescription {
        name: process.name().to_string_lossy().into_owned(),
        executable: process.exe().map(|p| p.to_path_buf()),
    };
    debug!("Resolved process {} as {:?}", pid, description.name);
    Some(description)
}

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: `kill(pid, 0)`; `EPERM` still means the process exists
/// - **Windows**: `OpenProcess` with `PROCESS_QUERY_LIMITED_INFORMATION`
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(NixPid::from_raw(raw), None::<Signal>) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        super::windows::is_process_alive(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_absurd_pid_is_not_alive() {
        assert!(!is_process_alive(u32::MAX));
    }

    #[test]
    fn test_describe_current_process() {
        let description = describe_process(std::process::id()).expect("self should be visible");
        assert!(!description.name.is_empty());
    }

    #[test]
    fn test_current_user_is_stable() {
        assert_eq!(current_user().unwrap(), current_user().unwrap());
    }
}
