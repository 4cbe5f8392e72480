//! Windows security primitives for the named-pipe backend.
//!
//! This module owns the Win32 FFI boundary: token user SIDs, process
//! liveness, and the security descriptor that restricts a pipe to the user
//! running the server.
#![allow(unsafe_code)]

use crate::error::{IpcError, Result};
use std::ffi::c_void;
use std::io;
use windows_sys::Win32::Foundation::{CloseHandle, LocalFree, HANDLE};
use windows_sys::Win32::Security::Authorization::{
    ConvertSidToStringSidW, ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows_sys::Win32::Security::{
    GetTokenInformation, TokenUser, SECURITY_ATTRIBUTES, TOKEN_QUERY, TOKEN_USER,
};
use windows_sys::Win32::System::Pipes::GetNamedPipeClientProcessId;
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, OpenProcess, OpenProcessToken, PROCESS_QUERY_LIMITED_INFORMATION,
};

/// Closes a Win32 handle on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: the handle was returned open by a successful Win32 call
            // and is closed exactly once here.
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

/// String SID of the user owning the current process.
pub(crate) fn current_user_sid() -> Result<String> {
    // SAFETY: GetCurrentProcess returns a pseudo-handle that needs no closing.
    let process = unsafe { GetCurrentProcess() };
    token_user_sid(process).map_err(IpcError::from)
}

/// String SID of the user owning process `pid`.
pub(crate) fn process_user_sid(pid: u32) -> io::Result<String> {
    // SAFETY: OpenProcess has no memory-safety preconditions; a null return
    // is handled below.
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle.is_null() {
        return Err(io::Error::last_os_error());
    }
    let process = OwnedHandle(handle);
    token_user_sid(process.0)
}

pub(crate) fn is_process_alive(pid: u32) -> bool {
    // SAFETY: see process_user_sid.
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle.is_null() {
        return false;
    }
    drop(OwnedHandle(handle));
    true
}

/// Process id of the client connected to a server pipe instance.
pub(crate) fn pipe_client_pid(pipe: HANDLE) -> io::Result<u32> {
    let mut pid: u32 = 0;
    // SAFETY: `pipe` is a live server pipe handle borrowed from tokio's
    // NamedPipeServer and `pid` is a valid out pointer.
    let ok = unsafe { GetNamedPipeClientProcessId(pipe, &mut pid) };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pid)
}

fn token_user_sid(process: HANDLE) -> io::Result<String> {
    let mut raw_token: HANDLE = std::ptr::null_mut();
    // SAFETY: `process` is a valid process handle and `raw_token` a valid out pointer.
    if unsafe { OpenProcessToken(process, TOKEN_QUERY, &mut raw_token) } == 0 {
        return Err(io::Error::last_os_error());
    }
    let token = OwnedHandle(raw_token);

    let mut needed: u32 = 0;
    // SAFETY: size query with a null buffer; expected to fail with
    // ERROR_INSUFFICIENT_BUFFER and fill `needed`.
    unsafe {
        GetTokenInformation(token.0, TokenUser, std::ptr::null_mut(), 0, &mut needed);
    }
    if needed == 0 {
        return Err(io::Error::last_os_error());
    }

    // u64 storage keeps TOKEN_USER suitably aligned.
    let mut buffer = vec![0u64; (needed as usize).div_ceil(8)];
    // SAFETY: `buffer` holds at least `needed` writable bytes.
    let ok = unsafe {
        GetTokenInformation(
            token.0,
            TokenUser,
            buffer.as_mut_ptr().cast::<c_void>(),
            needed,
            &mut needed,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: GetTokenInformation(TokenUser) wrote a TOKEN_USER at the start
    // of the aligned buffer, which outlives this borrow.
    let token_user = unsafe { &*buffer.as_ptr().cast::<TOKEN_USER>() };

    let mut sid_string: *mut u16 = std::ptr::null_mut();
    // SAFETY: the SID pointer references memory inside `buffer`; the output
    // string is allocated by the system and freed with LocalFree below.
    if unsafe { ConvertSidToStringSidW(token_user.User.Sid, &mut sid_string) } == 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `sid_string` is a NUL-terminated wide string from the call above.
    let sid = unsafe { wide_to_string(sid_string) };
    // SAFETY: allocated by ConvertSidToStringSidW with LocalAlloc.
    unsafe {
        LocalFree(sid_string.cast::<c_void>());
    }
    Ok(sid)
}

/// Read a NUL-terminated UTF-16 string.
///
/// # Safety
/// `ptr` must point to a valid NUL-terminated wide string.
unsafe fn wide_to_string(ptr: *const u16) -> String {
    let mut len = 0;
    // SAFETY: guaranteed NUL-terminated by the caller.
    while unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    // SAFETY: `len` elements were just read successfully.
    let slice = unsafe { std::slice::from_raw_parts(ptr, len) };
    String::from_utf16_lossy(slice)
}

/// Security attributes granting pipe access to a single user SID only.
///
/// The DACL is protected (`P`) so nothing is inherited, and contains one ACE
/// giving `GENERIC_ALL` to the server's own user.
pub(crate) struct PipeSecurity {
    descriptor: *mut c_void,
    attributes: SECURITY_ATTRIBUTES,
}

// SAFETY: the descriptor is immutable after construction and only read by
// CreateNamedPipeW.
unsafe impl Send for PipeSecurity {}
// SAFETY: see Send.
unsafe impl Sync for PipeSecurity {}

impl PipeSecurity {
    pub(crate) fn for_user(sid: &str) -> Result<Self> {
        let sddl = format!("D:P(A;;GA;;;{})", sid);
        let wide: Vec<u16> = sddl.encode_utf16().chain(std::iter::once(0)).collect();
        let mut descriptor: *mut c_void = std::ptr::null_mut();
        // SAFETY: `wide` is NUL-terminated and `descriptor` is a valid out
        // pointer; the descriptor is freed in Drop.
        let ok = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                wide.as_ptr(),
                SDDL_REVISION_1,
                &mut descriptor,
                std::ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Self {
            descriptor,
            attributes: SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor,
                bInheritHandle: 0,
            },
        })
    }

    /// Pointer suitable for `ServerOptions::create_with_security_attributes_raw`.
    pub(crate) fn as_raw(&self) -> *mut c_void {
        (&self.attributes as *const SECURITY_ATTRIBUTES).cast_mut().cast::<c_void>()
    }
}

impl Drop for PipeSecurity {
    fn drop(&mut self) {
        // SAFETY: allocated by ConvertStringSecurityDescriptorToSecurityDescriptorW.
        unsafe {
            LocalFree(self.descriptor);
        }
    }
}
