//! Replacement functions installed into the vendor library.
//!
//! Each one has the exact signature of the primitive it stands in for. It
//! registers its handle, calls the real primitive through this crate's own
//! (unpatched) import, unregisters, and returns the result untouched. An
//! abort issued by [`crate::interrupt_all`] surfaces as whatever error or
//! end-of-file the platform reports; nothing here translates it.
//!
//! Unregistering takes the registry lock, which can clobber the thread's
//! error code, so the code left by the real call is saved and put back.

use crate::patch::Replacement;
use crate::registry;

#[cfg(unix)]
pub use self::unix::*;

#[cfg(windows)]
pub use self::windows::*;

#[cfg(unix)]
mod unix {
    use super::*;
    use libc::{c_int, c_void, size_t, ssize_t};

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn errno_location() -> *mut c_int {
        libc::__errno_location()
    }

    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe fn errno_location() -> *mut c_int {
        libc::__error()
    }

    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    unsafe fn errno_location() -> *mut c_int {
        libc::__errno()
    }

    /// Stands in for `read(2)`, which the client uses for both TCP and
    /// local connections.
    ///
    /// # Safety
    /// Same contract as `read(2)`.
    pub unsafe extern "C" fn hook_read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
        let tracked = registry::global().track(fd);
        let rv = libc::read(fd, buf, count);
        let errno = *errno_location();
        drop(tracked);
        *errno_location() = errno;
        rv
    }

    pub fn primary_replacements() -> Vec<Replacement> {
        // SAFETY: hook_read has read's signature and C ABI.
        vec![unsafe { Replacement::new("read", hook_read as usize) }]
    }

    pub fn secondary_replacements() -> Vec<Replacement> {
        Vec::new()
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use ocicancel_intercept::RawHandle;
    use windows_sys::Win32::Foundation::{GetLastError, SetLastError, BOOL, HANDLE};
    use windows_sys::Win32::Networking::WinSock::{
        WSARecv, LPWSAOVERLAPPED_COMPLETION_ROUTINE, SOCKET, WSABUF,
    };
    use windows_sys::Win32::Storage::FileSystem::ReadFile;
    use windows_sys::Win32::System::IO::OVERLAPPED;

    /// Stands in for `WSARecv`, used by TCP connections.
    ///
    /// # Safety
    /// Same contract as `WSARecv`.
    pub unsafe extern "system" fn hook_wsa_recv(
        s: SOCKET,
        buffers: *const WSABUF,
        buffer_count: u32,
        received: *mut u32,
        flags: *mut u32,
        overlapped: *mut OVERLAPPED,
        completion: LPWSAOVERLAPPED_COMPLETION_ROUTINE,
    ) -> i32 {
        let tracked = registry::global().track(s as RawHandle);
        let rv = WSARecv(s, buffers, buffer_count, received, flags, overlapped, completion);
        let error = GetLastError();
        drop(tracked);
        SetLastError(error);
        rv
    }

    /// Stands in for `ReadFile`, used by local (bequeath) connections.
    ///
    /// # Safety
    /// Same contract as `ReadFile`.
    pub unsafe extern "system" fn hook_read_file(
        file: HANDLE,
        buffer: *mut u8,
        to_read: u32,
        read: *mut u32,
        overlapped: *mut OVERLAPPED,
    ) -> BOOL {
        let tracked = registry::global().track(file as RawHandle);
        let rv = ReadFile(file, buffer, to_read, read, overlapped);
        let error = GetLastError();
        drop(tracked);
        SetLastError(error);
        rv
    }

    pub fn primary_replacements() -> Vec<Replacement> {
        // SAFETY: hook_wsa_recv has WSARecv's signature and stdcall ABI.
        vec![unsafe { Replacement::new("WSARecv", hook_wsa_recv as usize) }]
    }

    pub fn secondary_replacements() -> Vec<Replacement> {
        // SAFETY: hook_read_file has ReadFile's signature and stdcall ABI.
        vec![unsafe { Replacement::new("ReadFile", hook_read_file as usize) }]
    }
}

#[cfg(not(any(unix, windows)))]
pub fn primary_replacements() -> Vec<Replacement> {
    Vec::new()
}

#[cfg(not(any(unix, windows)))]
pub fn secondary_replacements() -> Vec<Replacement> {
    Vec::new()
}
