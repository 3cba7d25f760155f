//! Forced abort of a pending blocking call, issued from another thread.
//!
//! Nothing here allocates or takes a lock once [`is_available`] has run,
//! so the sweep can call [`forced_interrupt`] while holding the registry
//! lock, including from a signal-handling thread.

use crate::types::RawHandle;

/// Whether the platform offers an abort primitive at all.
///
/// Always true on Unix. On Windows this resolves `CancelIoEx` from
/// kernel32 on first use and caches the result.
pub fn is_available() -> bool {
    imp::is_available()
}

/// Ask the OS to abort whatever is blocked on `handle`.
///
/// Returns whether the request was accepted. Acceptance does not mean the
/// blocked call has returned yet.
pub fn forced_interrupt(handle: RawHandle) -> bool {
    imp::forced_interrupt(handle)
}

#[cfg(unix)]
mod imp {
    use crate::types::RawHandle;

    pub fn is_available() -> bool {
        true
    }

    // Shutting the socket down both ways wakes a reader blocked in
    // read()/recv() with end-of-file or an error.
    pub fn forced_interrupt(handle: RawHandle) -> bool {
        unsafe { libc::shutdown(handle, libc::SHUT_RDWR) == 0 }
    }
}

#[cfg(windows)]
mod imp {
    use crate::types::RawHandle;
    use core::ffi::c_void;
    use std::sync::OnceLock;
    use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};

    type CancelIoExFn = unsafe extern "system" fn(*mut c_void, *const c_void) -> i32;

    static CANCEL_IO_EX: OnceLock<Option<CancelIoExFn>> = OnceLock::new();

    fn cancel_io_ex() -> Option<CancelIoExFn> {
        *CANCEL_IO_EX.get_or_init(|| unsafe {
            let kernel32 = GetModuleHandleA(b"kernel32.dll\0".as_ptr());
            if kernel32.is_null() {
                return None;
            }
            GetProcAddress(kernel32, b"CancelIoEx\0".as_ptr())
                .map(|f| core::mem::transmute::<_, CancelIoExFn>(f))
        })
    }

    pub fn is_available() -> bool {
        cancel_io_ex().is_some()
    }

    // CancelIoEx also cancels a WSARecv pending on the same socket handle.
    pub fn forced_interrupt(handle: RawHandle) -> bool {
        match cancel_io_ex() {
            Some(cancel) => unsafe { cancel(handle as *mut c_void, core::ptr::null()) != 0 },
            None => false,
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod imp {
    use crate::types::RawHandle;

    pub fn is_available() -> bool {
        false
    }

    pub fn forced_interrupt(_handle: RawHandle) -> bool {
        false
    }
}
