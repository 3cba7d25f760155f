#[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
use crate::types::{HookError, ModuleInfo, Rebinding};

/// Set to print raw backend diagnostics to stderr.
pub const HOOK_DEBUG_ENV: &str = "OCICANCEL_HOOK_DEBUG";

#[cfg(target_os = "macos")]
mod darwin;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(windows)]
mod windows;

#[cfg(target_os = "macos")]
pub use darwin::*;

#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(windows)]
pub use self::windows::*;

#[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
pub fn find_module_by_name(_name: &str) -> Option<ModuleInfo> {
    None
}

/// # Safety
/// Never touches memory on this platform.
#[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
pub unsafe fn rebind_in_module(
    _module: &ModuleInfo,
    _symbol: &str,
    _replacement: usize,
) -> Result<Rebinding, HookError> {
    Err(HookError::Unsupported)
}

/// # Safety
/// Never touches memory on this platform.
#[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
pub unsafe fn restore_in_module(_module: &ModuleInfo, _rebinding: &Rebinding) -> Result<(), HookError> {
    Err(HookError::Unsupported)
}
