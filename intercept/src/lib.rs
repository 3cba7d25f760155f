//! ocicancel-intercept: module lookup, import-slot rebinding and forced I/O abort.
//!
//! Every raw-memory operation of the workspace lives in this crate. Callers
//! see the [`SymbolPatcher`] capability and the two functions of [`abort`].

pub mod abort;
pub mod module;
pub mod patcher;
pub mod types;

pub use patcher::{NativePatcher, SymbolPatcher};
pub use types::{HookError, ModuleInfo, RawHandle, Rebinding, SlotWrite};

/// Process-global lock for tests that rewrite live import slots.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
