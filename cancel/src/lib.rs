//! Cooperative cancellation of blocking reads inside the Oracle client
//! library.
//!
//! [`init`] redirects the client's imports of its receive primitive to
//! wrappers that record which handle each thread is blocked on. A timeout
//! policy living elsewhere calls [`interrupt_all`] to abort every recorded
//! call; the client then sees an ordinary I/O error or end-of-file and
//! unwinds by itself.
//!
//! ```no_run
//! ocicancel::init()?;
//! // before each local (bequeath) connection attempt:
//! ocicancel::ensure_secondary_installed()?;
//! // from a watchdog thread:
//! let aborted = ocicancel::interrupt_all();
//! # let _ = aborted;
//! # Ok::<(), ocicancel::CancelError>(())
//! ```

pub mod config;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod patch;
pub mod platform;
pub mod registry;

#[cfg(test)]
mod test_utils;

use std::sync::{Mutex, MutexGuard};

use log::debug;
use ocicancel_intercept::{abort, RawHandle};

pub use crate::config::Config;
pub use crate::error::{CancelError, Result};
pub use crate::manager::{Manager, SecondaryState};
pub use crate::patch::{PatchTarget, Replacement};
pub use crate::registry::{Registry, Tracked};
pub use ocicancel_intercept::{HookError, ModuleInfo, NativePatcher, Rebinding, SlotWrite, SymbolPatcher};

static MANAGER: Mutex<Option<Manager>> = Mutex::new(None);

fn manager() -> MutexGuard<'static, Option<Manager>> {
    MANAGER.lock().unwrap_or_else(|e| e.into_inner())
}

/// Patch the primary module using the platform defaults, adjusted by
/// [`config::PRIMARY_MODULES_ENV`] and [`config::SECONDARY_MODULES_ENV`].
///
/// Does nothing if already initialized.
pub fn init() -> Result<()> {
    let mut slot = manager();
    if slot.is_some() {
        debug!("already initialized");
        return Ok(());
    }
    install(&mut slot, Config::from_env()?)
}

/// Like [`init`] with an explicit configuration.
pub fn init_with(config: Config) -> Result<()> {
    let mut slot = manager();
    if slot.is_some() {
        debug!("already initialized");
        return Ok(());
    }
    install(&mut slot, config)
}

fn install(slot: &mut Option<Manager>, config: Config) -> Result<()> {
    let manager = Manager::new(NativePatcher, config);
    manager.install_primary()?;
    *slot = Some(manager);
    Ok(())
}

/// Patch the secondary module if it has been loaded. Safe and cheap to
/// call before every connection attempt.
pub fn ensure_secondary_installed() -> Result<SecondaryState> {
    match manager().as_ref() {
        Some(manager) => manager.ensure_secondary_installed(),
        None => Err(CancelError::NotInitialized),
    }
}

/// Abort every call currently blocked in a wrapper or inside a [`track`]
/// guard. Returns the number of abort requests issued.
///
/// Returns as soon as the requests are issued; the aborted calls come back
/// on their own threads. Neither allocates nor logs, and is a no-op when
/// nothing is blocked.
pub fn interrupt_all() -> usize {
    registry::global().for_each_and_interrupt(|handle| {
        abort::forced_interrupt(handle);
    })
}

/// Restore every patched import. [`init`] may be called again afterwards.
///
/// Calls already inside a wrapper finish normally.
pub fn teardown() -> Result<()> {
    match manager().take() {
        Some(manager) => manager.teardown(),
        None => Ok(()),
    }
}

/// Make a blocking operation the caller performs itself interruptible by
/// [`interrupt_all`] for as long as the guard lives.
pub fn track(handle: RawHandle) -> Tracked<'static> {
    registry::global().track(handle)
}

/// Number of handles currently tracked.
pub fn active_count() -> usize {
    registry::global().len()
}

/// File name of the patched primary module, once initialized.
pub fn primary_module() -> Option<String> {
    manager().as_ref().and_then(Manager::primary_module)
}

/// Whether [`ensure_secondary_installed`] has finished its work: the
/// secondary module is patched, or the platform has none.
pub fn secondary_installed() -> bool {
    manager()
        .as_ref()
        .map_or(false, Manager::secondary_installed)
}
