//! Owns the installed patches for the lifetime of the process (or until
//! teardown).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::{debug, info};
use ocicancel_intercept::{abort, NativePatcher, SymbolPatcher};

use crate::config::Config;
use crate::error::{CancelError, Result};
use crate::patch::{self, InstalledSet};

/// Outcome of [`Manager::ensure_secondary_installed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondaryState {
    /// The secondary replacements are in place, or there is nothing to patch.
    Installed,
    /// The secondary module is not loaded yet; try again on a later call.
    Deferred,
}

#[derive(Default)]
struct Installed {
    primary: Option<InstalledSet>,
    secondary: Option<InstalledSet>,
}

pub struct Manager<P: SymbolPatcher = NativePatcher> {
    patcher: P,
    config: Config,
    installed: Mutex<Installed>,
    secondary_done: AtomicBool,
}

impl<P: SymbolPatcher> Manager<P> {
    pub fn new(patcher: P, config: Config) -> Self {
        Self {
            patcher,
            config,
            installed: Mutex::new(Installed::default()),
            secondary_done: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn patcher(&self) -> &P {
        &self.patcher
    }

    fn lock(&self) -> MutexGuard<'_, Installed> {
        self.installed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Patch the primary module. A no-op once it has succeeded.
    pub fn install_primary(&self) -> Result<()> {
        let mut installed = self.lock();
        if installed.primary.is_some() {
            return Ok(());
        }
        // Resolve the abort primitive now so the first sweep doesn't have to.
        let abortable = abort::is_available();
        debug!("forced interrupt available: {}", abortable);

        let set = patch::install(&self.patcher, &self.config.primary)?;
        info!("primary transport patched in {}", set.module().path);
        installed.primary = Some(set);
        Ok(())
    }

    /// Patch the secondary module if it has been loaded since the last call.
    ///
    /// Cheap once installed: a single atomic load. Fails only when the
    /// module is present but patching it failed (after rollback), or when
    /// the primary was never installed.
    pub fn ensure_secondary_installed(&self) -> Result<SecondaryState> {
        if self.secondary_done.load(Ordering::Acquire) {
            return Ok(SecondaryState::Installed);
        }

        let mut installed = self.lock();
        if installed.primary.is_none() {
            return Err(CancelError::NotInitialized);
        }
        if self.secondary_done.load(Ordering::Acquire) {
            return Ok(SecondaryState::Installed);
        }

        let target = match &self.config.secondary {
            Some(target) => target,
            None => {
                self.secondary_done.store(true, Ordering::Release);
                return Ok(SecondaryState::Installed);
            }
        };
        // Without a way to abort them, tracking local reads is pointless.
        if !abort::is_available() {
            debug!("forced interrupt unavailable; secondary patch deferred");
            return Ok(SecondaryState::Deferred);
        }

        match patch::install(&self.patcher, target) {
            Ok(set) => {
                info!("secondary transport patched in {}", set.module().path);
                installed.secondary = Some(set);
                self.secondary_done.store(true, Ordering::Release);
                Ok(SecondaryState::Installed)
            }
            Err(CancelError::NoModuleFound { .. }) => Ok(SecondaryState::Deferred),
            Err(e) => Err(e),
        }
    }

    /// Restore every original address, secondary first. After this the
    /// manager is back to its freshly constructed state.
    pub fn teardown(&self) -> Result<()> {
        let mut installed = self.lock();
        let secondary = installed.secondary.take();
        let primary = installed.primary.take();
        self.secondary_done.store(false, Ordering::Release);

        let mut result = Ok(());
        for set in secondary.into_iter().chain(primary) {
            let module = set.module().name.clone();
            match set.restore(&self.patcher) {
                Ok(()) => debug!("unpatched {}", module),
                Err(e) if result.is_ok() => result = Err(e),
                Err(_) => {}
            }
        }
        result
    }

    /// File name of the patched primary module.
    pub fn primary_module(&self) -> Option<String> {
        self.lock().primary.as_ref().map(|set| set.module().name.clone())
    }

    pub fn secondary_installed(&self) -> bool {
        self.secondary_done.load(Ordering::Acquire)
    }
}
