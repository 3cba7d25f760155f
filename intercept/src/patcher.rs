//! The symbol-patching capability, and its native implementation.

use crate::module;
use crate::types::{HookError, ModuleInfo, Rebinding};

/// Rewrites the resolved address of a named import inside one loaded module.
///
/// Implementations hold no per-module state: whatever `install` returns is
/// what the caller hands back to `restore`.
pub trait SymbolPatcher: Send + Sync {
    /// Look up a module that is already loaded. Must not load anything.
    fn find_module(&self, name: &str) -> Option<ModuleInfo>;

    /// First candidate that is currently loaded, in list order.
    fn locate(&self, candidates: &[String]) -> Option<ModuleInfo> {
        candidates.iter().find_map(|name| self.find_module(name))
    }

    /// Redirect every import slot of `symbol` in `module` to `replacement`,
    /// returning the slots written and what each held before.
    ///
    /// # Safety
    /// `replacement` must have the exact signature and ABI of `symbol` and
    /// outlive the patch.
    unsafe fn install(
        &self,
        module: &ModuleInfo,
        symbol: &str,
        replacement: usize,
    ) -> Result<Rebinding, HookError>;

    /// Write back every slot recorded by [`install`](Self::install).
    ///
    /// # Safety
    /// `rebinding` must have come from `install` on this module, which must
    /// still be loaded.
    unsafe fn restore(&self, module: &ModuleInfo, rebinding: &Rebinding) -> Result<(), HookError>;
}

/// Patches the live process: ELF GOT on Linux, Mach-O symbol pointers on
/// macOS, the PE import address table on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePatcher;

impl SymbolPatcher for NativePatcher {
    fn find_module(&self, name: &str) -> Option<ModuleInfo> {
        module::find_module_by_name(name)
    }

    unsafe fn install(
        &self,
        module: &ModuleInfo,
        symbol: &str,
        replacement: usize,
    ) -> Result<Rebinding, HookError> {
        module::rebind_in_module(module, symbol, replacement)
    }

    unsafe fn restore(&self, module: &ModuleInfo, rebinding: &Rebinding) -> Result<(), HookError> {
        module::restore_in_module(module, rebinding)
    }
}
