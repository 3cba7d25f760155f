//! Shared test utilities for the cancel crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use ocicancel_intercept::{HookError, ModuleInfo, Rebinding, SlotWrite, SymbolPatcher};

/// Route `log` output through the test harness's captured stdout.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Process-global lock for tests that use the global registry or manager.
pub fn lock_hook_tests() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory stand-in for a process's import tables.
///
/// Modules are "loaded" explicitly; each owns a list of import slots. A
/// symbol listed twice gets two slots, which may hold different values.
#[derive(Default)]
pub struct FakePatcher {
    loaded: Mutex<Vec<String>>,
    cells: Mutex<Vec<Cell>>,
    fail_on: Mutex<Option<String>>,
    installs: AtomicUsize,
}

struct Cell {
    module: String,
    symbol: String,
    value: usize,
}

impl FakePatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, module: &str, imports: &[(&str, usize)]) {
        self.loaded.lock().unwrap().push(module.to_string());
        let mut cells = self.cells.lock().unwrap();
        for &(symbol, value) in imports {
            cells.push(Cell {
                module: module.to_string(),
                symbol: symbol.to_string(),
                value,
            });
        }
    }

    /// Make every install of `symbol` fail as if the module did not import it.
    pub fn fail_on(&self, symbol: &str) {
        *self.fail_on.lock().unwrap() = Some(symbol.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    /// Value of the first slot for `symbol` in `module`.
    pub fn slot(&self, module: &str, symbol: &str) -> Option<usize> {
        self.slots(module, symbol).first().copied()
    }

    /// Values of every slot for `symbol` in `module`, in load order.
    pub fn slots(&self, module: &str, symbol: &str) -> Vec<usize> {
        self.cells
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.module == module && c.symbol == symbol)
            .map(|c| c.value)
            .collect()
    }

    /// Successful `install` calls so far; `restore` is not counted.
    pub fn install_calls(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

impl SymbolPatcher for FakePatcher {
    fn find_module(&self, name: &str) -> Option<ModuleInfo> {
        let loaded = self.loaded.lock().unwrap();
        let index = loaded.iter().position(|m| m == name)?;
        Some(ModuleInfo {
            name: name.to_string(),
            path: format!("/fake/lib/{name}"),
            base_address: 0x1000 * (index + 1),
            size: 0x1000,
        })
    }

    unsafe fn install(
        &self,
        module: &ModuleInfo,
        symbol: &str,
        replacement: usize,
    ) -> Result<Rebinding, HookError> {
        let not_found = || HookError::SymbolNotFound {
            module: module.name.clone(),
            symbol: symbol.to_string(),
        };
        if self.fail_on.lock().unwrap().as_deref() == Some(symbol) {
            return Err(not_found());
        }
        let mut cells = self.cells.lock().unwrap();
        let writes: Vec<SlotWrite> = cells
            .iter_mut()
            .enumerate()
            .filter(|(_, c)| c.module == module.name && c.symbol == symbol)
            .map(|(slot, c)| SlotWrite {
                slot,
                previous: std::mem::replace(&mut c.value, replacement),
            })
            .collect();
        if writes.is_empty() {
            return Err(not_found());
        }
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(Rebinding::new(writes))
    }

    unsafe fn restore(&self, module: &ModuleInfo, rebinding: &Rebinding) -> Result<(), HookError> {
        let mut cells = self.cells.lock().unwrap();
        for write in rebinding.slots().iter().rev() {
            match cells.get_mut(write.slot) {
                Some(cell) if cell.module == module.name => cell.value = write.previous,
                _ => return Err(HookError::ModuleNotLoaded(module.name.clone())),
            }
        }
        Ok(())
    }
}
