//! Transactional installation of a replacement set into one module.

use log::{debug, info, warn};
use ocicancel_intercept::{ModuleInfo, Rebinding, SymbolPatcher};

use crate::error::{CancelError, Result};

/// One import to redirect: the symbol name and the function replacing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    symbol: String,
    address: usize,
}

impl Replacement {
    /// # Safety
    /// `address` must be a function with the exact signature and ABI of
    /// `symbol`, valid for the life of the process.
    pub unsafe fn new(symbol: impl Into<String>, address: usize) -> Self {
        Self {
            symbol: symbol.into(),
            address,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn address(&self) -> usize {
        self.address
    }
}

/// Where to patch and what with: module file names in preference order and
/// the replacements to apply to whichever of them is loaded first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
    pub candidates: Vec<String>,
    pub replacements: Vec<Replacement>,
}

impl PatchTarget {
    pub fn new(candidates: Vec<String>, replacements: Vec<Replacement>) -> Self {
        Self {
            candidates,
            replacements,
        }
    }
}

/// A replacement set that took effect, and the slot values it displaced.
#[derive(Debug)]
pub struct InstalledSet {
    module: ModuleInfo,
    originals: Vec<(String, Rebinding)>,
}

impl InstalledSet {
    pub fn module(&self) -> &ModuleInfo {
        &self.module
    }

    /// Address `symbol` resolved to before it was replaced, as held by its
    /// first import slot.
    pub fn original(&self, symbol: &str) -> Option<usize> {
        self.rebinding(symbol).and_then(Rebinding::original)
    }

    /// Every slot written for `symbol`, with its previous value.
    pub fn rebinding(&self, symbol: &str) -> Option<&Rebinding> {
        self.originals
            .iter()
            .find(|(name, _)| name == symbol)
            .map(|(_, rebinding)| rebinding)
    }

    /// Put every displaced slot value back, newest first. Keeps going past
    /// a failure and reports the first one.
    pub fn restore<P: SymbolPatcher + ?Sized>(self, patcher: &P) -> Result<()> {
        let mut first_err = None;
        for (symbol, rebinding) in self.originals.iter().rev() {
            // SAFETY: `rebinding` is what the patcher returned for this module.
            if let Err(source) = unsafe { patcher.restore(&self.module, rebinding) } {
                warn!("restoring {} in {} failed: {}", symbol, self.module.name, source);
                first_err.get_or_insert(CancelError::RestoreFailed {
                    module: self.module.name.clone(),
                    symbol: symbol.clone(),
                    source,
                });
            }
        }
        debug!("restored {} import(s) in {}", self.originals.len(), self.module.name);
        first_err.map_or(Ok(()), Err)
    }
}

/// Apply `target` to the first of its candidates that is loaded.
///
/// Either every replacement takes effect or none does: when one fails, the
/// ones already applied to the module are reverted before the error is
/// returned. A failure is never retried against a later candidate.
pub fn install<P: SymbolPatcher + ?Sized>(patcher: &P, target: &PatchTarget) -> Result<InstalledSet> {
    let module = patcher
        .locate(&target.candidates)
        .ok_or_else(|| CancelError::NoModuleFound {
            candidates: target.candidates.clone(),
        })?;
    debug!(
        "installing {} replacement(s) into {}",
        target.replacements.len(),
        module.path
    );

    let mut originals: Vec<(String, Rebinding)> = Vec::with_capacity(target.replacements.len());
    for replacement in &target.replacements {
        // SAFETY: `Replacement::new` requires a matching function.
        match unsafe { patcher.install(&module, &replacement.symbol, replacement.address) } {
            Ok(original) => originals.push((replacement.symbol.clone(), original)),
            Err(source) => {
                warn!(
                    "could not replace {} in {}: {}; rolling back {} replacement(s)",
                    replacement.symbol,
                    module.name,
                    source,
                    originals.len()
                );
                rollback(patcher, &module, &originals);
                return Err(CancelError::PatchFailed {
                    module: module.name.clone(),
                    symbol: replacement.symbol.clone(),
                    source,
                });
            }
        }
    }

    info!(
        "hooked [{}] in {}",
        target
            .replacements
            .iter()
            .map(Replacement::symbol)
            .collect::<Vec<_>>()
            .join(", "),
        module.path
    );
    Ok(InstalledSet { module, originals })
}

fn rollback<P: SymbolPatcher + ?Sized>(patcher: &P, module: &ModuleInfo, applied: &[(String, Rebinding)]) {
    for (symbol, rebinding) in applied.iter().rev() {
        // SAFETY: `rebinding` is what the patcher returned for this module.
        if let Err(e) = unsafe { patcher.restore(module, rebinding) } {
            warn!("rollback of {} in {} failed: {}", symbol, module.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_logging, FakePatcher};
    use ocicancel_intercept::HookError;

    fn replacements(symbols: &[(&str, usize)]) -> Vec<Replacement> {
        symbols
            .iter()
            .map(|&(symbol, address)| unsafe { Replacement::new(symbol, address) })
            .collect()
    }

    fn target(candidates: &[&str], symbols: &[(&str, usize)]) -> PatchTarget {
        PatchTarget::new(
            candidates.iter().map(|c| c.to_string()).collect(),
            replacements(symbols),
        )
    }

    #[test]
    fn installs_every_replacement_and_records_originals() {
        init_logging();
        let patcher = FakePatcher::new();
        patcher.load("libclntsh.so.12.1", &[("read", 0x100), ("recv", 0x200)]);

        let set = install(
            &patcher,
            &target(&["libclntsh.so.12.1"], &[("read", 0xa00), ("recv", 0xb00)]),
        )
        .expect("install");

        assert_eq!(set.module().name, "libclntsh.so.12.1");
        assert_eq!(set.original("read"), Some(0x100));
        assert_eq!(set.original("recv"), Some(0x200));
        assert_eq!(patcher.slot("libclntsh.so.12.1", "read"), Some(0xa00));
        assert_eq!(patcher.slot("libclntsh.so.12.1", "recv"), Some(0xb00));

        set.restore(&patcher).expect("restore");
        assert_eq!(patcher.slot("libclntsh.so.12.1", "read"), Some(0x100));
        assert_eq!(patcher.slot("libclntsh.so.12.1", "recv"), Some(0x200));
    }

    #[test]
    fn no_loaded_candidate_is_not_found() {
        let patcher = FakePatcher::new();
        patcher.load("libunrelated.so", &[("read", 0x100)]);

        let err = install(
            &patcher,
            &target(&["libclntsh.so.12.1", "libclntsh.so.11.1"], &[("read", 0xa00)]),
        )
        .unwrap_err();

        match err {
            CancelError::NoModuleFound { candidates } => {
                assert_eq!(candidates, vec!["libclntsh.so.12.1", "libclntsh.so.11.1"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(patcher.install_calls(), 0);
    }

    #[test]
    fn earlier_candidate_wins_when_both_are_loaded() {
        let patcher = FakePatcher::new();
        patcher.load("libclntsh.so.11.1", &[("read", 0x110)]);
        patcher.load("libclntsh.so.12.1", &[("read", 0x120)]);

        let set = install(
            &patcher,
            &target(&["libclntsh.so.12.1", "libclntsh.so.11.1"], &[("read", 0xa00)]),
        )
        .expect("install");

        assert_eq!(set.module().name, "libclntsh.so.12.1");
        assert_eq!(patcher.slot("libclntsh.so.12.1", "read"), Some(0xa00));
        assert_eq!(patcher.slot("libclntsh.so.11.1", "read"), Some(0x110));
    }

    #[test]
    fn failure_at_kth_symbol_rolls_back_earlier_ones() {
        init_logging();
        let patcher = FakePatcher::new();
        patcher.load(
            "libclntsh.so.12.1",
            &[("read", 0x100), ("recv", 0x200), ("readv", 0x300), ("recvmsg", 0x400)],
        );
        patcher.fail_on("readv");

        let err = install(
            &patcher,
            &target(
                &["libclntsh.so.12.1"],
                &[("read", 0xa00), ("recv", 0xb00), ("readv", 0xc00), ("recvmsg", 0xd00)],
            ),
        )
        .unwrap_err();

        match &err {
            CancelError::PatchFailed { module, symbol, .. } => {
                assert_eq!(module, "libclntsh.so.12.1");
                assert_eq!(symbol, "readv");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "could not replace function readv in libclntsh.so.12.1: \
             no import slot for readv in libclntsh.so.12.1"
        );
        for (symbol, original) in [("read", 0x100), ("recv", 0x200), ("readv", 0x300), ("recvmsg", 0x400)] {
            assert_eq!(patcher.slot("libclntsh.so.12.1", symbol), Some(original), "{symbol}");
        }

        // A clean retry starts from the unpatched module.
        patcher.clear_failure();
        let set = install(
            &patcher,
            &target(&["libclntsh.so.12.1"], &[("read", 0xa00), ("recv", 0xb00)]),
        )
        .expect("retry");
        assert_eq!(set.original("read"), Some(0x100));
        assert_eq!(set.original("recv"), Some(0x200));
    }

    #[test]
    fn rollback_restores_each_slot_of_a_symbol_to_its_own_value() {
        let patcher = FakePatcher::new();
        // PLT slot still on the lazy stub, GOT data slot already resolved.
        patcher.load(
            "libclntsh.so.12.1",
            &[("read", 0x5a00), ("read", 0x7f00), ("recv", 0x200)],
        );
        patcher.fail_on("recv");

        install(
            &patcher,
            &target(&["libclntsh.so.12.1"], &[("read", 0xa00), ("recv", 0xb00)]),
        )
        .unwrap_err();

        assert_eq!(patcher.slots("libclntsh.so.12.1", "read"), vec![0x5a00, 0x7f00]);
    }

    #[test]
    fn restore_after_install_keeps_distinct_slot_values() {
        let patcher = FakePatcher::new();
        patcher.load("libclntsh.so.12.1", &[("read", 0x5a00), ("read", 0x7f00)]);

        let set = install(&patcher, &target(&["libclntsh.so.12.1"], &[("read", 0xa00)]))
            .expect("install");
        assert_eq!(patcher.slots("libclntsh.so.12.1", "read"), vec![0xa00, 0xa00]);
        assert_eq!(set.rebinding("read").map(|r| r.slots().len()), Some(2));
        assert_eq!(set.original("read"), Some(0x5a00));

        set.restore(&patcher).expect("restore");
        assert_eq!(patcher.slots("libclntsh.so.12.1", "read"), vec![0x5a00, 0x7f00]);
    }

    #[test]
    fn partial_failure_is_not_retried_on_later_candidate() {
        let patcher = FakePatcher::new();
        patcher.load("libclntsh.so.12.1", &[("read", 0x120)]);
        patcher.load("libclntsh.so.11.1", &[("read", 0x110), ("recv", 0x210)]);

        let err = install(
            &patcher,
            &target(
                &["libclntsh.so.12.1", "libclntsh.so.11.1"],
                &[("read", 0xa00), ("recv", 0xb00)],
            ),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            CancelError::PatchFailed { ref module, ref symbol, source: HookError::SymbolNotFound { .. } }
                if module == "libclntsh.so.12.1" && symbol == "recv"
        ));
        assert_eq!(patcher.slot("libclntsh.so.12.1", "read"), Some(0x120));
        assert_eq!(patcher.slot("libclntsh.so.11.1", "read"), Some(0x110));
        assert_eq!(patcher.slot("libclntsh.so.11.1", "recv"), Some(0x210));
    }
}
