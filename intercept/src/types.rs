use thiserror::Error;

/// Raw OS value identifying the object a blocking call waits on.
///
/// A file descriptor on Unix; a `SOCKET` or `HANDLE` widened to `usize` on Windows.
#[cfg(unix)]
pub type RawHandle = libc::c_int;

/// Raw OS value identifying the object a blocking call waits on.
///
/// A file descriptor on Unix; a `SOCKET` or `HANDLE` widened to `usize` on Windows.
#[cfg(windows)]
pub type RawHandle = usize;

#[cfg(not(any(unix, windows)))]
pub type RawHandle = isize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("module {0} is not loaded")]
    ModuleNotLoaded(String),

    #[error("no import slot for {symbol} in {module}")]
    SymbolNotFound { module: String, symbol: String },

    #[error("cannot make import slot writable (os error {errno})")]
    ProtectFailed { errno: i32 },

    #[error("module {0} has no parseable linkage metadata")]
    InvalidImage(String),

    #[error("name contains an interior NUL byte")]
    InvalidName,

    #[error("symbol rebinding is not supported on this platform")]
    Unsupported,
}

/// One import slot written by a rebind and the value it held before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotWrite {
    pub slot: usize,
    pub previous: usize,
}

/// Every slot one rebind wrote, in write order.
///
/// A module can hold several slots for the same symbol (a PLT slot and a
/// GOT data slot under lazy binding) with different values, so undoing a
/// rebind writes each slot's own previous value back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rebinding {
    slots: Vec<SlotWrite>,
}

impl Rebinding {
    pub fn new(slots: Vec<SlotWrite>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[SlotWrite] {
        &self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Value the first written slot held.
    pub fn original(&self) -> Option<usize> {
        self.slots.first().map(|w| w.previous)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub size: usize,
}

impl ModuleInfo {
    /// True when `candidate` names this module, either by file name or by a path suffix.
    pub fn matches(&self, candidate: &str) -> bool {
        if self.name == candidate {
            return true;
        }
        let sep = if cfg!(windows) { '\\' } else { '/' };
        self.path
            .strip_suffix(candidate)
            .is_some_and(|prefix| prefix.ends_with(sep) || prefix.ends_with('/'))
    }
}
