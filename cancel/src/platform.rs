//! Vendor library file names, per platform.
//!
//! These lists are an ABI contract with the client library distribution:
//! names must match exactly, newest version first.

/// Shared library file extension for the current platform.
pub const LIB_EXTENSION: &str = if cfg!(target_os = "macos") {
    "dylib"
} else if cfg!(windows) {
    "dll"
} else {
    "so"
};

/// Modules providing the network transport, tried in order.
#[cfg(not(windows))]
pub fn primary_candidates() -> Vec<String> {
    ["12.1", "11.1", "10.1", "9.0"]
        .iter()
        .map(|version| format!("libclntsh.{LIB_EXTENSION}.{version}"))
        .collect()
}

/// Modules providing the network transport, tried in order.
#[cfg(windows)]
pub fn primary_candidates() -> Vec<String> {
    [
        // full client
        "orantcp12.dll",
        "orantcp11.dll",
        "orantcp10.dll",
        "orantcp9.dll",
        // instant client basic
        "oraociei12.dll",
        "oraociei11.dll",
        "oraociei10.dll",
        // instant client basic lite
        "oraociicus12.dll",
        "oraociicus11.dll",
        "oraociicus10.dll",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

/// Modules providing the local (bequeath) transport. The client loads them
/// on the first local connection, never at start-up.
#[cfg(windows)]
pub fn secondary_candidates() -> Vec<String> {
    ["oranbeq12.dll", "oranbeq11.dll", "oranbeq10.dll", "oranbeq9.dll"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

/// Local connections reuse the primary module's `read` off Windows.
#[cfg(not(windows))]
pub fn secondary_candidates() -> Vec<String> {
    Vec::new()
}
