//! What to patch: candidate module lists and the replacement sets.

use crate::error::{CancelError, Result};
use crate::hooks;
use crate::patch::PatchTarget;
use crate::platform;

/// Overrides the primary candidate list (comma-separated file names).
pub const PRIMARY_MODULES_ENV: &str = "OCICANCEL_PRIMARY_MODULES";
/// Overrides the secondary candidate list (comma-separated file names).
pub const SECONDARY_MODULES_ENV: &str = "OCICANCEL_SECONDARY_MODULES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Patched at initialization.
    pub primary: PatchTarget,
    /// Patched lazily, once its module shows up. `None` where the platform
    /// has no separate local transport.
    pub secondary: Option<PatchTarget>,
}

impl Config {
    /// Candidate lists and wrappers compiled in for this platform.
    pub fn platform_default() -> Self {
        let secondary = hooks::secondary_replacements();
        Self {
            primary: PatchTarget::new(platform::primary_candidates(), hooks::primary_replacements()),
            secondary: if secondary.is_empty() {
                None
            } else {
                Some(PatchTarget::new(platform::secondary_candidates(), secondary))
            },
        }
    }

    /// Platform defaults with candidate lists overridden from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::platform_default();

        if let Some(value) = lookup(PRIMARY_MODULES_ENV) {
            config.primary.candidates = parse_candidates(PRIMARY_MODULES_ENV, &value)?;
        }
        if let Some(value) = lookup(SECONDARY_MODULES_ENV) {
            let candidates = parse_candidates(SECONDARY_MODULES_ENV, &value)?;
            match config.secondary.as_mut() {
                Some(secondary) => secondary.candidates = candidates,
                None => {
                    return Err(CancelError::Config(format!(
                        "{SECONDARY_MODULES_ENV} is set but this platform has no secondary module"
                    )))
                }
            }
        }
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::platform_default()
    }
}

fn parse_candidates(key: &str, value: &str) -> Result<Vec<String>> {
    let candidates: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect();
    if candidates.is_empty() {
        return Err(CancelError::Config(format!("{key} lists no module names")));
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::platform_default());
        assert_eq!(config.primary.candidates, platform::primary_candidates());
        assert!(!config.primary.replacements.is_empty());
    }

    #[test]
    fn primary_override_is_trimmed_and_ordered() {
        let config =
            Config::from_lookup(lookup(&[(PRIMARY_MODULES_ENV, " liba.so , ,libb.so")])).unwrap();
        assert_eq!(config.primary.candidates, vec!["liba.so", "libb.so"]);
        // Symbols always come from the compiled wrappers.
        assert_eq!(config.primary.replacements, hooks::primary_replacements());
    }

    #[test]
    fn empty_override_is_rejected() {
        let err = Config::from_lookup(lookup(&[(PRIMARY_MODULES_ENV, " , ")])).unwrap_err();
        assert!(matches!(err, CancelError::Config(_)), "{err:?}");
        assert!(err.to_string().contains(PRIMARY_MODULES_ENV));
    }

    #[cfg(not(windows))]
    #[test]
    fn secondary_override_needs_a_secondary_module() {
        assert!(Config::platform_default().secondary.is_none());
        let err =
            Config::from_lookup(lookup(&[(SECONDARY_MODULES_ENV, "libnbeq.so")])).unwrap_err();
        assert!(matches!(err, CancelError::Config(_)), "{err:?}");
    }

    #[cfg(windows)]
    #[test]
    fn secondary_override_replaces_candidates() {
        let config =
            Config::from_lookup(lookup(&[(SECONDARY_MODULES_ENV, "custombeq.dll")])).unwrap();
        let secondary = config.secondary.expect("windows has a secondary");
        assert_eq!(secondary.candidates, vec!["custombeq.dll"]);
        assert_eq!(secondary.replacements[0].symbol(), "ReadFile");
    }
}
