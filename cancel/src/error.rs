use ocicancel_intercept::HookError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("no module to hook is loaded (tried: {})", .candidates.join(", "))]
    NoModuleFound { candidates: Vec<String> },

    #[error("could not replace function {symbol} in {module}: {source}")]
    PatchFailed {
        module: String,
        symbol: String,
        #[source]
        source: HookError,
    },

    #[error("could not restore function {symbol} in {module}: {source}")]
    RestoreFailed {
        module: String,
        symbol: String,
        #[source]
        source: HookError,
    },

    #[error("cancellation hooks are not initialized")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CancelError>;
