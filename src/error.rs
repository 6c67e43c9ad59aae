use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Library error type for randofetch operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The fetcher configuration is malformed. Fatal: nothing is probed.
    #[error("invalid fetcher configuration in {}: {reason}", path.display())]
    Configuration { path: PathBuf, reason: String },

    /// The persisted fetcher cache could not be decoded.
    #[error("fetcher cache at {} is unreadable: {reason}", path.display())]
    CacheCorrupt { path: PathBuf, reason: String },

    /// A single probe ran past its hard timeout.
    #[error("probing `{fetcher}` timed out after {timeout:?}")]
    ProbeTimeout { fetcher: String, timeout: Duration },

    /// No fetcher survived discovery, so nothing can be run.
    #[error("no usable fetcher program was found: {hint}")]
    EmptyAcceptedSet { hint: String },

    /// Image library management failed.
    #[error("image library: {0}")]
    Library(String),

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn configuration(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Configuration {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn cache_corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CacheCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
