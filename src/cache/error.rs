use std::{io, path::PathBuf};

use thiserror::Error;

/// Failures raised by the page cache and its filesystem store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The origin generator is not configured; nothing can be served.
    #[error("origin is not configured: {message}")]
    Configuration { message: String },
    /// The cache root or an entry's parent directory could not be created.
    #[error("cache storage unavailable at `{}`: {source}", path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Directory creation succeeded but writing the entry failed.
    #[error("failed to write cache entry `{}`: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to purge cache entry `{}`: {source}", path.display())]
    PurgeFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid cache key `{key}`: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("failed to encode cache entry `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn storage_unavailable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::StorageUnavailable {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write_failed(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::WriteFailed {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_key(key: &str, reason: &'static str) -> Self {
        Self::InvalidKey {
            key: key.to_string(),
            reason,
        }
    }

    /// Short label used for log fields and metric tags.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::StorageUnavailable { .. } => "storage_unavailable",
            Self::WriteFailed { .. } => "write_failed",
            Self::PurgeFailed { .. } => "purge_failed",
            Self::InvalidKey { .. } => "invalid_key",
            Self::Encode { .. } => "encode",
        }
    }
}
