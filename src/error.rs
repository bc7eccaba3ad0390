use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// An error that happens while reading, writing, or converting cache files.
///
/// None of these are fatal: every operation in this crate can be recovered
/// from at the call site by treating it as a cache miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A file could not be read, written, or deleted.
    ///
    /// Carries the operation that failed, the path it failed on, and the
    /// underlying OS error.
    #[error("failed to {op} `{}`", .path.display())]
    Io {
        /// Short verb describing the failed operation, e.g. `"read"`.
        op: &'static str,
        /// The file or directory the operation was performed on.
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Cache file bytes could not be decoded into a value, or a value could
    /// not be encoded into bytes.
    #[error("codec error: {0}")]
    Codec(String),

    /// The cache was configured incorrectly.
    ///
    /// Note that using the same cache name for two simultaneously active
    /// caches is *not* detected at runtime; avoiding that is a caller
    /// obligation.
    #[error("invalid cache configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Attaches operation and path context to an [`io::Error`].
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Whether this error is a plain "file does not exist".
    ///
    /// Missing files are the normal course of business for a cache and are
    /// treated as misses rather than failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound
        )
    }
}

/// Result alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;
