use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Default value for [`CacheConfig::max_age`]: 36 hours.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(36 * 60 * 60);

/// Per-instance configuration of a [`FilesystemCache`](crate::FilesystemCache).
///
/// All caches sharing a `cache_dir` store their files in per-name
/// subdirectories, plus a common `tmp` directory used to stage writes so
/// that files appear in the cache directory atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory under which all caches store their files.
    pub cache_dir: PathBuf,

    /// Name of this cache.
    ///
    /// Used as the subdirectory for this cache's files. Must be a safe path
    /// segment, and must be unique among simultaneously active caches
    /// sharing a `cache_dir` — two caches with the same name will clobber
    /// each other's files.
    pub name: String,

    /// Maximum age of files in the cache.
    ///
    /// Files whose modification time is older than this are treated as
    /// absent by lookups and become eligible for removal by the purge sweep.
    #[serde(with = "humantime_serde", default = "default_max_age")]
    pub max_age: Duration,

    /// When set, the cache will not clear its memory tier in response to
    /// notifications from a memory-pressure monitor.
    #[serde(default)]
    pub ignore_memory_pressure: bool,
}

fn default_max_age() -> Duration {
    DEFAULT_MAX_AGE
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            name: name.into(),
            max_age: DEFAULT_MAX_AGE,
            ignore_memory_pressure: false,
        }
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn ignore_memory_pressure(mut self, ignore: bool) -> Self {
        self.ignore_memory_pressure = ignore;
        self
    }

    /// The directory this cache's files live in.
    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.join(&self.name)
    }

    /// The directory used for staging temporary files.
    ///
    /// This is a sibling of the per-name cache directories so that a staged
    /// file can be atomically renamed into place.
    pub fn tmp_path(&self) -> PathBuf {
        self.cache_dir.join("tmp")
    }

    /// Checks that the cache name is usable as a path segment.
    pub fn validate(&self) -> CacheResult<()> {
        if self.name.is_empty() {
            return Err(CacheError::Config("cache name must not be empty".into()));
        }
        // Guard against "..", absolute paths, and ":" (not a threat on POSIX
        // filesystems, but confuses OS X Finder). "tmp" is reserved for the
        // staging directory.
        if self.name.contains(['.', '/', '\\', ':']) || self.name == "tmp" {
            return Err(CacheError::Config(format!(
                "cache name `{}` is not a safe path segment",
                self.name
            )));
        }
        Ok(())
    }
}

/// Whether the file at `path` should still be served, judged by its age.
///
/// Files without readable metadata are reported to the caller; a missing
/// file is an `Err` here and is turned into a miss further up.
pub(crate) fn is_fresh(path: &Path, max_age: Duration) -> std::io::Result<bool> {
    // Age is judged by `mtime`. Creation timestamps are missing on older
    // kernels and some filesystems, and access times are commonly disabled
    // at mount time, which leaves the modification time as the one
    // attribute that can be counted on everywhere.
    let mtime = path.metadata()?.modified()?;
    let age = mtime.elapsed().unwrap_or_default();
    Ok(age <= max_age)
}
