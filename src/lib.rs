//! # tiercache
//!
//! A two-tier object cache: a thread-safe in-memory tier layered over a
//! filesystem-backed persistence tier, with the disk I/O mediated by a pair
//! of bounded-concurrency task queues.
//!
//! ## Cache tiers
//!
//! A [`FilesystemCache`] spans two tiers:
//!
//! - The **memory tier** ([`MemoryCache`]) is a synchronized key → value
//!   mapping. Entries never expire from memory on their own; the tier is
//!   emptied only by an explicit clear or by a memory-pressure
//!   notification.
//! - The **filesystem tier** stores one file per key in the cache's
//!   dedicated directory, named by the delegate's key → filename mapping
//!   and containing the codec-encoded bytes of the value. Files whose
//!   modification time is older than the configured `max_age` (36 hours by
//!   default) are treated as absent and are reaped by the purge sweep.
//!
//! A lookup goes through the following steps:
//! - First, it checks the memory tier.
//! - On miss, it derives the file path from the key and checks the disk
//!   tier. A present, non-expired file is read and decoded, the value is
//!   promoted back into the memory tier (subject to the delegate's memory
//!   admission predicate), and returned.
//! - A failed read or decode is reported as a miss; the error is available
//!   through the `try_` lookup variants for callers that want it.
//!
//! A store populates the memory tier immediately and enqueues the disk
//! write on the write queue; it never blocks the caller on disk I/O. Each
//! tier is gated independently by a delegate admission predicate, so any
//! combination of memory-only, disk-only, both, or neither is possible for
//! a given value.
//!
//! ## Task queues
//!
//! Two long-lived [`TaskQueue`]s back all disk I/O: one for reads, one for
//! writes, kept separate so a backlog on either side cannot starve the
//! other. They are constructed once at process startup ([`TaskQueues`])
//! and passed into each cache instance. Stores and deletes for the same
//! key are sequenced at submission time, so whichever operation was
//! submitted last wins on disk no matter how the runtime schedules the
//! queued tasks; a superseded write simply skips its disk access.
//!
//! ## Delegate and codec
//!
//! Each cache is customized by a [`CacheDelegate`], which must supply the
//! key → filename mapping and may override the per-tier admission
//! predicates, and a [`PersistenceCodec`] converting values to and from
//! file bytes. Caches holding raw bytes (`Vec<u8>`) can use the built-in
//! [`IdentityCodec`] and skip the conversion entirely.
//!
//! ## Errors
//!
//! All failures are [`CacheError`]s: I/O failures (with path and OS error
//! attached), codec failures, and configuration errors. Nothing here is
//! fatal — every failure is recoverable at the call site by treating the
//! operation as a cache miss, and that is exactly what the non-`try`
//! lookup methods do, logging the error via `tracing`.
//!
//! ## Example
//!
//! ```no_run
//! use tiercache::{CacheConfig, CacheDelegate, FilesystemCache, IdentityCodec, TaskQueues};
//!
//! struct Thumbnails;
//!
//! impl CacheDelegate<String, Vec<u8>> for Thumbnails {
//!     fn filename(&self, key: &String) -> String {
//!         key.clone()
//!     }
//! }
//!
//! # #[tokio::main] async fn main() -> Result<(), tiercache::CacheError> {
//! let queues = TaskQueues::default();
//! let config = CacheConfig::new("/var/cache/app", "thumbnails");
//! let cache = FilesystemCache::new(config, Thumbnails, IdentityCodec, &queues, None)?;
//!
//! cache.store_object("a".to_owned(), vec![1, 2, 3]);
//! assert_eq!(cache.object_for_key(&"a".to_owned()), Some(vec![1, 2, 3]));
//! # Ok(()) }
//! ```

mod codec;
mod config;
mod delegate;
mod error;
mod fs;
mod memory;
mod pressure;
mod queue;
#[cfg(test)]
mod tests;

pub use codec::{IdentityCodec, PersistenceCodec};
pub use config::{CacheConfig, DEFAULT_MAX_AGE};
pub use delegate::CacheDelegate;
pub use error::{CacheError, CacheResult};
pub use fs::{FilesystemCache, PurgeStats};
pub use memory::MemoryCache;
pub use pressure::{MemoryPressureMonitor, PressureSubscription};
pub use queue::{TaskQueue, TaskQueues};
