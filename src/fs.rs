use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tempfile::NamedTempFile;

use crate::codec::PersistenceCodec;
use crate::config::{CacheConfig, is_fresh};
use crate::delegate::CacheDelegate;
use crate::error::{CacheError, CacheResult};
use crate::memory::MemoryCache;
use crate::pressure::MemoryPressureMonitor;
use crate::queue::TaskQueues;

/// An object cache spanning an in-memory tier and a filesystem tier.
///
/// Lookups check the memory tier first and fall back to the cache's
/// directory on disk, decoding the file through the configured
/// [`PersistenceCodec`] and re-promoting the value into memory. Stores
/// populate the memory tier immediately and enqueue the disk write on the
/// shared write queue, so [`store_object`](Self::store_object) never blocks
/// the caller on disk I/O.
///
/// Files older than the configured `max_age` are treated as absent by every
/// lookup; they stay on disk until a purge sweep
/// ([`purge_out_of_date_cache_files`](Self::purge_out_of_date_cache_files))
/// reaps them.
///
/// The [`CacheDelegate`] derives filenames from keys and may veto admission
/// to either tier per value. Two active caches must never share a name
/// under the same cache root; the resulting file collisions are not
/// detected.
pub struct FilesystemCache<K, V, D, C = crate::codec::IdentityCodec> {
    config: CacheConfig,
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
    delegate: Arc<D>,
    codec: Arc<C>,
    memory: Arc<MemoryCache<K, V>>,
    queues: TaskQueues,
    write_states: Arc<Mutex<FxHashMap<PathBuf, Arc<PathWrites>>>>,
}

/// Write bookkeeping for one cache file path.
///
/// `latest` counts the stores and deletes submitted for the path, in the
/// order the calling threads issue them. Each queued write remembers the
/// count at submission time and only touches the disk while it is still
/// the newest; a write that finds itself superseded under the lock skips,
/// so the last submitted operation wins regardless of the order the
/// runtime happens to schedule the tasks in. The mutex keeps the file
/// operations of concurrently scheduled tasks from interleaving.
#[derive(Default)]
struct PathWrites {
    lock: tokio::sync::Mutex<()>,
    latest: AtomicU64,
}

impl<K, V, D, C> FilesystemCache<K, V, D, C>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    D: CacheDelegate<K, V>,
    C: PersistenceCodec<V>,
{
    /// Creates a cache, creating its directory on disk if necessary.
    ///
    /// The cache registers with `monitor` (unless configured to ignore
    /// memory pressure) and clears its memory tier on every notification;
    /// the registration is dropped together with the cache.
    pub fn new(
        config: CacheConfig,
        delegate: D,
        codec: C,
        queues: &TaskQueues,
        monitor: Option<&MemoryPressureMonitor>,
    ) -> CacheResult<Self> {
        config.validate()?;

        let cache_dir = config.cache_path();
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| CacheError::io("create cache directory", &cache_dir, e))?;

        let memory = match monitor {
            Some(monitor) if !config.ignore_memory_pressure => {
                MemoryCache::with_pressure_monitor(monitor)
            }
            _ => MemoryCache::new(),
        };

        Ok(Self {
            tmp_dir: config.tmp_path(),
            cache_dir,
            config,
            delegate: Arc::new(delegate),
            codec: Arc::new(codec),
            memory: Arc::new(memory),
            queues: queues.clone(),
            write_states: Default::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The directory this cache's files are stored in.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The read/write queue pair this cache dispatches disk I/O on.
    pub fn queues(&self) -> &TaskQueues {
        &self.queues
    }

    /// The file the value for `key` is (or would be) stored in.
    pub fn file_path_for_key(&self, key: &K) -> PathBuf {
        let filename = self.delegate.filename(key);
        self.cache_dir
            .join(format!("{filename}.{}", self.delegate.file_extension()))
    }

    /// Whether `key` has a value in either tier.
    pub fn contains_key(&self, key: &K) -> bool {
        self.is_key_in_memory_cache(key) || self.is_key_in_filesystem_cache(key)
    }

    pub fn is_key_in_memory_cache(&self, key: &K) -> bool {
        self.memory.contains(key)
    }

    /// Whether a non-expired file exists for `key`.
    ///
    /// This only inspects file metadata; it does not read or decode the
    /// file. I/O failures count as "not in cache".
    pub fn is_key_in_filesystem_cache(&self, key: &K) -> bool {
        let path = self.file_path_for_key(key);
        match catch_not_found(|| is_fresh(&path, self.config.max_age)) {
            Ok(fresh) => fresh.unwrap_or(false),
            Err(e) => {
                tracing::trace!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to stat cache file",
                );
                false
            }
        }
    }

    /// Memory-tier-only lookup. Never touches disk.
    pub fn object_for_key_in_memory(&self, key: &K) -> Option<V> {
        self.memory.get(key)
    }

    /// Filesystem-tier-only lookup.
    ///
    /// Bypasses the memory tier in both directions: the memory tier is not
    /// consulted, and the decoded value is not promoted into it. Reads and
    /// decodes synchronously on the calling thread.
    pub fn object_for_key_on_disk(&self, key: &K) -> CacheResult<Option<V>> {
        let path = self.file_path_for_key(key);
        match self.read_fresh(&path)? {
            Some(bytes) => self.codec.decode(bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Looks up the value for `key`, spanning both tiers.
    ///
    /// On a memory miss this reads and decodes the cache file synchronously
    /// on the calling thread. Any failure along the way degrades to a miss;
    /// use [`try_object_for_key`](Self::try_object_for_key) to observe the
    /// error instead.
    pub fn object_for_key(&self, key: &K) -> Option<V> {
        self.try_object_for_key(key).unwrap_or_else(|e| {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                cache = %self.config.name,
                "Treating failed cache read as a miss",
            );
            None
        })
    }

    /// Like [`object_for_key`](Self::object_for_key), but surfaces read and
    /// decode failures to the caller.
    ///
    /// An expired file is a plain miss (`Ok(None)`), not an error.
    pub fn try_object_for_key(&self, key: &K) -> CacheResult<Option<V>> {
        if let Some(value) = self.memory.get(key) {
            return Ok(Some(value));
        }

        let path = self.file_path_for_key(key);
        let Some(bytes) = self.read_fresh(&path)? else {
            return Ok(None);
        };

        let value = self.codec.decode(bytes)?;
        if self.delegate.should_store_in_memory(&value, key) {
            self.memory.set(key.clone(), value.clone());
        }
        Ok(Some(value))
    }

    /// Asynchronous lookup; the disk read runs on the read queue.
    ///
    /// The calling task suspends until the read completes; completion is
    /// delivered to whatever executor the caller is running on. Decoding
    /// and memory promotion behave exactly like
    /// [`try_object_for_key`](Self::try_object_for_key).
    pub async fn object_for_key_async(&self, key: &K) -> CacheResult<Option<V>> {
        if let Some(value) = self.memory.get(key) {
            return Ok(Some(value));
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit_read(key.clone(), move |result| {
            // The receiver may have gone away; that only means nobody is
            // interested in the result anymore.
            let _ = tx.send(result);
        });

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CacheError::io(
                "read",
                self.file_path_for_key(key),
                io::Error::other("cache read task dropped"),
            )),
        }
    }

    /// Asynchronous lookup with callback delivery.
    ///
    /// The read is dispatched through the read queue and `callback` is
    /// invoked on the queue worker once the read finishes, succeeds or
    /// fails. Callers that need completion on a particular executor should
    /// forward from the callback (or use
    /// [`object_for_key_async`](Self::object_for_key_async) and await from
    /// that executor).
    pub fn read_object_for_key(
        &self,
        key: K,
        callback: impl FnOnce(CacheResult<Option<V>>) + Send + 'static,
    ) {
        if let Some(value) = self.memory.get(&key) {
            callback(Ok(Some(value)));
            return;
        }
        self.submit_read(key, callback);
    }

    fn submit_read(&self, key: K, callback: impl FnOnce(CacheResult<Option<V>>) + Send + 'static) {
        let path = self.file_path_for_key(&key);
        let max_age = self.config.max_age;
        let codec = Arc::clone(&self.codec);
        let delegate = Arc::clone(&self.delegate);
        let memory = Arc::clone(&self.memory);

        self.queues.read.submit(async move {
            let result = read_and_decode(&path, max_age, &*codec).await;
            if let Ok(Some(value)) = &result {
                if delegate.should_store_in_memory(value, &key) {
                    memory.set(key, value.clone());
                }
            }
            callback(result);
        });
    }

    /// Stores `value` under `key` in both tiers.
    ///
    /// The memory tier is populated immediately; the disk write is staged
    /// as a temp file and enqueued on the write queue, so this call never
    /// blocks on disk I/O. Each tier is gated by its own delegate admission
    /// predicate, so a value may end up memory-only, disk-only, in both
    /// tiers, or in neither.
    ///
    /// Encoding failures are logged and drop the disk copy; use
    /// [`try_store_object`](Self::try_store_object) to observe them.
    pub fn store_object(&self, key: K, value: V) {
        if let Err(e) = self.try_store_object(key, value) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                cache = %self.config.name,
                "Failed to encode value for filesystem cache",
            );
        }
    }

    /// Like [`store_object`](Self::store_object), but surfaces encoding
    /// failures.
    ///
    /// Once this returns `Ok`, a disk-admitted value is guaranteed to be
    /// eventually persisted (absent process crash) unless a newer store or
    /// delete for the same key supersedes it: write tasks are not
    /// cancellable, but a superseded write skips its disk access, so the
    /// last operation submitted for a key wins on disk.
    pub fn try_store_object(&self, key: K, value: V) -> CacheResult<()> {
        if self.delegate.should_store_in_memory(&value, &key) {
            self.memory.set(key.clone(), value.clone());
        }

        if !self.delegate.should_store_on_disk(&value, &key) {
            return Ok(());
        }

        // Encode on the calling thread so the bytes reflect the value as it
        // was at the time of the call.
        let bytes = self.codec.encode(&value)?;
        self.submit_write(self.file_path_for_key(&key), bytes);
        Ok(())
    }

    /// Enqueues an atomic write of `bytes` to `path` on the write queue.
    ///
    /// The sequence number is taken on the calling thread, so "newest" is
    /// decided by submission order, not by when the runtime polls the task.
    fn submit_write(&self, path: PathBuf, bytes: Vec<u8>) {
        let writes = self.write_state_for(&path);
        let seq = writes.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let tmp_dir = self.tmp_dir.clone();

        self.queues.write.submit(async move {
            let _guard = writes.lock.lock().await;
            if writes.latest.load(Ordering::SeqCst) != seq {
                tracing::trace!(path = %path.display(), "Skipping superseded cache write");
                return;
            }
            if let Err(e) = write_atomically(&tmp_dir, &path, &bytes) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to write cache file",
                );
                return;
            }
            tracing::trace!(path = %path.display(), bytes = bytes.len(), "Wrote cache file");

            // A newer store or delete was submitted while this write was in
            // flight; its outcome has to win, so take this write back out.
            // A newer store has not run yet (it needs the lock) and will
            // recreate the file.
            if writes.latest.load(Ordering::SeqCst) != seq {
                if let Err(e) = catch_not_found(|| std::fs::remove_file(&path)) {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Failed to undo superseded cache write",
                    );
                }
            }
        });
    }

    /// Stores `value` in the memory tier only, bypassing the admission
    /// predicate and the filesystem tier entirely.
    pub fn store_object_in_memory(&self, key: K, value: V) {
        self.memory.set(key, value);
    }

    /// Stores `value` in the filesystem tier only.
    ///
    /// The memory tier is left alone and the disk admission predicate is
    /// not consulted. The write itself behaves like
    /// [`store_object`](Self::store_object): encoded eagerly, persisted
    /// asynchronously.
    pub fn store_object_on_disk(&self, key: &K, value: &V) -> CacheResult<()> {
        let bytes = self.codec.encode(value)?;
        self.submit_write(self.file_path_for_key(key), bytes);
        Ok(())
    }

    /// Removes the value for `key` from the memory tier only. Any cache
    /// file stays in place.
    pub fn remove_object_from_memory(&self, key: &K) {
        self.memory.remove(key);
    }

    /// Removes the value for `key` from both tiers.
    ///
    /// The cache file is atomically moved out of the cache directory on the
    /// calling thread, so concurrent lookups observe it as already gone;
    /// the moved file is deleted asynchronously on the write queue. Writes
    /// for `key` still sitting in the write queue are superseded and will
    /// not resurrect the file.
    pub fn remove_object(&self, key: &K) {
        self.memory.remove(key);

        let path = self.file_path_for_key(key);
        // The delete is the newest operation for this path; bumping the
        // sequence makes every still-pending write for it a no-op.
        self.write_state_for(&path)
            .latest
            .fetch_add(1, Ordering::SeqCst);

        let Some(doomed) = self.stage_for_deletion(&path) else {
            return;
        };

        self.queues.write.submit(async move {
            if let Err(e) = tokio::fs::remove_file(&doomed).await {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %doomed.display(),
                    "Failed to delete staged cache file",
                );
            }
        });
    }

    /// Moves `path` to a unique name in the tmp directory, returning the
    /// new location, or `None` if the file did not exist (or could not be
    /// moved, which is logged and then treated like a missing file).
    fn stage_for_deletion(&self, path: &Path) -> Option<PathBuf> {
        static STAGED: AtomicU64 = AtomicU64::new(0);

        let doomed = self.tmp_dir.join(format!(
            "del-{}-{}",
            std::process::id(),
            STAGED.fetch_add(1, Ordering::Relaxed)
        ));

        let moved = catch_not_found(|| {
            std::fs::create_dir_all(&self.tmp_dir)?;
            std::fs::rename(path, &doomed)
        });
        match moved {
            Ok(Some(())) => Some(doomed),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to stage cache file for deletion",
                );
                None
            }
        }
    }

    /// Empties the memory tier. Disk files are untouched.
    pub fn clear_memory_cache(&self) {
        self.memory.clear();
    }

    /// Deletes every file in the cache's directory. The memory tier is
    /// untouched, so values can remain reachable in memory until the next
    /// memory clear.
    pub fn clear_filesystem_cache(&self) -> CacheResult<()> {
        let entries = std::fs::read_dir(&self.cache_dir)
            .map_err(|e| CacheError::io("read cache directory", &self.cache_dir, e))?;

        for entry in entries {
            let path = entry
                .map_err(|e| CacheError::io("read cache directory", &self.cache_dir, e))?
                .path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            // A concurrent delete winning the race is fine.
            if let Err(e) = removed {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(CacheError::io("delete", path, e));
                }
            }
        }
        Ok(())
    }

    /// Deletes every cache file older than the configured `max_age`.
    pub fn purge_out_of_date_cache_files(&self) -> CacheResult<PurgeStats> {
        self.purge_cache_files_older_than(self.config.max_age)
    }

    /// Deletes every cache file older than `age`, leaving younger files
    /// untouched. Running the sweep twice in a row removes nothing new.
    ///
    /// The memory tier is not consulted or modified: a value whose backing
    /// file is purged stays reachable in memory until the next memory
    /// clear.
    pub fn purge_cache_files_older_than(&self, age: Duration) -> CacheResult<PurgeStats> {
        tracing::info!(cache = %self.config.name, "Purging cache files older than {age:?}");

        let mut stats = PurgeStats::default();
        self.purge_directory_recursive(&self.cache_dir, age, &mut stats)?;

        tracing::info!(
            cache = %self.config.name,
            "Purge complete: retained {} files ({} bytes), removed {} files ({} bytes)",
            stats.retained_files,
            stats.retained_bytes,
            stats.removed_files,
            stats.removed_bytes,
        );
        Ok(stats)
    }

    /// Purges `directory`, returning `true` if it is empty afterwards.
    fn purge_directory_recursive(
        &self,
        directory: &Path,
        age: Duration,
        stats: &mut PurgeStats,
    ) -> CacheResult<bool> {
        let entries = catch_not_found(|| std::fs::read_dir(directory))
            .map_err(|e| CacheError::io("read cache directory", directory, e))?;
        let Some(entries) = entries else {
            tracing::warn!("Cache directory not found: `{}`", directory.display());
            return Ok(true);
        };
        tracing::debug!("Purging directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry
                .map_err(|e| CacheError::io("read cache directory", directory, e))?
                .path();
            if path.is_dir() {
                let mut dir_is_empty = self.purge_directory_recursive(&path, age, stats)?;
                if dir_is_empty {
                    if let Err(e) = std::fs::remove_dir(&path) {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to remove empty cache directory",
                        );
                        dir_is_empty = false;
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_purge_file(&path, age, stats) {
                    Ok(file_removed) => is_empty &= file_removed,
                    Err(e) => {
                        // Attempt the rest of the sweep regardless.
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to purge cache file",
                        );
                        is_empty = false;
                    }
                }
            }
        }

        Ok(is_empty)
    }

    /// Purges the file at `path` if it is older than `age`, returning
    /// `true` if it was removed.
    fn try_purge_file(&self, path: &Path, age: Duration, stats: &mut PurgeStats) -> CacheResult<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let map_err = |e| CacheError::io("stat", path, e);

        let Some(metadata) = catch_not_found(|| path.metadata()).map_err(map_err)? else {
            return Ok(true);
        };
        let size = metadata.len();

        let fresh = catch_not_found(|| is_fresh(path, age)).map_err(map_err)?;
        if !fresh.unwrap_or(false) {
            tracing::debug!("Removing file `{}`", path.display());
            catch_not_found(|| std::fs::remove_file(path))
                .map_err(|e| CacheError::io("delete", path, e))?;

            stats.removed_files += 1;
            stats.removed_bytes += size;
            return Ok(true);
        }

        stats.retained_files += 1;
        stats.retained_bytes += size;
        Ok(false)
    }

    /// Waits until every disk write and delete submitted so far has
    /// finished. Useful before process shutdown and in tests.
    pub async fn flush_pending_writes(&self) {
        self.queues.write.flush().await;
    }

    fn read_fresh(&self, path: &Path) -> CacheResult<Option<Vec<u8>>> {
        let fresh = catch_not_found(|| is_fresh(path, self.config.max_age))
            .map_err(|e| CacheError::io("stat", path, e))?;
        match fresh {
            Some(true) => {}
            // Stale files are left in place for the purge sweep.
            Some(false) => {
                tracing::trace!(path = %path.display(), "Cache file expired");
                return Ok(None);
            }
            None => return Ok(None),
        }

        // The file may have been purged between the freshness check and the
        // read; that window is a plain miss.
        catch_not_found(|| std::fs::read(path)).map_err(|e| CacheError::io("read", path, e))
    }

    fn write_state_for(&self, path: &Path) -> Arc<PathWrites> {
        let mut states = self.write_states.lock().unwrap();
        // Drop entries nothing holds anymore so the map doesn't grow with
        // the key domain.
        if states.len() > 1024 {
            states.retain(|_, state| Arc::strong_count(state) > 1);
        }
        Arc::clone(states.entry(path.to_path_buf()).or_default())
    }
}

impl<K, V, D, C> std::fmt::Debug for FilesystemCache<K, V, D, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemCache")
            .field("name", &self.config.name)
            .field("cache_dir", &self.cache_dir)
            .field("memory", &self.memory)
            .field("queues", &self.queues)
            .finish()
    }
}

/// Counts of what a purge sweep removed and what it left in place.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// Reads and decodes the cache file at `path` on the read queue's worker.
async fn read_and_decode<V, C: PersistenceCodec<V>>(
    path: &Path,
    max_age: Duration,
    codec: &C,
) -> CacheResult<Option<V>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io("stat", path, e)),
    };
    let mtime = metadata
        .modified()
        .map_err(|e| CacheError::io("stat", path, e))?;
    if mtime.elapsed().unwrap_or_default() > max_age {
        tracing::trace!(path = %path.display(), "Cache file expired");
        return Ok(None);
    }

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io("read", path, e)),
    };

    codec.decode(bytes).map(Some)
}

/// Stages `bytes` as a temp file and atomically moves it into place.
///
/// The purge sweep can remove the directories we are operating in, so the
/// filesystem operations are retried once after re-creating them.
fn write_atomically(tmp_dir: &Path, path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let parent = path.parent().ok_or_else(|| {
        CacheError::io(
            "write",
            path,
            io::Error::other("cache path has no parent directory"),
        )
    })?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        let attempt = (|| {
            std::fs::create_dir_all(tmp_dir)?;
            std::fs::create_dir_all(parent)?;

            let mut temp_file = NamedTempFile::new_in(tmp_dir)?;
            io::Write::write_all(&mut temp_file, bytes)?;
            temp_file
                .persist(path)
                .map_err(|e| e.error)
                .map(|_file| ())
        })();

        match attempt {
            Ok(()) => return Ok(()),
            Err(e) => {
                if retries > MAX_RETRIES {
                    return Err(CacheError::io("write", path, e));
                }
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Retrying cache file write",
                );
            }
        }
    }
}

pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
