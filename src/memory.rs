use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;

use crate::pressure::{MemoryPressureMonitor, PressureSubscription};

/// A synchronized in-memory key → value mapping shared among threads.
///
/// All lookups and mutations go through a single mutex, which establishes
/// the usual happens-after ordering: a `set` on one thread is observable to
/// subsequent `get`s on any other. The lock is only ever held for the
/// duration of a single map operation, or for the lifetime of an explicit
/// [`lock`](Self::lock) guard when a caller batches several operations
/// atomically.
///
/// Values never expire from the memory tier on their own; eviction happens
/// only through [`clear`](Self::clear), either explicit or triggered by a
/// [`MemoryPressureMonitor`] notification.
pub struct MemoryCache<K, V> {
    map: Arc<Mutex<FxHashMap<K, V>>>,
    // Held so the monitor stops calling us when the cache goes away.
    _pressure: Option<PressureSubscription>,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    /// Creates a cache that is not hooked up to a memory-pressure source.
    pub fn new() -> Self {
        Self {
            map: Default::default(),
            _pressure: None,
        }
    }

    /// Creates a cache that clears itself whenever `monitor` notifies.
    pub fn with_pressure_monitor(monitor: &MemoryPressureMonitor) -> Self {
        let map: Arc<Mutex<FxHashMap<K, V>>> = Default::default();

        let weak = Arc::downgrade(&map);
        let subscription = monitor.subscribe(move || {
            if let Some(map) = weak.upgrade() {
                let mut map = map.lock().unwrap();
                tracing::debug!(entries = map.len(), "Clearing memory cache under pressure");
                map.clear();
            }
        });

        Self {
            map,
            _pressure: Some(subscription),
        }
    }
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash,
{
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.map.lock().unwrap().get(key).cloned()
    }

    /// Stores `value` under `key`, replacing any existing value.
    pub fn set(&self, key: K, value: V) {
        self.map.lock().unwrap().insert(key, value);
    }

    /// Removes the value for `key`. No-op if absent.
    pub fn remove(&self, key: &K) {
        self.map.lock().unwrap().remove(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.lock().unwrap().contains_key(key)
    }

    /// Atomically empties the mapping.
    pub fn clear(&self) {
        self.map.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    /// Acquires the cache lock and returns a guard with direct access to the
    /// underlying map.
    ///
    /// Use this to perform several operations as one atomic batch. The lock
    /// is released on every exit path, including panics, so a failing batch
    /// can never leave the cache unusable.
    pub fn lock(&self) -> MutexGuard<'_, FxHashMap<K, V>> {
        self.map.lock().unwrap()
    }
}

impl<K, V> Default for MemoryCache<K, V>
where
    K: Eq + Hash + Send + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for MemoryCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.map.try_lock().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("MemoryCache")
            .field("entries", &entries)
            .field("pressure_monitored", &self._pressure.is_some())
            .finish()
    }
}
