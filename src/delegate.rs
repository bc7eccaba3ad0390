/// Controls the behavior of a [`FilesystemCache`](crate::FilesystemCache).
///
/// Only [`filename`](Self::filename) is required; the admission predicates
/// default to always-true, and the file extension defaults to `"cache"`.
pub trait CacheDelegate<K, V>: Send + Sync + 'static {
    /// The filename (without extension) under which the value for `key` is
    /// stored.
    ///
    /// Must be deterministic and collision-free for the key domain in use;
    /// the cache does not detect filename collisions between distinct keys.
    fn filename(&self, key: &K) -> String;

    /// The extension appended to every derived filename.
    fn file_extension(&self) -> &str {
        "cache"
    }

    /// Whether `value` should be admitted to the memory tier.
    fn should_store_in_memory(&self, _value: &V, _key: &K) -> bool {
        true
    }

    /// Whether `value` should be admitted to the filesystem tier.
    fn should_store_on_disk(&self, _value: &V, _key: &K) -> bool {
        true
    }
}
