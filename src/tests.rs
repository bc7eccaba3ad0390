use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use filetime::FileTime;

use crate::{
    CacheConfig, CacheDelegate, CacheError, FilesystemCache, IdentityCodec, MemoryCache,
    MemoryPressureMonitor, PersistenceCodec, TaskQueues,
};

/// Delegate using the key itself as the filename.
struct KeyFilename;

impl<V> CacheDelegate<String, V> for KeyFilename {
    fn filename(&self, key: &String) -> String {
        key.clone()
    }
}

/// Delegate that keeps values out of the memory tier.
struct DiskOnly;

impl<V> CacheDelegate<String, V> for DiskOnly {
    fn filename(&self, key: &String) -> String {
        key.clone()
    }

    fn should_store_in_memory(&self, _value: &V, _key: &String) -> bool {
        false
    }
}

/// Delegate that keeps values off the disk tier.
struct MemoryOnly;

impl<V> CacheDelegate<String, V> for MemoryOnly {
    fn filename(&self, key: &String) -> String {
        key.clone()
    }

    fn should_store_on_disk(&self, _value: &V, _key: &String) -> bool {
        false
    }
}

struct Utf8Codec;

impl PersistenceCodec<String> for Utf8Codec {
    fn encode(&self, value: &String) -> crate::CacheResult<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: Vec<u8>) -> crate::CacheResult<String> {
        String::from_utf8(bytes).map_err(|e| CacheError::Codec(e.to_string()))
    }
}

type BytesCache = FilesystemCache<String, Vec<u8>, KeyFilename>;

/// Initializes test logging, capturing this crate's logs at trace level and
/// muting everything else.
fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("tiercache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

fn bytes_cache(config: CacheConfig, queues: &TaskQueues) -> BytesCache {
    setup();
    FilesystemCache::new(config, KeyFilename, IdentityCodec, queues, None).unwrap()
}

fn key(s: &str) -> String {
    s.to_owned()
}

/// Rewinds the mtime of `path` so the file looks `age` old.
fn backdate(path: &Path, age: Duration) {
    let mtime = FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_mtime(path, mtime).unwrap();
}

#[tokio::test]
async fn test_cache_dir_created() {
    let basedir = tempfile::tempdir().unwrap();
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    let fsinfo = fs::metadata(cache.cache_dir()).unwrap();
    assert!(fsinfo.is_dir());
}

#[tokio::test]
async fn test_invalid_name_rejected() {
    setup();
    let basedir = tempfile::tempdir().unwrap();
    let queues = TaskQueues::default();
    let config = CacheConfig::new(basedir.path(), "../escape");
    let result: crate::CacheResult<BytesCache> =
        FilesystemCache::new(config, KeyFilename, IdentityCodec, &queues, None);
    assert!(matches!(result, Err(CacheError::Config(_))));
}

// A flushed write survives into a fresh cache instance over the same
// directory, decoding back to the stored value.
#[tokio::test]
async fn test_round_trip_fresh_instance() -> Result<()> {
    setup();
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let config = CacheConfig::new(basedir.path(), "strings");

    let cache = FilesystemCache::new(config.clone(), KeyFilename, Utf8Codec, &queues, None)?;
    cache.store_object(key("greeting"), "hello".to_owned());
    cache.flush_pending_writes().await;
    drop(cache);

    let cache = FilesystemCache::new(config, KeyFilename, Utf8Codec, &queues, None)?;
    assert!(!cache.is_key_in_memory_cache(&key("greeting")));
    assert_eq!(cache.object_for_key(&key("greeting")), Some("hello".to_owned()));
    // the disk hit was promoted back into memory
    assert!(cache.is_key_in_memory_cache(&key("greeting")));
    Ok(())
}

// The memory tier keeps serving after the backing file is deleted
// out-of-band, until the memory tier is cleared.
#[tokio::test]
async fn test_memory_precedence() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    cache.store_object(key("a"), vec![1, 2, 3]);
    cache.flush_pending_writes().await;

    fs::remove_file(cache.file_path_for_key(&key("a")))?;
    assert_eq!(cache.object_for_key(&key("a")), Some(vec![1, 2, 3]));

    cache.clear_memory_cache();
    assert_eq!(cache.object_for_key(&key("a")), None);
    Ok(())
}

// A file older than max_age is treated as absent even though it still
// physically exists until a purge runs.
#[tokio::test]
async fn test_expired_file_is_a_miss() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let config = CacheConfig::new(basedir.path(), "objects").max_age(Duration::from_secs(3600));
    let cache = bytes_cache(config, &queues);

    cache.store_object(key("a"), vec![1]);
    cache.flush_pending_writes().await;
    cache.clear_memory_cache();

    let path = cache.file_path_for_key(&key("a"));
    backdate(&path, Duration::from_secs(2 * 3600));

    assert!(!cache.is_key_in_filesystem_cache(&key("a")));
    assert!(!cache.contains_key(&key("a")));
    assert_eq!(cache.object_for_key(&key("a")), None);
    // not deleted inline; the sweep owns deletion
    assert!(path.exists());
    Ok(())
}

// The purge removes exactly the files older than the given age and is
// idempotent.
#[tokio::test]
async fn test_purge_exact_and_idempotent() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    for k in ["old1", "old2", "young"] {
        cache.store_object(key(k), vec![0; 16]);
    }
    cache.flush_pending_writes().await;
    backdate(&cache.file_path_for_key(&key("old1")), Duration::from_secs(600));
    backdate(&cache.file_path_for_key(&key("old2")), Duration::from_secs(600));

    let stats = cache.purge_cache_files_older_than(Duration::from_secs(300))?;
    assert_eq!(stats.removed_files, 2);
    assert_eq!(stats.retained_files, 1);
    assert!(!cache.file_path_for_key(&key("old1")).exists());
    assert!(!cache.file_path_for_key(&key("old2")).exists());
    assert!(cache.file_path_for_key(&key("young")).exists());

    let stats = cache.purge_cache_files_older_than(Duration::from_secs(300))?;
    assert_eq!(stats.removed_files, 0);
    assert_eq!(stats.retained_files, 1);
    Ok(())
}

// Concurrent set/get/remove over overlapping keys never corrupt the
// mapping. The expected final state per key is recorded in a log that is
// appended while still holding the cache lock, giving a total order.
#[test]
fn test_concurrent_memory_operations() {
    setup();
    let cache: Arc<MemoryCache<u32, u64>> = Arc::new(MemoryCache::new());
    let log: Arc<Mutex<HashMap<u32, Option<u64>>>> = Arc::new(Mutex::new(HashMap::new()));

    let threads: Vec<_> = (0..8u64)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for i in 0..500u64 {
                    let k = (i % 16) as u32;
                    let v = t * 10_000 + i;
                    match (t + i) % 3 {
                        0 => {
                            let mut map = cache.lock();
                            map.insert(k, v);
                            log.lock().unwrap().insert(k, Some(v));
                        }
                        1 => {
                            let mut map = cache.lock();
                            map.remove(&k);
                            log.lock().unwrap().insert(k, None);
                        }
                        _ => {
                            // plain reads interleave with the writers
                            let _ = cache.get(&k);
                        }
                    }
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    let log = log.lock().unwrap();
    for k in 0..16u32 {
        let expected = log.get(&k).copied().flatten();
        assert_eq!(cache.get(&k), expected, "key {k}");
    }
}

// Admission predicates produce disk-only and memory-only states.
#[tokio::test]
async fn test_admission_predicates() -> Result<()> {
    setup();
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();

    let disk_only: FilesystemCache<String, Vec<u8>, DiskOnly> = FilesystemCache::new(
        CacheConfig::new(basedir.path(), "disk-only"),
        DiskOnly,
        IdentityCodec,
        &queues,
        None,
    )?;
    disk_only.store_object(key("a"), vec![1]);
    disk_only.flush_pending_writes().await;
    assert!(!disk_only.is_key_in_memory_cache(&key("a")));
    assert!(disk_only.is_key_in_filesystem_cache(&key("a")));
    // a lookup still succeeds, and still does not promote into memory
    assert_eq!(disk_only.object_for_key(&key("a")), Some(vec![1]));
    assert!(!disk_only.is_key_in_memory_cache(&key("a")));

    let memory_only: FilesystemCache<String, Vec<u8>, MemoryOnly> = FilesystemCache::new(
        CacheConfig::new(basedir.path(), "memory-only"),
        MemoryOnly,
        IdentityCodec,
        &queues,
        None,
    )?;
    memory_only.store_object(key("a"), vec![2]);
    memory_only.flush_pending_writes().await;
    assert!(memory_only.is_key_in_memory_cache(&key("a")));
    assert!(!memory_only.is_key_in_filesystem_cache(&key("a")));
    Ok(())
}

// Store, flush, pressure clear, disk re-promotion, expiry, purge — end to end.
#[tokio::test]
async fn test_thumbnails_scenario() -> Result<()> {
    setup();
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let monitor = MemoryPressureMonitor::new();
    let config =
        CacheConfig::new(basedir.path(), "thumbnails").max_age(Duration::from_secs(3600));
    let cache: BytesCache =
        FilesystemCache::new(config, KeyFilename, IdentityCodec, &queues, Some(&monitor))?;

    cache.store_object(key("a"), vec![1, 2, 3]);
    assert!(cache.is_key_in_memory_cache(&key("a")));

    cache.flush_pending_writes().await;
    assert!(cache.is_key_in_filesystem_cache(&key("a")));

    monitor.notify();
    assert!(!cache.is_key_in_memory_cache(&key("a")));
    // loaded from disk and re-promoted to memory
    assert_eq!(cache.object_for_key(&key("a")), Some(vec![1, 2, 3]));
    assert!(cache.is_key_in_memory_cache(&key("a")));

    // two hours pass
    monitor.notify();
    backdate(&cache.file_path_for_key(&key("a")), Duration::from_secs(2 * 3600));
    assert_eq!(cache.object_for_key(&key("a")), None);

    cache.purge_out_of_date_cache_files()?;
    assert!(!cache.file_path_for_key(&key("a")).exists());
    Ok(())
}

#[tokio::test]
async fn test_async_lookup_promotes_to_memory() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    cache.store_object(key("a"), vec![9, 9]);
    cache.flush_pending_writes().await;
    cache.clear_memory_cache();

    assert_eq!(cache.object_for_key_async(&key("a")).await?, Some(vec![9, 9]));
    assert!(cache.is_key_in_memory_cache(&key("a")));

    assert_eq!(cache.object_for_key_async(&key("missing")).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_callback_lookup() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    cache.store_object(key("a"), vec![7]);
    cache.flush_pending_writes().await;
    cache.clear_memory_cache();

    let (tx, rx) = tokio::sync::oneshot::channel();
    cache.read_object_for_key(key("a"), move |result| {
        tx.send(result.unwrap()).unwrap();
    });
    assert_eq!(rx.await?, Some(vec![7]));
    Ok(())
}

#[tokio::test]
async fn test_remove_object() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    cache.store_object(key("a"), vec![1]);
    cache.flush_pending_writes().await;

    cache.remove_object(&key("a"));
    // gone from both tiers before the staged file is even deleted
    assert!(!cache.contains_key(&key("a")));
    assert_eq!(cache.object_for_key(&key("a")), None);

    cache.flush_pending_writes().await;
    assert!(!cache.file_path_for_key(&key("a")).exists());

    // removing an absent key is a no-op
    cache.remove_object(&key("a"));
    Ok(())
}

#[tokio::test]
async fn test_clear_filesystem_cache_keeps_memory() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    cache.store_object(key("a"), vec![1]);
    cache.store_object(key("b"), vec![2]);
    cache.flush_pending_writes().await;

    cache.clear_filesystem_cache()?;
    assert!(!cache.is_key_in_filesystem_cache(&key("a")));
    assert!(!cache.is_key_in_filesystem_cache(&key("b")));
    assert!(cache.is_key_in_memory_cache(&key("a")));
    assert_eq!(cache.object_for_key(&key("b")), Some(vec![2]));
    Ok(())
}

#[tokio::test]
async fn test_decode_failure_is_a_miss_with_side_channel() -> Result<()> {
    setup();
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let config = CacheConfig::new(basedir.path(), "strings");
    let cache = FilesystemCache::new(config, KeyFilename, Utf8Codec, &queues, None)?;

    fs::write(cache.file_path_for_key(&key("bad")), [0xff, 0xfe])?;

    assert_eq!(cache.object_for_key(&key("bad")), None);
    assert!(matches!(
        cache.try_object_for_key(&key("bad")),
        Err(CacheError::Codec(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_same_key_writes_land_in_order() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    for i in 0..50u8 {
        cache.store_object(key("contended"), vec![i]);
    }
    cache.flush_pending_writes().await;

    let on_disk = fs::read(cache.file_path_for_key(&key("contended")))?;
    assert_eq!(on_disk, vec![49]);
    Ok(())
}

// On a multi-thread runtime the write queue polls tasks in whatever order
// the workers pick them up; the newest store for a key must still win on
// disk.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_writes_last_wins_multi_thread() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    for round in 0..200u8 {
        let k = key(&format!("slot{}", round % 4));
        for i in 0..8u8 {
            cache.store_object(k.clone(), vec![round, i]);
        }
        cache.flush_pending_writes().await;
        assert_eq!(cache.object_for_key_on_disk(&k)?, Some(vec![round, 7]));
    }
    Ok(())
}

// A delete submitted after a store must win: the still-queued write may
// not land afterwards and resurrect the file.
#[tokio::test]
async fn test_remove_supersedes_pending_write() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    cache.store_object(key("doomed"), vec![1, 2, 3]);
    cache.remove_object(&key("doomed"));
    cache.flush_pending_writes().await;

    assert!(!cache.contains_key(&key("doomed")));
    assert!(!cache.file_path_for_key(&key("doomed")).exists());
    assert_eq!(cache.object_for_key(&key("doomed")), None);

    // A store issued after the delete is newer and lands normally.
    cache.store_object(key("doomed"), vec![4]);
    cache.flush_pending_writes().await;
    assert_eq!(cache.object_for_key_on_disk(&key("doomed"))?, Some(vec![4]));
    Ok(())
}

#[tokio::test]
async fn test_distinct_cache_names_do_not_collide() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let left = bytes_cache(CacheConfig::new(basedir.path(), "left"), &queues);
    let right = bytes_cache(CacheConfig::new(basedir.path(), "right"), &queues);

    left.store_object(key("a"), vec![1]);
    right.store_object(key("a"), vec![2]);
    left.flush_pending_writes().await;
    right.flush_pending_writes().await;

    left.clear_memory_cache();
    right.clear_memory_cache();
    assert_eq!(left.object_for_key(&key("a")), Some(vec![1]));
    assert_eq!(right.object_for_key(&key("a")), Some(vec![2]));
    Ok(())
}

#[tokio::test]
async fn test_single_tier_variants() -> Result<()> {
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let cache = bytes_cache(CacheConfig::new(basedir.path(), "objects"), &queues);

    cache.store_object_in_memory(key("mem"), vec![1]);
    cache.flush_pending_writes().await;
    assert!(cache.is_key_in_memory_cache(&key("mem")));
    assert!(!cache.is_key_in_filesystem_cache(&key("mem")));

    cache.store_object_on_disk(&key("disk"), &vec![2])?;
    cache.flush_pending_writes().await;
    assert!(!cache.is_key_in_memory_cache(&key("disk")));
    assert_eq!(cache.object_for_key_on_disk(&key("disk"))?, Some(vec![2]));
    // the disk-only lookup did not promote
    assert!(!cache.is_key_in_memory_cache(&key("disk")));

    cache.store_object(key("both"), vec![3]);
    cache.flush_pending_writes().await;
    cache.remove_object_from_memory(&key("both"));
    assert!(!cache.is_key_in_memory_cache(&key("both")));
    assert!(cache.is_key_in_filesystem_cache(&key("both")));
    Ok(())
}

#[tokio::test]
async fn test_ignore_memory_pressure() -> Result<()> {
    setup();
    let basedir = tempfile::tempdir()?;
    let queues = TaskQueues::default();
    let monitor = MemoryPressureMonitor::new();
    let config = CacheConfig::new(basedir.path(), "objects").ignore_memory_pressure(true);
    let cache: BytesCache =
        FilesystemCache::new(config, KeyFilename, IdentityCodec, &queues, Some(&monitor))?;

    cache.store_object(key("a"), vec![1]);
    monitor.notify();
    assert!(cache.is_key_in_memory_cache(&key("a")));
    Ok(())
}
