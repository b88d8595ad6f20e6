//! Keyed byte cache with TTL, FIFO eviction, and an optional disk mirror.
//!
//! Entries are owned by the cache; callers receive `Arc` views. Eviction
//! walks insertion order whenever the entry count or total byte caps are
//! exceeded. When a cache directory is configured, entries are mirrored to
//! hashed filenames and TTL is enforced via file modification times. Disk
//! failures are logged and never propagate.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::warn;

struct Entry {
    bytes: Arc<Vec<u8>>,
    expires_at: Instant,
}

struct Inner {
    items: HashMap<String, Entry>,
    order: VecDeque<String>,
    size: usize,
}

pub struct ByteCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_entries: usize,
    max_bytes: usize,
    dir: Option<PathBuf>,
}

impl ByteCache {
    pub fn new(
        ttl: Duration,
        max_entries: usize,
        max_bytes: usize,
        dir: Option<PathBuf>,
    ) -> Self {
        if let Some(dir) = &dir {
            if let Err(err) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), %err, "failed to create cache dir");
            }
        }
        Self {
            inner: Mutex::new(Inner {
                items: HashMap::new(),
                order: VecDeque::new(),
                size: 0,
            }),
            ttl,
            max_entries,
            max_bytes,
            dir,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.items.get(key) {
            Some(entry) => {
                if self.ttl > Duration::ZERO && Instant::now() > entry.expires_at {
                    Self::remove_locked(&mut inner, key);
                    self.get_disk_locked(&mut inner, key)
                } else {
                    Some(Arc::clone(&entry.bytes))
                }
            }
            None => self.get_disk_locked(&mut inner, key),
        }
    }

    pub fn set(&self, key: &str, value: Vec<u8>) {
        let bytes = Arc::new(value);
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, key, Arc::clone(&bytes));

        // The disk mirror is updated under the same lock; otherwise two
        // racing set() calls could leave disk holding the loser's bytes
        // while memory holds the winner's.
        if self.dir.is_some() && self.should_persist(bytes.len()) {
            if let Err(err) = self.write_disk(key, &bytes) {
                warn!(%err, "failed to persist cache entry");
            }
            self.evict_disk();
        }
        drop(inner);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().size
    }

    fn insert_locked(&self, inner: &mut Inner, key: &str, bytes: Arc<Vec<u8>>) {
        if let Some(existing) = inner.items.remove(key) {
            inner.size -= existing.bytes.len();
            inner.order.retain(|k| k != key);
        }
        inner.size += bytes.len();
        inner.order.push_back(key.to_string());
        inner.items.insert(
            key.to_string(),
            Entry {
                bytes,
                expires_at: Instant::now() + self.ttl,
            },
        );
        self.evict_locked(inner);
    }

    fn remove_locked(inner: &mut Inner, key: &str) {
        if let Some(entry) = inner.items.remove(key) {
            inner.size -= entry.bytes.len();
            inner.order.retain(|k| k != key);
        }
    }

    fn evict_locked(&self, inner: &mut Inner) {
        while self.should_evict(inner) {
            let Some(key) = inner.order.pop_front() else {
                return;
            };
            if let Some(entry) = inner.items.remove(&key) {
                inner.size -= entry.bytes.len();
            }
        }
    }

    fn should_evict(&self, inner: &Inner) -> bool {
        if self.max_entries > 0 && inner.items.len() > self.max_entries {
            return true;
        }
        if self.max_bytes > 0 && inner.size > self.max_bytes {
            return true;
        }
        false
    }

    fn should_persist(&self, size: usize) -> bool {
        self.max_bytes == 0 || size <= self.max_bytes
    }

    fn disk_path(&self, key: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let digest = Sha256::digest(key.as_bytes());
        let mut name = String::with_capacity(64);
        for byte in digest {
            name.push_str(&format!("{byte:02x}"));
        }
        Some(dir.join(name))
    }

    fn get_disk_locked(&self, inner: &mut Inner, key: &str) -> Option<Arc<Vec<u8>>> {
        let path = self.disk_path(key)?;
        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        if self.ttl > Duration::ZERO && stale(modified, self.ttl) {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        let data = std::fs::read(&path).ok()?;
        touch(&path);
        let bytes = Arc::new(data);
        self.insert_locked(inner, key, Arc::clone(&bytes));
        Some(bytes)
    }

    fn write_disk(&self, key: &str, data: &[u8]) -> std::io::Result<()> {
        let (Some(path), Some(dir)) = (self.disk_path(key), self.dir.as_ref()) else {
            return Ok(());
        };
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), data)?;
        tmp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Prunes TTL-stale files, then evicts oldest-mtime entries until the
    /// count and size caps hold. Mirrors the in-memory policy.
    fn evict_disk(&self) {
        let Some(dir) = self.dir.as_ref() else {
            return;
        };
        let (mut entries, mut total) = self.list_disk(dir);
        while self.should_evict_disk(total, entries.len()) {
            if entries.is_empty() {
                return;
            }
            let entry = entries.remove(0);
            let _ = std::fs::remove_file(&entry.path);
            total -= entry.size;
        }
    }

    fn list_disk(&self, dir: &Path) -> (Vec<DiskEntry>, usize) {
        let mut entries = Vec::new();
        let mut total = 0usize;
        let Ok(read_dir) = std::fs::read_dir(dir) else {
            return (entries, total);
        };
        for item in read_dir.flatten() {
            let Ok(meta) = item.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else { continue };
            if self.ttl > Duration::ZERO && stale(modified, self.ttl) {
                let _ = std::fs::remove_file(item.path());
                continue;
            }
            let size = meta.len() as usize;
            total += size;
            entries.push(DiskEntry {
                path: item.path(),
                modified,
                size,
            });
        }
        entries.sort_by_key(|entry| entry.modified);
        (entries, total)
    }

    fn should_evict_disk(&self, total: usize, count: usize) -> bool {
        if self.max_entries > 0 && count > self.max_entries {
            return true;
        }
        if self.max_bytes > 0 && total > self.max_bytes {
            return true;
        }
        false
    }
}

struct DiskEntry {
    path: PathBuf,
    modified: SystemTime,
    size: usize,
}

fn stale(modified: SystemTime, ttl: Duration) -> bool {
    match modified.elapsed() {
        Ok(age) => age > ttl,
        Err(_) => false,
    }
}

/// Bumps the file's mtime so disk eviction treats a read as recency.
fn touch(path: &Path) {
    let result = std::fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()));
    if let Err(err) = result {
        warn!(path = %path.display(), %err, "failed to touch cache file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_cache(max_entries: usize, max_bytes: usize) -> ByteCache {
        ByteCache::new(Duration::ZERO, max_entries, max_bytes, None)
    }

    #[test]
    fn get_and_set_roundtrip() {
        let cache = mem_cache(0, 0);
        cache.set("k", b"value".to_vec());
        assert_eq!(cache.get("k").unwrap().as_slice(), b"value");
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn entry_cap_evicts_fifo() {
        let cache = mem_cache(3, 0);
        for key in ["a", "b", "c", "d"] {
            cache.set(key, vec![0u8]);
        }
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn byte_cap_evicts_until_under() {
        let cache = mem_cache(0, 10);
        cache.set("a", vec![0u8; 6]);
        cache.set("b", vec![0u8; 6]);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.total_bytes() <= 10);
    }

    #[test]
    fn reinsert_moves_to_tail() {
        let cache = mem_cache(2, 0);
        cache.set("a", vec![1]);
        cache.set("b", vec![2]);
        cache.set("a", vec![3]);
        cache.set("c", vec![4]);
        // "b" was the oldest after "a" moved to the tail.
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").unwrap().as_slice(), &[3]);
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn zero_caps_never_evict() {
        let cache = mem_cache(0, 0);
        for i in 0..100 {
            cache.set(&format!("k{i}"), vec![0u8; 100]);
        }
        assert_eq!(cache.len(), 100);
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = ByteCache::new(Duration::from_millis(10), 0, 0, None);
        cache.set("k", vec![1]);
        assert!(cache.get("k").is_some());
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn zero_ttl_means_no_expiry() {
        let cache = mem_cache(0, 0);
        cache.set("k", vec![1]);
        std::thread::sleep(Duration::from_millis(15));
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn disk_mirror_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ByteCache::new(
            Duration::from_secs(60),
            0,
            0,
            Some(dir.path().to_path_buf()),
        );
        cache.set("k", b"persisted".to_vec());

        let reopened = ByteCache::new(
            Duration::from_secs(60),
            0,
            0,
            Some(dir.path().to_path_buf()),
        );
        assert_eq!(reopened.get("k").unwrap().as_slice(), b"persisted");
    }

    #[test]
    fn disk_skips_oversize_values() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ByteCache::new(Duration::ZERO, 0, 4, Some(dir.path().to_path_buf()));
        cache.set("big", vec![0u8; 16]);
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(files.is_empty());
    }
}
