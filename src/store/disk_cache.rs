//! Content-addressed on-disk cache of archives with LRU eviction.

use crate::error::Result;
use crate::metrics::{Metrics, SharedMetrics};
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Called with the path of an entry right before it is removed from disk.
pub type EvictHook = Arc<dyn Fn(&Path) + Send + Sync>;

const ARCHIVE_EXT: &str = "zip";

/// Outcome of one eviction pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictStats {
    pub entries: usize,
    pub bytes_before: u64,
    pub evicted: usize,
    pub bytes_after: u64,
}

pub struct DiskCache {
    dir: PathBuf,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    before_evict: EvictHook,
    metrics: SharedMetrics,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, before_evict: EvictHook, metrics: SharedMetrics) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            inflight: Mutex::new(HashMap::new()),
            before_evict,
            metrics,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, ARCHIVE_EXT))
    }

    /// Return the archive for `key`, populating it with `fetch` on a miss.
    ///
    /// `fetch` writes the archive to the temporary path it is given; on
    /// success the file is renamed into place. Concurrent callers for the
    /// same key wait for one population instead of fetching twice. The bool
    /// is true on a cache hit.
    pub async fn open_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<(PathBuf, bool)>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let path = self.path_for(key);
        if self.touch(&path) {
            return Ok((path, true));
        }

        let lock = self.key_lock(key);
        let result = self.populate(&path, &lock, fetch).await;
        self.release_key_lock(key, lock);
        result
    }

    async fn populate<F, Fut>(
        &self,
        path: &Path,
        lock: &tokio::sync::Mutex<()>,
        fetch: F,
    ) -> Result<(PathBuf, bool)>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = lock.lock().await;
        if self.touch(path) {
            return Ok((path.to_path_buf(), true));
        }
        let tmp = tempfile::Builder::new()
            .prefix(".fetch-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)?
            .into_temp_path();
        fetch(tmp.to_path_buf()).await?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!(path = %path.display(), "cached archive");
        Ok((path.to_path_buf(), false))
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn release_key_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if inflight.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            inflight.remove(key);
        }
    }

    /// Mark an entry as recently used. Returns false if it does not exist.
    fn touch(&self, path: &Path) -> bool {
        match fs::File::options().write(true).open(path) {
            Ok(file) => {
                if let Err(e) = file.set_modified(SystemTime::now()) {
                    debug!(path = %path.display(), error = %e, "failed to touch cache entry");
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Remove one entry, running the eviction hook first.
    pub fn remove(&self, path: &Path) {
        (self.before_evict)(path);
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove cache entry");
            }
        }
    }

    /// Evict least recently used entries until the cache is at most
    /// `max_bytes` in size.
    pub fn evict(&self, max_bytes: u64) -> Result<EvictStats> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXT) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let used = last_used(&meta);
            entries.push((path, meta.len(), used));
        }

        let mut stats = EvictStats {
            entries: entries.len(),
            bytes_before: entries.iter().map(|e| e.1).sum(),
            ..Default::default()
        };
        stats.bytes_after = stats.bytes_before;

        if stats.bytes_before > max_bytes {
            entries.sort_by_key(|e| e.2);
            for (path, size, _) in entries {
                if stats.bytes_after <= max_bytes {
                    break;
                }
                self.remove(&path);
                stats.bytes_after -= size;
                stats.evicted += 1;
                Metrics::incr(&self.metrics.evictions);
            }
            info!(
                evicted = stats.evicted,
                bytes_before = %crate::utils::format_bytes(stats.bytes_before),
                bytes_after = %crate::utils::format_bytes(stats.bytes_after),
                "evicted archives"
            );
        }

        self.metrics
            .disk_usage_bytes
            .store(stats.bytes_after, Ordering::Relaxed);
        Ok(stats)
    }
}

fn last_used(meta: &fs::Metadata) -> SystemTime {
    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    match meta.accessed() {
        Ok(accessed) if accessed > modified => accessed,
        _ => modified,
    }
}
