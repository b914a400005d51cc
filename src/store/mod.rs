//! Archive store: fetches a commit's tree as tar, re-encodes it into an
//! uncompressed zip under the content policy, and keeps the result in an LRU
//! disk cache backed by a cache of memory-mapped archives.

pub mod archive;
pub mod disk_cache;
pub mod filter;
pub mod zip_cache;

use crate::config::StoreConfig;
use crate::context::SearchContext;
use crate::error::{Result, SearchError};
use crate::metrics::{Metrics, SharedMetrics};
use crate::source::RepoSource;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use archive::{tar_to_zip, ConvertStats};
pub use disk_cache::{DiskCache, EvictHook, EvictStats};
pub use filter::SearchableFilter;
pub use zip_cache::{SrcFile, ZipCache, ZipFile, ZipHandle};

/// Times a broken archive is removed and fetched again.
const MAX_ARCHIVE_RETRIES: usize = 2;

/// Resizable counting semaphore bounding concurrent fetches.
pub struct FetchLimiter {
    sem: Arc<Semaphore>,
    size: Mutex<usize>,
    metrics: SharedMetrics,
}

impl FetchLimiter {
    pub fn new(size: usize, metrics: SharedMetrics) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(size)),
            size: Mutex::new(size),
            metrics,
        }
    }

    pub fn size(&self) -> usize {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Change the number of permits. Shrinking below the number currently
    /// held takes effect as those permits are returned.
    pub fn resize(&self, new_size: usize) {
        let mut size = self.size.lock().unwrap_or_else(|e| e.into_inner());
        if new_size > *size {
            self.sem.add_permits(new_size - *size);
        } else if new_size < *size {
            let shrink = *size - new_size;
            let owed = shrink - self.sem.forget_permits(shrink);
            if owed > 0 {
                let sem = self.sem.clone();
                tokio::spawn(async move {
                    if let Ok(permits) = sem.acquire_many_owned(owed as u32).await {
                        permits.forget();
                    }
                });
            }
        }
        if new_size != *size {
            debug!(from = *size, to = new_size, "resized fetch limiter");
        }
        *size = new_size;
    }

    /// Wait for a permit, giving up when `ctx` is done.
    pub async fn acquire(&self, ctx: &SearchContext) -> Result<OwnedSemaphorePermit> {
        self.metrics.fetches_queued.fetch_add(1, Ordering::Relaxed);
        let result = tokio::select! {
            permit = self.sem.clone().acquire_owned() => {
                permit.map_err(|_| SearchError::temporary("fetch limiter closed"))
            }
            _ = ctx.done() => Err(ctx.check().err().unwrap_or(SearchError::Canceled)),
        };
        self.metrics.fetches_queued.fetch_sub(1, Ordering::Relaxed);
        result
    }
}

pub struct Store {
    config: StoreConfig,
    fingerprint: String,
    source: Arc<dyn RepoSource>,
    disk: Arc<DiskCache>,
    zips: Arc<ZipCache>,
    limiter: FetchLimiter,
    metrics: SharedMetrics,
}

impl Store {
    pub fn new(config: StoreConfig, source: Arc<dyn RepoSource>, metrics: SharedMetrics) -> Result<Self> {
        let zips = Arc::new(ZipCache::new(metrics.clone()));
        let hook_zips = zips.clone();
        let hook: EvictHook = Arc::new(move |path: &Path| hook_zips.delete(path));
        let disk = Arc::new(DiskCache::new(&config.cache_dir, hook, metrics.clone())?);
        let limiter = FetchLimiter::new(
            limiter_size(source.replica_count(), config.fetch_limit_per_replica),
            metrics.clone(),
        );
        Ok(Self {
            fingerprint: config.fingerprint(),
            config,
            source,
            disk,
            zips,
            limiter,
            metrics,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn zip_cache(&self) -> &Arc<ZipCache> {
        &self.zips
    }

    pub fn limiter(&self) -> &FetchLimiter {
        &self.limiter
    }

    /// Stable hex key for one archive.
    pub fn cache_key(&self, repo: &str, commit: &str, paths: Option<&[String]>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(repo.as_bytes());
        hasher.update([0]);
        hasher.update(commit.as_bytes());
        hasher.update([0]);
        hasher.update(self.fingerprint.as_bytes());
        if let Some(paths) = paths {
            hasher.update(b"\0paths");
            for p in paths {
                hasher.update([0]);
                hasher.update(p.as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }

    /// Local path of the full archive for `commit`.
    pub async fn prepare_zip(
        self: &Arc<Self>,
        ctx: &SearchContext,
        repo: &str,
        commit: &str,
        fetch_timeout: Option<Duration>,
    ) -> Result<PathBuf> {
        self.prepare(ctx, repo, commit, None, fetch_timeout).await
    }

    /// Local path of an archive holding only `paths` at `commit`.
    pub async fn prepare_zip_paths(
        self: &Arc<Self>,
        ctx: &SearchContext,
        repo: &str,
        commit: &str,
        paths: &[String],
        fetch_timeout: Option<Duration>,
    ) -> Result<PathBuf> {
        let mut paths = paths.to_vec();
        paths.sort();
        paths.dedup();
        self.prepare(ctx, repo, commit, Some(paths), fetch_timeout).await
    }

    /// Prepare and map an archive. Broken archives are removed and fetched
    /// again, up to twice.
    pub async fn open_zip(
        self: &Arc<Self>,
        ctx: &SearchContext,
        repo: &str,
        commit: &str,
        paths: Option<&[String]>,
        fetch_timeout: Option<Duration>,
    ) -> Result<ZipHandle> {
        let mut attempt = 0;
        loop {
            match self.try_open(ctx, repo, commit, paths, fetch_timeout).await {
                Err(e) if attempt < MAX_ARCHIVE_RETRIES && retry_archive(&e) => {
                    attempt += 1;
                    warn!(repo, commit, attempt, error = %e, "retrying archive");
                }
                result => return result,
            }
        }
    }

    async fn try_open(
        self: &Arc<Self>,
        ctx: &SearchContext,
        repo: &str,
        commit: &str,
        paths: Option<&[String]>,
        fetch_timeout: Option<Duration>,
    ) -> Result<ZipHandle> {
        let path = match paths {
            Some(paths) => self.prepare_zip_paths(ctx, repo, commit, paths, fetch_timeout).await?,
            None => self.prepare_zip(ctx, repo, commit, fetch_timeout).await?,
        };
        let zips = self.zips.clone();
        let open_path = path.clone();
        match tokio::task::spawn_blocking(move || zips.get(&open_path)).await? {
            Ok(handle) => Ok(handle),
            Err(e @ SearchError::Archive { .. }) => {
                let disk = self.disk.clone();
                tokio::task::spawn_blocking(move || disk.remove(&path)).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// The fetch runs detached so a request that stops waiting still leaves a
    /// populated cache behind.
    async fn prepare(
        self: &Arc<Self>,
        ctx: &SearchContext,
        repo: &str,
        commit: &str,
        paths: Option<Vec<String>>,
        fetch_timeout: Option<Duration>,
    ) -> Result<PathBuf> {
        ctx.check()?;
        let key = self.cache_key(repo, commit, paths.as_deref());
        let store = self.clone();
        let (task_repo, task_commit) = (repo.to_string(), commit.to_string());
        let task = tokio::spawn(async move {
            let bg = SearchContext::background().with_timeout(store.config.background_timeout());
            store
                .fetch_into_cache(&bg, &key, &task_repo, &task_commit, paths)
                .await
        });

        let wait = fetch_timeout.unwrap_or_else(|| self.config.fetch_timeout());
        tokio::select! {
            result = task => result?,
            _ = ctx.done() => Err(ctx.check().err().unwrap_or(SearchError::Canceled)),
            _ = tokio::time::sleep(wait) => {
                info!(repo, commit, wait_ms = wait.as_millis() as u64, "archive still fetching");
                Err(SearchError::StillFetching {
                    repo: repo.to_string(),
                    commit: commit.to_string(),
                    millis: wait.as_millis() as u64,
                })
            }
        }
    }

    async fn fetch_into_cache(
        self: &Arc<Self>,
        bg: &SearchContext,
        key: &str,
        repo: &str,
        commit: &str,
        paths: Option<Vec<String>>,
    ) -> Result<PathBuf> {
        let (path, hit) = self
            .disk
            .open_or_fetch(key, |tmp| self.fetch(bg, repo, commit, paths, tmp))
            .await?;
        if hit {
            Metrics::incr(&self.metrics.archive_cache_hits);
            debug!(repo, commit, path = %path.display(), "archive cache hit");
        } else {
            Metrics::incr(&self.metrics.archive_cache_misses);
        }
        Ok(path)
    }

    async fn fetch(
        self: &Arc<Self>,
        bg: &SearchContext,
        repo: &str,
        commit: &str,
        paths: Option<Vec<String>>,
        tmp: PathBuf,
    ) -> Result<()> {
        let _permit = self.limiter.acquire(bg).await?;
        Metrics::incr(&self.metrics.fetches_total);
        let start = Instant::now();
        info!(repo, commit, paths = paths.as_ref().map(|p| p.len()), "fetching archive");

        let store = self.clone();
        let (repo_owned, commit_owned) = (repo.to_string(), commit.to_string());
        let job = tokio::task::spawn_blocking(move || {
            store.fetch_blocking(&repo_owned, &commit_owned, paths.as_deref(), &tmp)
        });
        let result = match bg.remaining() {
            Some(left) => tokio::time::timeout(left, job)
                .await
                .map_err(|_| SearchError::temporary("archive fetch exceeded background timeout"))
                .and_then(|r| Ok(r??)),
            None => job.await?,
        };

        match &result {
            Ok(stats) => info!(
                repo,
                commit,
                files = stats.files,
                ignored = stats.ignored,
                skipped_large = stats.skipped_large,
                skipped_binary = stats.skipped_binary,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "fetched archive"
            ),
            Err(e) => {
                Metrics::incr(&self.metrics.fetch_failures);
                warn!(repo, commit, error = %e, "archive fetch failed");
            }
        }
        result.map(|_| ())
    }

    fn fetch_blocking(
        &self,
        repo: &str,
        commit: &str,
        paths: Option<&[String]>,
        tmp: &Path,
    ) -> Result<ConvertStats> {
        let ignore = self.source.ignore_file(repo, commit)?;
        let filter = SearchableFilter::new(self.config.max_file_size, &self.config.large_file_patterns)?
            .with_ignore_file(ignore.as_deref())?;
        let tar = match paths {
            Some(paths) => self.source.fetch_tar_paths(repo, commit, paths)?,
            None => self.source.fetch_tar(repo, commit)?,
        };
        tar_to_zip(tar, File::create(tmp)?, &filter)
    }

    /// One eviction pass against the configured ceiling.
    pub async fn evict(&self) -> Result<EvictStats> {
        let disk = self.disk.clone();
        let max_bytes = self.config.max_cache_bytes();
        tokio::task::spawn_blocking(move || disk.evict(max_bytes)).await?
    }

    /// Resize the fetch limiter to the current replica count.
    pub fn refresh_limiter(&self) {
        self.limiter.resize(limiter_size(
            self.source.replica_count(),
            self.config.fetch_limit_per_replica,
        ));
    }

    /// Run eviction and limiter refresh until `ctx` is done.
    pub fn start_maintenance(self: &Arc<Self>, ctx: SearchContext) -> JoinHandle<()> {
        let store = self.clone();
        let evict_every = Duration::from_secs(self.config.eviction_interval_secs.max(1));
        let refresh_every = Duration::from_secs(self.config.limiter_refresh_secs.max(1));
        tokio::spawn(async move {
            let mut evict_tick = tokio::time::interval(evict_every);
            let mut refresh_tick = tokio::time::interval(refresh_every);
            info!(
                cache_dir = %store.disk.dir().display(),
                evict_every_secs = evict_every.as_secs(),
                "store maintenance started"
            );
            loop {
                tokio::select! {
                    _ = ctx.done() => break,
                    _ = evict_tick.tick() => {
                        if let Err(e) = store.evict().await {
                            warn!(error = %e, "eviction pass failed");
                        }
                    }
                    _ = refresh_tick.tick() => store.refresh_limiter(),
                }
            }
            debug!("store maintenance stopped");
        })
    }
}

fn limiter_size(replicas: usize, per_replica: usize) -> usize {
    (replicas.max(1) * per_replica).max(1)
}

/// Malformed archives are retried; a still-running fetch is not.
fn retry_archive(err: &SearchError) -> bool {
    matches!(err, SearchError::Temporary(_) | SearchError::Archive { .. })
}
