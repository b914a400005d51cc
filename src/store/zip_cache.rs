//! Sharded, reference-counted cache of memory-mapped zip archives.
//!
//! Archives are written uncompressed, so after indexing the central directory
//! once every file is a plain slice of the mapping. Entries are reference
//! counted; deleting an entry waits until every handle has been dropped.

use crate::error::{Result, SearchError};
use crate::metrics::SharedMetrics;
use memmap2::Mmap;
use rustc_hash::{FxHashMap, FxHasher};
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, warn};

const NUM_SHARDS: usize = 8;

/// Index entry of one file inside a zip's backing buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcFile {
    pub name: String,
    pub offset: i64,
    pub length: i32,
}

enum Backing {
    Mapped { mmap: Mmap, _file: File },
    Memory(Vec<u8>),
}

/// An indexed zip archive, immutable after construction.
pub struct ZipFile {
    path: PathBuf,
    backing: Backing,
    files: Vec<SrcFile>,
    refs: Mutex<usize>,
    drained: Condvar,
}

impl ZipFile {
    /// Map an archive from disk and index its entries.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: cached archives are written once via rename and never
        // modified in place; eviction waits for all handles before removal.
        let mmap = unsafe { Mmap::map(&file)? };
        #[cfg(unix)]
        if let Err(e) = mmap.advise(memmap2::Advice::Sequential) {
            debug!(path = %path.display(), error = %e, "madvise failed");
        }
        let files = index_entries(path, &mmap)?;
        Ok(Self {
            path: path.to_path_buf(),
            backing: Backing::Mapped { mmap, _file: file },
            files,
            refs: Mutex::new(0),
            drained: Condvar::new(),
        })
    }

    /// Index an archive held in memory.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let path = PathBuf::from("<memory>");
        let files = index_entries(&path, &bytes)?;
        Ok(Self {
            path,
            backing: Backing::Memory(bytes),
            files,
            refs: Mutex::new(0),
            drained: Condvar::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries sorted by offset.
    pub fn files(&self) -> &[SrcFile] {
        &self.files
    }

    /// Zero-copy view of a file's content.
    pub fn data_for(&self, file: &SrcFile) -> &[u8] {
        let start = file.offset as usize;
        &self.bytes()[start..start + file.length as usize]
    }

    /// Like [`data_for`](Self::data_for), reporting entries that point
    /// outside the buffer instead of panicking.
    pub fn checked_data_for(&self, file: &SrcFile) -> Result<&[u8]> {
        let start = usize::try_from(file.offset).ok();
        let len = usize::try_from(file.length).ok();
        start
            .zip(len)
            .and_then(|(start, len)| self.bytes().get(start..start.checked_add(len)?))
            .ok_or_else(|| SearchError::Archive {
                path: self.path.clone(),
                reason: format!("entry {} lies outside the archive", file.name),
            })
    }

    fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped { mmap, .. } => mmap,
            Backing::Memory(bytes) => bytes,
        }
    }

    fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped { .. })
    }

    /// Take a counted reference.
    pub fn acquire(self: &Arc<Self>) -> ZipHandle {
        *self.refs.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        ZipHandle { zf: self.clone() }
    }

    fn release(&self) {
        let mut refs = self.refs.lock().unwrap_or_else(|e| e.into_inner());
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut refs = self.refs.lock().unwrap_or_else(|e| e.into_inner());
        while *refs > 0 {
            refs = self.drained.wait(refs).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn ref_count(&self) -> usize {
        *self.refs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn index_entries(path: &Path, bytes: &[u8]) -> Result<Vec<SrcFile>> {
    let archive_err = |reason: String| SearchError::Archive {
        path: path.to_path_buf(),
        reason,
    };

    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| archive_err(e.to_string()))?;
    let mut files = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .map_err(|e| archive_err(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        if entry.compression() != zip::CompressionMethod::Stored {
            return Err(archive_err(format!(
                "file {} is compressed with {:?}, only stored entries are supported",
                entry.name(),
                entry.compression()
            )));
        }
        let length = i32::try_from(entry.compressed_size())
            .map_err(|_| archive_err(format!("file {} is larger than 2GiB", entry.name())))?;
        let offset = i64::try_from(entry.data_start())
            .map_err(|_| archive_err(format!("file {} has an invalid offset", entry.name())))?;
        files.push(SrcFile {
            name: entry.name().to_string(),
            offset,
            length,
        });
    }
    files.sort_by_key(|f| f.offset);
    Ok(files)
}

/// Counted reference to a cached archive, released on drop.
pub struct ZipHandle {
    zf: Arc<ZipFile>,
}

impl Deref for ZipHandle {
    type Target = ZipFile;

    fn deref(&self) -> &ZipFile {
        &self.zf
    }
}

impl Drop for ZipHandle {
    fn drop(&mut self) {
        self.zf.release();
    }
}

type Shard = Mutex<FxHashMap<PathBuf, Arc<ZipFile>>>;

pub struct ZipCache {
    shards: Vec<Shard>,
    metrics: SharedMetrics,
}

impl ZipCache {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(FxHashMap::default())).collect(),
            metrics,
        }
    }

    fn shard_for(&self, path: &Path) -> &Shard {
        let mut hasher = FxHasher::default();
        path.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    /// Return a handle to the archive at `path`, mapping it on first use.
    pub fn get(&self, path: &Path) -> Result<ZipHandle> {
        let mut shard = self.shard_for(path).lock().unwrap_or_else(|e| e.into_inner());
        if let Some(zf) = shard.get(path) {
            crate::metrics::Metrics::incr(&self.metrics.zip_cache_hits);
            return Ok(zf.acquire());
        }
        crate::metrics::Metrics::incr(&self.metrics.zip_cache_misses);
        let zf = Arc::new(ZipFile::open(path)?);
        debug!(path = %path.display(), files = zf.files().len(), "mapped archive");
        let handle = zf.acquire();
        shard.insert(path.to_path_buf(), zf);
        Ok(handle)
    }

    /// Register an in-memory archive under `path`.
    pub fn insert(&self, path: &Path, zf: ZipFile) {
        let mut shard = self.shard_for(path).lock().unwrap_or_else(|e| e.into_inner());
        shard.insert(path.to_path_buf(), Arc::new(zf));
    }

    /// Remove an archive, blocking until all handles are dropped.
    pub fn delete(&self, path: &Path) {
        let mut shard = self.shard_for(path).lock().unwrap_or_else(|e| e.into_inner());
        let Some(zf) = shard.get(path).cloned() else {
            return;
        };
        zf.wait_drained();
        shard.remove(path);
        if zf.is_mapped() && Arc::strong_count(&zf) > 1 {
            warn!(path = %path.display(), "archive still referenced after delete");
        }
        debug!(path = %path.display(), "unmapped archive");
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.shard_for(path)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }
}
