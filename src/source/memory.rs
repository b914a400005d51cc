//! In-memory repository snapshots. Used by tests and by embedders that
//! already hold file contents.

use crate::error::{Result, SearchError};
use crate::source::{DiffSource, IgnoreSource, ProducerError, TarReader, TarSource};
use crate::store::filter::IGNORE_FILE;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

type Tree = BTreeMap<String, Vec<u8>>;

/// Truncated streams stop halfway into the first entry's data block.
const TRUNCATE_AT: usize = 512 + 256;

#[derive(Default)]
pub struct MemorySource {
    commits: RwLock<HashMap<(String, String), Tree>>,
    fetched: Mutex<Vec<String>>,
    fetch_count: Mutex<usize>,
    truncate: AtomicUsize,
    delay: Mutex<Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the full tree of `commit`.
    pub fn add_commit(&self, repo: &str, commit: &str, files: &[(&str, &[u8])]) {
        let tree = files
            .iter()
            .map(|(name, content)| (name.to_string(), content.to_vec()))
            .collect();
        self.commits
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((repo.to_string(), commit.to_string()), tree);
    }

    /// Every path whose content was put into a tar stream, in fetch order.
    pub fn fetched_paths(&self) -> Vec<String> {
        self.fetched.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Cut the next `n` tar streams short, as a connection dropped mid
    /// transfer would.
    pub fn truncate_next(&self, n: usize) {
        self.truncate.store(n, Ordering::SeqCst);
    }

    /// Block every tar fetch for `delay` before producing the stream.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Number of tar streams handed out.
    pub fn fetch_count(&self) -> usize {
        *self.fetch_count.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tree(&self, repo: &str, commit: &str) -> Result<Tree> {
        self.commits
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(repo.to_string(), commit.to_string()))
            .cloned()
            .ok_or_else(|| SearchError::Fetch {
                repo: repo.to_string(),
                commit: commit.to_string(),
                reason: "revision not found".to_string(),
            })
    }

    fn tar<'a>(&self, files: impl Iterator<Item = (&'a String, &'a Vec<u8>)>) -> Result<TarReader> {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut builder = tar::Builder::new(Vec::new());
        let mut names = Vec::new();
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_slice())?;
            names.push(name.clone());
        }
        let mut bytes = builder.into_inner()?;
        if self
            .truncate
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bytes.truncate(TRUNCATE_AT);
        }
        self.fetched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(names);
        *self.fetch_count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

impl TarSource for MemorySource {
    fn fetch_tar(&self, repo: &str, commit: &str) -> Result<TarReader> {
        let tree = self.tree(repo, commit)?;
        self.tar(tree.iter())
    }

    fn fetch_tar_paths(&self, repo: &str, commit: &str, paths: &[String]) -> Result<TarReader> {
        let tree = self.tree(repo, commit)?;
        if let Some(missing) = paths.iter().find(|p| !tree.contains_key(*p)) {
            return Ok(Box::new(FailingReader(Some(format!(
                "path {} does not exist at {}",
                missing, commit
            )))));
        }
        self.tar(tree.iter().filter(|(name, _)| paths.contains(name)))
    }
}

impl IgnoreSource for MemorySource {
    fn ignore_file(&self, repo: &str, commit: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree(repo, commit)?.get(IGNORE_FILE).cloned())
    }
}

impl DiffSource for MemorySource {
    /// NUL separated, sorted by path.
    fn name_status(&self, repo: &str, base: &str, head: &str) -> Result<Vec<u8>> {
        let old = self.tree(repo, base)?;
        let new = self.tree(repo, head)?;
        let mut changes: BTreeMap<&str, char> = BTreeMap::new();
        for (path, content) in &new {
            match old.get(path) {
                None => {
                    changes.insert(path, 'A');
                }
                Some(prev) if prev != content => {
                    changes.insert(path, 'M');
                }
                Some(_) => {}
            }
        }
        for path in old.keys().filter(|p| !new.contains_key(*p)) {
            changes.insert(path, 'D');
        }

        let mut out = Vec::new();
        for (path, status) in changes {
            out.push(status as u8);
            out.push(0);
            out.extend_from_slice(path.as_bytes());
            out.push(0);
        }
        Ok(out)
    }
}

/// Fails on first read, like a tar stream whose producer exited non-zero.
struct FailingReader(Option<String>);

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        match self.0.take() {
            Some(msg) => Err(ProducerError::io(msg)),
            None => Ok(0),
        }
    }
}
