//! Collaborators supplying repository content: tar streams of a commit, the
//! commit's ignore file, and path-level diffs between commits.
//!
//! All calls are blocking and are made from blocking tasks.

pub mod git;
pub mod memory;

use crate::error::{Result, SearchError};
use std::io::Read;

pub use git::GitCliSource;
pub use memory::MemorySource;

/// A tar byte stream.
pub type TarReader = Box<dyn Read + Send>;

/// Failure of whatever produces a tar stream, such as `git archive` exiting
/// non-zero or a requested path missing at the commit. Readers return it
/// inside an [`std::io::Error`] so archive conversion can tell it apart from
/// a damaged stream.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProducerError(pub String);

impl ProducerError {
    pub fn io(msg: impl Into<String>) -> std::io::Error {
        std::io::Error::other(Self(msg.into()))
    }

    /// Whether `err` carries a [`ProducerError`].
    pub fn is_producer(err: &std::io::Error) -> bool {
        err.get_ref().is_some_and(|inner| inner.is::<Self>())
    }
}

pub trait TarSource: Send + Sync {
    /// Tar of the whole tree at `commit`.
    fn fetch_tar(&self, repo: &str, commit: &str) -> Result<TarReader>;

    /// Tar of the named paths at `commit`. Reading fails if any path is
    /// absent.
    fn fetch_tar_paths(&self, repo: &str, commit: &str, paths: &[String]) -> Result<TarReader>;

    /// Number of live replicas serving fetches; sizes the fetch limiter.
    fn replica_count(&self) -> usize {
        1
    }
}

pub trait IgnoreSource: Send + Sync {
    /// Raw ignore file at `commit`, or `None` when it does not exist.
    fn ignore_file(&self, repo: &str, commit: &str) -> Result<Option<Vec<u8>>>;
}

pub trait DiffSource: Send + Sync {
    /// Raw `git diff --name-status --no-renames` output from `base` to `head`,
    /// either NUL separated (`-z`) or tab/newline separated.
    fn name_status(&self, repo: &str, base: &str, head: &str) -> Result<Vec<u8>>;
}

/// Everything the service needs from a repository host.
pub trait RepoSource: TarSource + IgnoreSource + DiffSource {}

impl<T: TarSource + IgnoreSource + DiffSource> RepoSource for T {}

/// Paths changed between two commits.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NameStatus {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl NameStatus {
    /// Paths whose indexed version is stale: modified and removed.
    pub fn stale(&self) -> Vec<String> {
        self.modified.iter().chain(&self.removed).cloned().collect()
    }

    /// Paths that only exist, or differ, in the newer commit.
    pub fn unindexed(&self) -> Vec<String> {
        self.added.iter().chain(&self.modified).cloned().collect()
    }
}

/// Parse name-status output.
pub fn parse_name_status(raw: &[u8]) -> Result<NameStatus> {
    let text = String::from_utf8_lossy(raw);
    let mut tokens: Vec<&str> = if text.contains('\0') {
        text.split('\0').collect()
    } else {
        text.split(['\t', '\n']).collect()
    };
    tokens.retain(|t| !t.is_empty());

    if tokens.len() % 2 != 0 {
        return Err(SearchError::Index(format!(
            "malformed name-status output: {} fields",
            tokens.len()
        )));
    }

    let mut out = NameStatus::default();
    for pair in tokens.chunks(2) {
        let (status, path) = (pair[0], pair[1].to_string());
        match status.chars().next() {
            Some('A') => out.added.push(path),
            Some('M') | Some('T') => out.modified.push(path),
            Some('D') => out.removed.push(path),
            _ => {
                return Err(SearchError::Index(format!(
                    "unexpected name-status {:?} for {}",
                    status, path
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nul_separated() {
        let raw = b"M\0changed.go\0A\0added.md\0D\0removed.md\0";
        let ns = parse_name_status(raw).unwrap();
        assert_eq!(ns.added, vec!["added.md"]);
        assert_eq!(ns.modified, vec!["changed.go"]);
        assert_eq!(ns.removed, vec!["removed.md"]);
        assert_eq!(ns.stale(), vec!["changed.go", "removed.md"]);
        assert_eq!(ns.unindexed(), vec!["added.md", "changed.go"]);
    }

    #[test]
    fn test_parse_tab_separated() {
        let raw = b"M\tsrc/with space.go\nT\tlink\nA\tnew.txt\n";
        let ns = parse_name_status(raw).unwrap();
        assert_eq!(ns.modified, vec!["src/with space.go", "link"]);
        assert_eq!(ns.added, vec!["new.txt"]);
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        assert_eq!(parse_name_status(b"").unwrap(), NameStatus::default());
        assert!(parse_name_status(b"M\0only-status\0X\0").is_err());
        assert!(parse_name_status(b"R100\0a\0").is_err());
    }
}
