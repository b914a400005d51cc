//! Repository source backed by local bare repositories and the `git` CLI.

use crate::error::{Result, SearchError};
use crate::source::{DiffSource, IgnoreSource, ProducerError, TarReader, TarSource};
use crate::store::filter::IGNORE_FILE;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use tracing::debug;

pub struct GitCliSource {
    repos_dir: PathBuf,
    git: PathBuf,
}

impl GitCliSource {
    pub fn new(repos_dir: impl Into<PathBuf>, git: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            git: git.into(),
        }
    }

    /// `<repos_dir>/<repo>.git`, falling back to `<repos_dir>/<repo>`.
    fn repo_dir(&self, repo: &str) -> Result<PathBuf> {
        let rel = Path::new(repo);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(SearchError::bad_request(format!("invalid repo name {:?}", repo)));
        }
        let bare = self.repos_dir.join(format!("{}.git", repo));
        if bare.is_dir() {
            return Ok(bare);
        }
        let plain = self.repos_dir.join(rel);
        if plain.is_dir() {
            return Ok(plain);
        }
        Err(SearchError::Fetch {
            repo: repo.to_string(),
            commit: String::new(),
            reason: format!("repository not found under {}", self.repos_dir.display()),
        })
    }

    fn command(&self, repo: &str) -> Result<Command> {
        let dir = self.repo_dir(repo)?;
        let mut cmd = Command::new(&self.git);
        cmd.arg("-C").arg(dir);
        Ok(cmd)
    }

    fn archive(&self, repo: &str, commit: &str, paths: &[String]) -> Result<TarReader> {
        let mut cmd = self.command(repo)?;
        cmd.args(["archive", "--format=tar", commit]);
        if !paths.is_empty() {
            cmd.arg("--").args(paths);
        }
        debug!(repo, commit, paths = paths.len(), "running git archive");
        let reader = ChildReader::spawn(cmd).map_err(|e| SearchError::Fetch {
            repo: repo.to_string(),
            commit: commit.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(reader))
    }
}

impl TarSource for GitCliSource {
    fn fetch_tar(&self, repo: &str, commit: &str) -> Result<TarReader> {
        self.archive(repo, commit, &[])
    }

    fn fetch_tar_paths(&self, repo: &str, commit: &str, paths: &[String]) -> Result<TarReader> {
        self.archive(repo, commit, paths)
    }
}

impl IgnoreSource for GitCliSource {
    fn ignore_file(&self, repo: &str, commit: &str) -> Result<Option<Vec<u8>>> {
        let output = self
            .command(repo)?
            .args(["show", &format!("{}:{}", commit, IGNORE_FILE)])
            .output()?;
        if output.status.success() {
            return Ok(Some(output.stdout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("does not exist") || stderr.contains("exists on disk, but not in") {
            return Ok(None);
        }
        Err(SearchError::Fetch {
            repo: repo.to_string(),
            commit: commit.to_string(),
            reason: format!("git show failed: {}", stderr.trim()),
        })
    }
}

impl DiffSource for GitCliSource {
    fn name_status(&self, repo: &str, base: &str, head: &str) -> Result<Vec<u8>> {
        let output = self
            .command(repo)?
            .args(["diff", "-z", "--name-status", "--no-renames", base, head])
            .output()?;
        if !output.status.success() {
            return Err(SearchError::Index(format!(
                "git diff {}..{} failed: {}",
                base,
                head,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Reads a child's stdout; at EOF the exit status is checked and a failure
/// surfaces as a read error.
struct ChildReader {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
}

impl ChildReader {
    fn spawn(mut cmd: Command) -> io::Result<Self> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;
        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });
        Ok(Self {
            child,
            stdout,
            stderr,
            finished: false,
        })
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        let status = self.child.wait()?;
        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(ProducerError::io(format!(
                "git exited with {}: {}",
                status,
                stderr.trim()
            )))
        }
    }
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.finish()?;
        }
        Ok(n)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::parse_name_status;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) -> Option<String> {
        let out = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.email=t@example.com", "-c", "user.name=t"])
            .args(args)
            .output()
            .ok()?;
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Create a repo with two commits; returns None when git is unavailable.
    fn fixture() -> Option<(TempDir, String, String)> {
        let root = TempDir::new().ok()?;
        let repo = root.path().join("acme");
        std::fs::create_dir_all(&repo).ok()?;
        git(&repo, &["init", "-q"])?;
        std::fs::write(repo.join("a.txt"), "one\n").ok()?;
        std::fs::write(repo.join("b.txt"), "bee\n").ok()?;
        git(&repo, &["add", "."])?;
        git(&repo, &["commit", "-q", "-m", "first"])?;
        let first = git(&repo, &["rev-parse", "HEAD"])?;
        std::fs::write(repo.join("a.txt"), "two\n").ok()?;
        std::fs::remove_file(repo.join("b.txt")).ok()?;
        std::fs::create_dir_all(repo.join(".sourcegraph")).ok()?;
        std::fs::write(repo.join(".sourcegraph/ignore"), "vendor/\n").ok()?;
        git(&repo, &["add", "-A"])?;
        git(&repo, &["commit", "-q", "-m", "second"])?;
        let second = git(&repo, &["rev-parse", "HEAD"])?;
        Some((root, first, second))
    }

    #[test]
    fn test_git_source_round_trip() {
        let Some((root, first, second)) = fixture() else {
            eprintln!("git not available, skipping");
            return;
        };
        let source = GitCliSource::new(root.path(), "git");

        let mut tar = Vec::new();
        source
            .fetch_tar("acme", &first)
            .unwrap()
            .read_to_end(&mut tar)
            .unwrap();
        let mut archive = tar::Archive::new(tar.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.header().entry_type() == tar::EntryType::Regular)
            .map(|e| e.path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);

        assert_eq!(source.ignore_file("acme", &first).unwrap(), None);
        assert_eq!(
            source.ignore_file("acme", &second).unwrap().as_deref(),
            Some(&b"vendor/\n"[..])
        );

        let ns = parse_name_status(&source.name_status("acme", &first, &second).unwrap()).unwrap();
        assert_eq!(ns.modified, vec!["a.txt"]);
        assert_eq!(ns.removed, vec!["b.txt"]);
        assert_eq!(ns.added, vec![".sourcegraph/ignore"]);
    }

    #[test]
    fn test_missing_path_fails_the_read() {
        let Some((root, first, _)) = fixture() else {
            return;
        };
        let source = GitCliSource::new(root.path(), "git");
        let mut reader = source
            .fetch_tar_paths("acme", &first, &["nope.txt".to_string()])
            .unwrap();
        let mut buf = Vec::new();
        assert!(reader.read_to_end(&mut buf).is_err());
    }

    #[test]
    fn test_rejects_path_traversal() {
        let source = GitCliSource::new("/nonexistent", "git");
        let err = source.fetch_tar("../etc", "HEAD").err().unwrap();
        assert!(err.is_bad_request());
    }
}
