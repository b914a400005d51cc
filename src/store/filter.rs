//! Per-fetch policy deciding which archive entries are kept and which keep
//! only their path.

use crate::error::Result;
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};

/// Name of the ignore file read from the root of each commit.
pub const IGNORE_FILE: &str = ".sourcegraph/ignore";

#[derive(Debug, Clone)]
struct LargeFileGlob {
    matcher: GlobMatcher,
    negated: bool,
}

/// Decides, per archive entry, whether to drop it entirely (ignored) or keep
/// the path but skip the content (oversized and not allow-listed).
#[derive(Debug, Clone)]
pub struct SearchableFilter {
    ignore: Option<GlobSet>,
    max_file_size: u64,
    large_files: Vec<LargeFileGlob>,
}

fn glob(pattern: &str) -> Result<globset::Glob> {
    Ok(GlobBuilder::new(pattern).literal_separator(true).build()?)
}

impl SearchableFilter {
    /// `large_file_patterns` allow-list files over `max_file_size`. A leading
    /// `!` negates a pattern; `\!` matches a literal `!`.
    pub fn new(max_file_size: u64, large_file_patterns: &[String]) -> Result<Self> {
        let large_files = large_file_patterns
            .iter()
            .map(|p| {
                let (pattern, negated) = if let Some(rest) = p.strip_prefix('!') {
                    (rest, true)
                } else if p.starts_with("\\!") {
                    (&p[1..], false)
                } else {
                    (p.as_str(), false)
                };
                Ok(LargeFileGlob {
                    matcher: glob(pattern)?.compile_matcher(),
                    negated,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            ignore: None,
            max_file_size,
            large_files,
        })
    }

    /// Apply the contents of an ignore file. `None` means the commit has no
    /// ignore file and nothing is ignored.
    pub fn with_ignore_file(mut self, contents: Option<&[u8]>) -> Result<Self> {
        let Some(contents) = contents else {
            self.ignore = None;
            return Ok(self);
        };
        let mut builder = GlobSetBuilder::new();
        let mut count = 0;
        for line in String::from_utf8_lossy(contents).lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.trim_start_matches('/');
            let pattern = if line.ends_with('/') {
                format!("{}**", line)
            } else {
                line.to_string()
            };
            builder.add(glob(&pattern)?);
            count += 1;
        }
        self.ignore = if count == 0 {
            None
        } else {
            Some(builder.build()?)
        };
        Ok(self)
    }

    /// True if the entry must be left out of the archive.
    pub fn ignore(&self, path: &str) -> bool {
        self.ignore.as_ref().is_some_and(|set| set.is_match(path))
    }

    /// True if the entry keeps its path but not its content.
    pub fn skip_content(&self, path: &str, size: u64) -> bool {
        size > self.max_file_size && !self.search_large_file(path)
    }

    /// Last matching pattern wins, scanning from the end; a negated pattern
    /// excludes the file.
    pub fn search_large_file(&self, path: &str) -> bool {
        for g in self.large_files.iter().rev() {
            if g.matcher.is_match(path) {
                return !g.negated;
            }
        }
        false
    }
}
