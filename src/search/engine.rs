//! Matching engine: runs a compiled [`Matcher`] over every file of an
//! archive on a pool of workers and streams results into a
//! [`LimitedStream`].

use crate::context::{ContextError, SearchContext};
use crate::error::{Result, SearchError};
use crate::protocol::{FileMatch, PatternInfo};
use crate::search::chunk::{chunk_ranges, chunks_to_matches, locs_to_ranges};
use crate::search::match_tree::MatchTree;
use crate::search::path_filter::PathFilter;
use crate::search::sink::LimitedStream;
use crate::store::ZipFile;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Fraction of the remaining time a search may use, leaving room to flush
/// partial results before the caller's deadline.
const DEADLINE_FRACTION: f64 = 0.9;

/// Everything needed to test one file, compiled once per request and cloned
/// per worker.
#[derive(Debug, Clone)]
pub struct Matcher {
    tree: MatchTree,
    case_sensitive: bool,
    paths: PathFilter,
    match_content: bool,
    match_path: bool,
    context_lines: u32,
}

impl Matcher {
    pub fn new(info: &PatternInfo, context_lines: u32) -> Result<Self> {
        let tree = MatchTree::from_query(&info.query, info.is_word_match, info.is_case_sensitive)?;
        let paths = PathFilter::new(
            &info.include_paths,
            &info.exclude_paths,
            info.path_patterns_are_case_sensitive,
        )?;
        let (match_content, match_path) = info.match_targets();
        Ok(Self {
            tree,
            case_sensitive: info.is_case_sensitive,
            paths,
            match_content,
            match_path,
            context_lines,
        })
    }

    pub fn tree(&self) -> &MatchTree {
        &self.tree
    }

    pub fn path_filter(&self) -> &PathFilter {
        &self.paths
    }

    pub fn match_targets(&self) -> (bool, bool) {
        (self.match_content, self.match_path)
    }

    /// No content needs to be read: there is no pattern, or only paths are
    /// matched.
    pub fn is_path_only(&self) -> bool {
        matches!(self.tree, MatchTree::All) || !self.match_content
    }

    /// Path-level test used when no content is read.
    pub fn matches_path(&self, path: &str) -> bool {
        if !self.paths.matches(path) {
            return false;
        }
        matches!(self.tree, MatchTree::All) || self.tree_matches_path(path)
    }

    fn tree_matches_path(&self, path: &str) -> bool {
        if self.case_sensitive {
            self.tree.matches_string(path)
        } else {
            self.tree.matches_string(&path.to_ascii_lowercase())
        }
    }

    /// Test one file. At most `limit + 1` ranges are collected so the sink
    /// can tell an exactly-full budget from an overflowing one.
    pub fn search_file(
        &self,
        path: &str,
        buf: &[u8],
        limit: usize,
        scratch: &mut Vec<u8>,
    ) -> Option<FileMatch> {
        if !self.paths.matches(path) {
            return None;
        }
        let path_matched = self.match_path && self.tree_matches_path(path);
        if !self.match_content {
            return path_matched.then(|| FileMatch::path_only(path));
        }

        let haystack: &[u8] = if self.case_sensitive {
            buf
        } else {
            scratch.clear();
            scratch.extend_from_slice(buf);
            scratch.make_ascii_lowercase();
            scratch
        };
        let (matched, locs) = self.tree.matches_file(haystack, limit.saturating_add(1));
        if !matched {
            return path_matched.then(|| FileMatch::path_only(path));
        }
        if locs.is_empty() {
            return Some(FileMatch::path_only(path));
        }

        // ASCII lowering keeps byte offsets, so ranges and content come from
        // the original buffer
        let ranges = locs_to_ranges(buf, &locs);
        let chunk_matches = chunks_to_matches(buf, chunk_ranges(ranges, 0), self.context_lines);
        Some(FileMatch {
            path: path.to_string(),
            chunk_matches,
            limit_hit: false,
        })
    }
}

/// Search every file of `zf`, delivering matches into `sink`.
///
/// Runs until all files are searched, the sink's budget is spent or its
/// context is done. With a deadline, only [`DEADLINE_FRACTION`] of the
/// remaining time is used and running out of it is reported as
/// [`SearchError::Timeout`] after partial results were delivered.
pub fn search_zip(zf: &ZipFile, matcher: &Matcher, sink: &LimitedStream, workers: usize) -> Result<()> {
    let base = sink.context();
    let budget = base.remaining().map(|left| left.mul_f64(DEADLINE_FRACTION));
    let ctx = match budget {
        Some(budget) => base.with_timeout(budget),
        None => base.child(),
    };
    let start = Instant::now();

    if matcher.is_path_only() {
        for file in zf.files() {
            if ctx.is_done() {
                break;
            }
            if matcher.matches_path(&file.name) {
                sink.send(FileMatch::path_only(file.name.as_str()));
            }
        }
    } else {
        let files = zf.files();
        let cursor = AtomicUsize::new(0);
        let first_err: Mutex<Option<SearchError>> = Mutex::new(None);
        let ctx = &ctx;
        rayon::scope(|s| {
            for _ in 0..workers.max(1) {
                s.spawn(|_| {
                    let matcher = matcher.clone();
                    let mut scratch = Vec::new();
                    while !ctx.is_done() {
                        let Some(file) = files.get(cursor.fetch_add(1, Ordering::Relaxed)) else {
                            break;
                        };
                        let buf = match zf.checked_data_for(file) {
                            Ok(buf) => buf,
                            Err(e) => {
                                first_err
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .get_or_insert(e);
                                ctx.cancel();
                                break;
                            }
                        };
                        if let Some(fm) = matcher.search_file(&file.name, buf, sink.remaining(), &mut scratch) {
                            sink.send(fm);
                        }
                    }
                });
            }
        });
        if let Some(err) = first_err.into_inner().unwrap_or_else(|e| e.into_inner()) {
            return Err(err);
        }
    }

    debug!(
        files = zf.files().len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        limit_hit = sink.limit_hit(),
        "searched archive"
    );

    finish(base, &ctx, budget, sink.limit_hit())
}

/// A spent budget is success; a done caller context is its own error; only
/// running out of the shortened deadline is a timeout.
fn finish(
    base: &SearchContext,
    ctx: &SearchContext,
    budget: Option<Duration>,
    limit_hit: bool,
) -> Result<()> {
    if limit_hit {
        return Ok(());
    }
    base.check()?;
    match (ctx.err(), budget) {
        (Some(ContextError::DeadlineExceeded), Some(budget)) => Err(SearchError::Timeout {
            millis: budget.as_millis() as u64,
        }),
        _ => Ok(()),
    }
}
