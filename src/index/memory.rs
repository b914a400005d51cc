//! In-memory stand-in for the external index: one indexed commit per
//! repository, queries evaluated with the crate's own regex and chunk model.

use crate::context::SearchContext;
use crate::error::Result;
use crate::index::{
    IndexBackend, IndexEvent, IndexFileMatch, IndexQuery, IndexSearchOptions, IndexStream,
};
use crate::search::chunk::{chunk_ranges, chunks_to_matches, locs_to_ranges};
use crate::search::match_tree::merge_matches;
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use regex::bytes::{Regex, RegexBuilder};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::debug;

struct IndexedRepo {
    commit: String,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
pub struct MemoryIndex {
    repos: RwLock<HashMap<String, IndexedRepo>>,
    crashes: AtomicUsize,
    stamps: Mutex<VecDeque<String>>,
    searches: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the indexed snapshot of `repo`.
    pub fn index(&self, repo: &str, commit: &str, files: &[(&str, &[u8])]) {
        let files = files
            .iter()
            .map(|(name, content)| (name.to_string(), content.to_vec()))
            .collect();
        self.repos.write().unwrap_or_else(|e| e.into_inner()).insert(
            repo.to_string(),
            IndexedRepo {
                commit: commit.to_string(),
                files,
            },
        );
    }

    /// The next `n` searches crash on every shard and return nothing.
    pub fn crash_next(&self, n: usize) {
        self.crashes.store(n, Ordering::SeqCst);
    }

    /// Stamp the next search's results with `version`, as if the repository
    /// was reindexed between lookup and search.
    pub fn stamp_next(&self, version: &str) {
        self.stamps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(version.to_string());
    }

    /// Number of `stream_search` calls so far.
    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    fn search_now(&self, ctx: &SearchContext, query: &Compiled, opts: &IndexSearchOptions) -> IndexEvent {
        let stamp = self
            .stamps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let repos = self.repos.read().unwrap_or_else(|e| e.into_inner());
        let mut files = Vec::new();
        let mut remaining = if opts.max_matches == 0 {
            usize::MAX
        } else {
            opts.max_matches
        };

        'repos: for (name, repo) in repos.iter() {
            for (path, content) in &repo.files {
                if remaining == 0 || ctx.is_done() {
                    break 'repos;
                }
                let Some(locs) = query.eval(name, path, content) else {
                    continue;
                };
                let locs = merge_matches(locs, remaining);
                remaining = remaining.saturating_sub(locs.len().max(1));
                let ranges = locs_to_ranges(content, &locs);
                let chunk_matches =
                    chunks_to_matches(content, chunk_ranges(ranges, 0), opts.context_lines);
                files.push(IndexFileMatch {
                    repository: name.clone(),
                    version: stamp.clone().unwrap_or_else(|| repo.commit.clone()),
                    path: path.clone(),
                    chunk_matches,
                    content: opts.whole_file.then(|| content.clone()),
                });
            }
        }
        IndexEvent { files, crashes: 0 }
    }
}

#[async_trait]
impl IndexBackend for MemoryIndex {
    async fn indexed_commit(&self, repo: &str) -> Result<Option<String>> {
        Ok(self
            .repos
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(repo)
            .map(|r| r.commit.clone()))
    }

    async fn stream_search(
        &self,
        ctx: &SearchContext,
        query: IndexQuery,
        opts: IndexSearchOptions,
    ) -> Result<IndexStream> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        debug!(query = %query, "memory index search");
        if self
            .crashes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            let crashed = IndexEvent {
                files: Vec::new(),
                crashes: 1,
            };
            return Ok(stream::iter(vec![Ok(crashed)]).boxed());
        }

        let compiled = Compiled::new(&query)?;
        let event = self.search_now(ctx, &compiled, &opts);
        // one event per file, like a streaming backend
        let events: Vec<Result<IndexEvent>> = event
            .files
            .into_iter()
            .map(|f| {
                Ok(IndexEvent {
                    files: vec![f],
                    crashes: 0,
                })
            })
            .collect();
        Ok(stream::iter(events).boxed())
    }
}

/// [`IndexQuery`] with regexes compiled once.
enum Compiled {
    Const(bool),
    Repo(String),
    Regexp {
        re: Regex,
        content: bool,
        file_name: bool,
    },
    Names(BTreeSet<String>),
    Not(Box<Compiled>),
    And(Vec<Compiled>),
    Or(Vec<Compiled>),
}

impl Compiled {
    fn new(query: &IndexQuery) -> Result<Self> {
        Ok(match query {
            IndexQuery::Const(b) => Compiled::Const(*b),
            IndexQuery::Repo(r) => Compiled::Repo(r.clone()),
            IndexQuery::Regexp {
                pattern,
                case_sensitive,
                content,
                file_name,
            } => {
                let either = !content && !file_name;
                Compiled::Regexp {
                    re: RegexBuilder::new(pattern)
                        .case_insensitive(!case_sensitive)
                        .build()?,
                    content: *content || either,
                    file_name: *file_name || either,
                }
            }
            IndexQuery::FileNameSet(names) => Compiled::Names(names.clone()),
            IndexQuery::Not(q) => Compiled::Not(Box::new(Self::new(q)?)),
            IndexQuery::And(qs) => {
                Compiled::And(qs.iter().map(Self::new).collect::<Result<_>>()?)
            }
            IndexQuery::Or(qs) => Compiled::Or(qs.iter().map(Self::new).collect::<Result<_>>()?),
            IndexQuery::Boost { query, .. } => Self::new(query)?,
        })
    }

    /// Content match offsets if the file matches; a match on anything other
    /// than content yields no offsets.
    fn eval(&self, repo: &str, path: &str, content: &[u8]) -> Option<Vec<(usize, usize)>> {
        match self {
            Compiled::Const(b) => b.then(Vec::new),
            Compiled::Repo(r) => (r == repo).then(Vec::new),
            Compiled::Names(names) => names.contains(path).then(Vec::new),
            Compiled::Regexp {
                re,
                content: in_content,
                file_name,
            } => {
                if *in_content {
                    let locs: Vec<_> = re.find_iter(content).map(|m| (m.start(), m.end())).collect();
                    if !locs.is_empty() {
                        return Some(locs);
                    }
                }
                (*file_name && re.is_match(path.as_bytes())).then(Vec::new)
            }
            Compiled::Not(q) => match q.eval(repo, path, content) {
                Some(_) => None,
                None => Some(Vec::new()),
            },
            Compiled::And(qs) => {
                let mut all = Vec::new();
                for q in qs {
                    all.extend(q.eval(repo, path, content)?);
                }
                Some(merge_matches(all, usize::MAX))
            }
            Compiled::Or(qs) => {
                let mut any = false;
                let mut all = Vec::new();
                for q in qs {
                    if let Some(locs) = q.eval(repo, path, content) {
                        any = true;
                        all.extend(locs);
                    }
                }
                any.then(|| merge_matches(all, usize::MAX))
            }
        }
    }
}
