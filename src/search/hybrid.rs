//! Hybrid search: answer from the external index for every path unchanged
//! since the indexed commit, and leave only the changed paths for a live
//! search.

use crate::config::HybridConfig;
use crate::context::{ContextError, SearchContext};
use crate::error::{Result, SearchError};
use crate::index::{IndexBackend, IndexFileMatch, IndexQuery, IndexSearchOptions};
use crate::metrics::SharedMetrics;
use crate::protocol::FileMatch;
use crate::search::engine::Matcher;
use crate::search::sink::LimitedStream;
use crate::source::{parse_name_status, RepoSource};
use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a hybrid search ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HybridResult {
    /// Index results were delivered; these paths still need a live search.
    Searched { unindexed: Vec<String> },
    /// Hybrid search does not apply; search the whole commit live.
    Fallback { reason: &'static str },
}

/// Why an attempt ended without results.
enum Attempt {
    Done(HybridResult),
    Retry(&'static str),
}

pub struct HybridSearcher {
    index: Arc<dyn IndexBackend>,
    source: Arc<dyn RepoSource>,
    config: HybridConfig,
    metrics: SharedMetrics,
}

impl HybridSearcher {
    pub fn new(
        index: Arc<dyn IndexBackend>,
        source: Arc<dyn RepoSource>,
        config: HybridConfig,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            index,
            source,
            config,
            metrics,
        }
    }

    /// Run up to `max_attempts` rounds against the index.
    ///
    /// Index results reach `sink` as each event arrives. A round that sees a
    /// result stamped with another commit is abandoned and retried; paths
    /// already delivered are excluded from later rounds.
    ///
    /// A canceled context is handled here and reported as a finished search
    /// with nothing left to do. A passed deadline is an error.
    pub async fn search(
        &self,
        ctx: &SearchContext,
        repo: &str,
        commit: &str,
        matcher: &Matcher,
        context_lines: u32,
        sink: &LimitedStream,
    ) -> Result<HybridResult> {
        let mut last_reason = "exhausted";
        let mut sent = BTreeSet::new();
        for attempt in 1..=self.config.max_attempts.max(1) {
            let outcome = self
                .attempt(ctx, repo, commit, matcher, context_lines, sink, &mut sent)
                .await;
            let outcome = match outcome {
                Err(e) if e.is_context_error() => match ctx.err() {
                    Some(ContextError::DeadlineExceeded) => {
                        self.metrics.record_hybrid("deadline_exceeded");
                        return Err(SearchError::DeadlineExceeded);
                    }
                    _ => {
                        self.metrics.record_hybrid("canceled");
                        debug!(repo, commit, "hybrid search canceled");
                        return Ok(HybridResult::Searched {
                            unindexed: Vec::new(),
                        });
                    }
                },
                Err(e) => {
                    self.metrics.record_hybrid("error");
                    return Err(e);
                }
                Ok(outcome) => outcome,
            };

            match outcome {
                Attempt::Done(result) => {
                    let state = match &result {
                        HybridResult::Searched { .. } => "success",
                        HybridResult::Fallback { reason } => *reason,
                    };
                    self.metrics.record_hybrid(state);
                    info!(repo, commit, attempt, state, "hybrid search finished");
                    return Ok(result);
                }
                Attempt::Retry(reason) => {
                    warn!(repo, commit, attempt, reason, "retrying hybrid search");
                    last_reason = reason;
                }
            }
        }

        info!(repo, commit, last_reason, "hybrid search attempts exhausted");
        self.metrics.record_hybrid("exhausted");
        Ok(HybridResult::Fallback {
            reason: "exhausted",
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        ctx: &SearchContext,
        repo: &str,
        commit: &str,
        matcher: &Matcher,
        context_lines: u32,
        sink: &LimitedStream,
        sent: &mut BTreeSet<String>,
    ) -> Result<Attempt> {
        ctx.check()?;
        let Some(indexed) = self.index.indexed_commit(repo).await? else {
            return Ok(Attempt::Done(HybridResult::Fallback {
                reason: "unindexed",
            }));
        };

        let (stale, unindexed) = if indexed == commit {
            (Vec::new(), Vec::new())
        } else {
            let source = self.source.clone();
            let (r, base, head) = (repo.to_string(), indexed.clone(), commit.to_string());
            let raw = tokio::task::spawn_blocking(move || source.name_status(&r, &base, &head)).await??;
            let status = parse_name_status(&raw)?;
            (status.stale(), status.unindexed())
        };
        ctx.check()?;

        let total = |paths: &[String]| paths.iter().map(|p| p.len()).sum::<usize>();
        if total(&stale) > self.config.max_total_paths_length
            || total(&unindexed) > self.config.max_total_paths_length
        {
            return Ok(Attempt::Done(HybridResult::Fallback {
                reason: "diff_too_large",
            }));
        }
        debug!(
            repo,
            indexed = %indexed,
            commit,
            stale = stale.len(),
            unindexed = unindexed.len(),
            "hybrid diff"
        );

        // paths answered by an earlier attempt stay answered
        let unindexed: Vec<String> = unindexed.into_iter().filter(|p| !sent.contains(p)).collect();
        let mut skip = stale;
        skip.extend(sent.iter().cloned());
        let query = index_query(repo, &skip, matcher);
        let opts = IndexSearchOptions {
            max_matches: sink.remaining(),
            context_lines,
            whole_file: false,
        };
        let mut stream = self.index.stream_search(ctx, query, opts).await?;

        let mut crashes = 0;
        let mut delivered = 0;
        while let Some(event) = stream.next().await {
            ctx.check()?;
            let event = event?;
            crashes += event.crashes;
            if let Some(stray) = event.files.iter().find(|f| f.version != indexed) {
                debug!(
                    path = %stray.path,
                    version = %stray.version,
                    expected = %indexed,
                    delivered,
                    "index changed during search"
                );
                return Ok(Attempt::Retry("version_mismatch"));
            }
            for f in event.files {
                if sent.insert(f.path.clone()) {
                    delivered += 1;
                    sink.send(into_file_match(f));
                }
            }
            // the limit cancels the context; stop pulling from the index
            ctx.check()?;
        }
        if crashes > 0 && delivered == 0 {
            return Ok(Attempt::Retry("index_crashed"));
        }

        Ok(Attempt::Done(HybridResult::Searched { unindexed }))
    }
}

/// Restrict the pattern to `repo`, drop paths whose indexed copy is stale and
/// apply the request's path filters.
pub fn index_query(repo: &str, stale: &[String], matcher: &Matcher) -> IndexQuery {
    let (match_content, match_path) = matcher.match_targets();
    let mut conjuncts = vec![IndexQuery::Repo(repo.to_string())];
    if !stale.is_empty() {
        let names: BTreeSet<String> = stale.iter().cloned().collect();
        conjuncts.push(IndexQuery::not(IndexQuery::FileNameSet(names)));
    }
    let file_name = |pattern: &str| IndexQuery::Regexp {
        pattern: pattern.to_string(),
        case_sensitive: true,
        content: false,
        file_name: true,
    };
    let paths = matcher.path_filter();
    conjuncts.extend(paths.include_patterns().map(file_name));
    if let Some(exclude) = paths.exclude_pattern() {
        conjuncts.push(IndexQuery::not(file_name(exclude)));
    }
    conjuncts.push(matcher.tree().to_index_query(match_content, match_path));
    IndexQuery::And(conjuncts).simplify()
}

fn into_file_match(f: IndexFileMatch) -> FileMatch {
    FileMatch {
        path: f.path,
        chunk_matches: f.chunk_matches,
        limit_hit: false,
    }
}
