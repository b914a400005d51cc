//! Request orchestration: validation, hybrid search, archive preparation and
//! the regex or structural search over it.

use crate::config::Config;
use crate::context::SearchContext;
use crate::error::{Result, SearchError};
use crate::index::IndexBackend;
use crate::metrics::{Metrics, SharedMetrics};
use crate::protocol::{DoneEvent, FileMatch, Request};
use crate::search::{search_zip, HybridResult, HybridSearcher, LimitedStream, Matcher, StructuralSearcher};
use crate::source::RepoSource;
use crate::store::Store;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

/// One item of a response stream. Every stream ends with exactly one
/// [`SearchEvent::Done`].
#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    Match(FileMatch),
    Done(DoneEvent),
}

pub struct Service {
    config: Config,
    store: Arc<Store>,
    index: Arc<dyn IndexBackend>,
    hybrid: HybridSearcher,
    structural: StructuralSearcher,
    metrics: SharedMetrics,
}

impl Service {
    pub fn new(
        config: Config,
        source: Arc<dyn RepoSource>,
        index: Arc<dyn IndexBackend>,
        metrics: SharedMetrics,
    ) -> Result<Self> {
        let store = Arc::new(Store::new(config.store.clone(), source.clone(), metrics.clone())?);
        let hybrid = HybridSearcher::new(index.clone(), source, config.hybrid.clone(), metrics.clone());
        let structural = StructuralSearcher::new(config.structural.clone(), metrics.clone());
        Ok(Self {
            config,
            store,
            index,
            hybrid,
            structural,
            metrics,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate `req` and start searching it in the background.
    ///
    /// Invalid requests fail here, before any event is produced. Otherwise
    /// the returned receiver yields matches followed by one done event;
    /// canceling `ctx` stops the search early. The search runs under the
    /// request's deadline, or the configured one.
    pub fn start(
        self: &Arc<Self>,
        ctx: &SearchContext,
        req: Request,
    ) -> Result<mpsc::UnboundedReceiver<SearchEvent>> {
        req.validate()?;
        if !req.pattern_info.is_structural {
            Matcher::new(&req.pattern_info, 0)?;
        }

        let ctx = match self.config.search.timeout(req.timeout_ms) {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.child(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let limit = match req.pattern_info.limit {
            0 => self.config.search.default_limit,
            n => n,
        };
        let match_tx = tx.clone();
        let sink = Arc::new(LimitedStream::new(
            &ctx,
            limit,
            Arc::new(move |m| {
                // receiver gone means the caller went away; the context
                // stops the search
                let _ = match_tx.send(SearchEvent::Match(m));
            }),
        ));

        let span = tracing::info_span!("search", repo = %req.repo, commit = %req.commit);
        let this = self.clone();
        tokio::spawn(
            async move {
                let running = this.metrics.search_started();
                let started = Instant::now();
                let result = this.run(&req, &sink).await;
                let done = this.done_event(result, &sink, started);
                drop(running);
                let _ = tx.send(SearchEvent::Done(done));
            }
            .instrument(span),
        );
        Ok(rx)
    }

    /// Run `req` to completion, collecting every event.
    pub async fn search(self: &Arc<Self>, ctx: &SearchContext, req: Request) -> Result<(Vec<FileMatch>, DoneEvent)> {
        let mut rx = self.start(ctx, req)?;
        let mut matches = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                SearchEvent::Match(m) => matches.push(m),
                SearchEvent::Done(done) => return Ok((matches, done)),
            }
        }
        Err(SearchError::Canceled)
    }

    fn done_event(&self, result: Result<()>, sink: &LimitedStream, started: Instant) -> DoneEvent {
        let limit_hit = sink.limit_hit();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let error = match result {
            Ok(()) => String::new(),
            // reaching the limit cancels the search on purpose
            Err(e) if e.is_context_error() && limit_hit => String::new(),
            Err(e) => {
                Metrics::incr(&self.metrics.search_errors);
                warn!(error = %e, code = e.code(), elapsed_ms, "search failed");
                return DoneEvent {
                    limit_hit,
                    error: e.to_string(),
                };
            }
        };
        info!(limit_hit, elapsed_ms, "search finished");
        DoneEvent { limit_hit, error }
    }

    async fn run(&self, req: &Request, sink: &Arc<LimitedStream>) -> Result<()> {
        let info = &req.pattern_info;
        let context_lines = req.context_lines();
        let ctx = sink.context();

        if info.is_structural && req.indexed {
            debug!("structural search over the index");
            return self
                .structural
                .search_index(self.index.as_ref(), &req.repo, info, context_lines, sink)
                .await;
        }

        let matcher = Matcher::new(info, context_lines)?;
        let mut paths = None;
        if self.use_hybrid(req) {
            match self
                .hybrid
                .search(ctx, &req.repo, &req.commit, &matcher, context_lines, sink)
                .await?
            {
                HybridResult::Searched { unindexed } if unindexed.is_empty() => return Ok(()),
                HybridResult::Searched { unindexed } => {
                    debug!(paths = unindexed.len(), "searching unindexed paths");
                    paths = Some(unindexed);
                }
                HybridResult::Fallback { reason } => {
                    debug!(reason, "hybrid search not applicable");
                }
            }
        }
        ctx.check()?;

        let fetch_timeout = match req.fetch_timeout_ms {
            0 => self.store.config().fetch_timeout(),
            ms => Duration::from_millis(ms),
        };
        let zf = self
            .store
            .open_zip(ctx, &req.repo, &req.commit, paths.as_deref(), Some(fetch_timeout))
            .await?;

        if info.is_structural {
            return self.structural.search_zip(zf, info, context_lines, sink).await;
        }

        let workers = self.config.search.worker_count();
        let sink = sink.clone();
        tokio::task::spawn_blocking(move || search_zip(&zf, &matcher, &sink, workers)).await?
    }

    fn use_hybrid(&self, req: &Request) -> bool {
        req.indexed && req.feat_hybrid && self.config.hybrid.enabled && !req.pattern_info.is_structural
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{MemoryIndex, NoIndex};
    use crate::protocol::{PatternInfo, QueryNode};
    use crate::source::MemorySource;
    use tempfile::TempDir;

    const OLD: &str = "1111111111111111111111111111111111111111";
    const NEW: &str = "2222222222222222222222222222222222222222";

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.store.cache_dir = dir.path().join("cache");
        config.store.fetch_timeout_ms = 10_000;
        config
    }

    fn request(commit: &str, pattern: &str) -> Request {
        Request {
            repo: "acme/widgets".into(),
            commit: commit.into(),
            feat_hybrid: true,
            pattern_info: PatternInfo {
                query: QueryNode::regexp(pattern),
                limit: 100,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn source() -> Arc<MemorySource> {
        let source = Arc::new(MemorySource::new());
        source.add_commit(
            "acme/widgets",
            OLD,
            &[
                ("README.md", b"# Hello World\n"),
                ("main.go", b"package main\n\nfunc main() {\n\tfmt.Println(\"Hello World\")\n}\n"),
                ("unchanged.md", b"Hello again\n"),
            ],
        );
        source.add_commit(
            "acme/widgets",
            NEW,
            &[
                ("README.md", b"# Hello World\n"),
                ("main.go", b"package main\n\nfunc main() {\n\tfmt.Println(\"Hello World\")\n}\n"),
                ("unchanged.md", b"Hello again\n"),
                ("added.md", b"Hello from a new file\n"),
            ],
        );
        source
    }

    fn service(dir: &TempDir, source: Arc<MemorySource>, index: Arc<dyn IndexBackend>) -> Arc<Service> {
        Arc::new(Service::new(config(dir), source, index, Metrics::new()).unwrap())
    }

    #[tokio::test]
    async fn test_plain_search() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, source(), Arc::new(NoIndex));
        let (mut matches, done) = svc
            .search(&SearchContext::background(), request(OLD, "World"))
            .await
            .unwrap();
        matches.sort_by(|a, b| a.path.cmp(&b.path));
        let paths: Vec<_> = matches.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "main.go"]);
        assert_eq!(done, DoneEvent::default());
        assert_eq!(svc.metrics().snapshot().searches_total, 1);
        assert_eq!(svc.metrics().snapshot().running_searches, 0);
    }

    #[tokio::test]
    async fn test_invalid_request_fails_before_streaming() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, source(), Arc::new(NoIndex));
        let err = svc
            .start(&SearchContext::background(), request("HEAD", "x"))
            .unwrap_err();
        assert!(err.is_bad_request());
        let err = svc
            .start(&SearchContext::background(), request(OLD, "(unclosed"))
            .unwrap_err();
        assert!(err.is_bad_request());
    }

    #[tokio::test]
    async fn test_limit_is_reported() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, source(), Arc::new(NoIndex));
        let mut req = request(OLD, "l");
        req.pattern_info.limit = 2;
        let (matches, done) = svc.search(&SearchContext::background(), req).await.unwrap();
        let total: usize = matches.iter().map(FileMatch::match_count).sum();
        assert_eq!(total, 2);
        assert!(done.limit_hit);
        assert!(done.error.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_error_is_embedded_in_done() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, source(), Arc::new(NoIndex));
        let unknown = "3333333333333333333333333333333333333333";
        let (matches, done) = svc
            .search(&SearchContext::background(), request(unknown, "x"))
            .await
            .unwrap();
        assert!(matches.is_empty());
        assert!(done.error.contains("revision not found"), "{}", done.error);
        assert_eq!(svc.metrics().snapshot().search_errors, 1);
    }

    #[tokio::test]
    async fn test_hybrid_searches_only_changed_paths_live() {
        let dir = TempDir::new().unwrap();
        let source = source();
        let index = Arc::new(MemoryIndex::new());
        index.index(
            "acme/widgets",
            OLD,
            &[
                ("README.md", b"# Hello World\n"),
                ("main.go", b"package main\n\nfunc main() {\n\tfmt.Println(\"Hello World\")\n}\n"),
                ("unchanged.md", b"Hello again\n"),
            ],
        );
        let svc = service(&dir, source.clone(), index);
        let mut req = request(NEW, "Hello");
        req.indexed = true;
        let (mut matches, done) = svc.search(&SearchContext::background(), req).await.unwrap();
        assert!(done.error.is_empty(), "{}", done.error);
        matches.sort_by(|a, b| a.path.cmp(&b.path));
        let paths: Vec<_> = matches.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "added.md", "main.go", "unchanged.md"]);

        let fetched = source.fetched_paths();
        assert!(fetched.iter().all(|p| p != "unchanged.md"), "{:?}", fetched);
        assert!(fetched.iter().any(|p| p == "added.md"), "{:?}", fetched);
        assert_eq!(svc.metrics().snapshot().hybrid_outcomes.get("success"), Some(&1));
    }

    #[tokio::test]
    async fn test_hybrid_disabled_by_request() {
        let dir = TempDir::new().unwrap();
        let source = source();
        let index = Arc::new(MemoryIndex::new());
        index.index("acme/widgets", OLD, &[("README.md", b"# Hello World\n")]);
        let svc = service(&dir, source.clone(), index.clone());
        let mut req = request(NEW, "Hello");
        req.indexed = true;
        req.feat_hybrid = false;
        let (matches, _) = svc.search(&SearchContext::background(), req).await.unwrap();
        assert_eq!(matches.len(), 4);
        assert_eq!(index.searches(), 0);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_request_deadline_is_reported() {
        let dir = TempDir::new().unwrap();
        let source = source();
        source.set_fetch_delay(Duration::from_millis(500));
        let svc = service(&dir, source, Arc::new(NoIndex));
        let mut req = request(OLD, "Hello");
        req.timeout_ms = 50;

        let started = Instant::now();
        let (matches, done) = svc.search(&SearchContext::background(), req).await.unwrap();
        assert!(matches.is_empty());
        assert_eq!(done.error, SearchError::DeadlineExceeded.to_string());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_configured_deadline_applies_without_request_deadline() {
        let dir = TempDir::new().unwrap();
        let source = source();
        source.set_fetch_delay(Duration::from_millis(500));
        let mut config = config(&dir);
        config.search.timeout_ms = 50;
        let svc = Arc::new(Service::new(config, source, Arc::new(NoIndex), Metrics::new()).unwrap());

        let (_, done) = svc
            .search(&SearchContext::background(), request(OLD, "Hello"))
            .await
            .unwrap();
        assert_eq!(done.error, SearchError::DeadlineExceeded.to_string());
        assert_eq!(svc.metrics().snapshot().search_errors, 1);
    }

    #[tokio::test]
    async fn test_canceled_request() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, source(), Arc::new(NoIndex));
        let ctx = SearchContext::background();
        ctx.cancel();
        let (_, done) = svc.search(&ctx, request(OLD, "Hello")).await.unwrap();
        assert!(!done.error.is_empty());
    }
}
