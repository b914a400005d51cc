//! Integration tests for Commit Searcher
//!
//! These tests start the HTTP server on a random port over in-memory
//! repositories and an in-memory index, then drive it with real requests and
//! parse the event stream.

use anyhow::Result;
use commit_searcher::config::Config;
use commit_searcher::index::{IndexBackend, MemoryIndex, NoIndex};
use commit_searcher::metrics::Metrics;
use commit_searcher::protocol::{DoneEvent, FileMatch, PatternInfo, QueryNode, Request};
use commit_searcher::source::MemorySource;
use commit_searcher::web::create_router;
use commit_searcher::Service;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;

const REPO: &str = "github.com/acme/hello";
const OLD: &str = "0123456789abcdef0123456789abcdef01234567";
const NEW: &str = "89abcdef0123456789abcdef0123456789abcdef";

const README: &str = "# Hello World\n\nHello world example in go";
const MAIN_GO: &str = r#"package main

import "fmt"

func main() {
	fmt.Println("Hello world")
}
"#;

struct TestContext {
    http_url: String,
    source: Arc<MemorySource>,
    _temp_dir: TempDir, // Keep alive for test duration
}

/// Starts the server over `source` and `index` with a fresh cache directory.
async fn setup_test_server(source: Arc<MemorySource>, index: Arc<dyn IndexBackend>) -> Result<TestContext> {
    let temp_dir = TempDir::new()?;
    let mut config = Config::default();
    config.store.cache_dir = temp_dir.path().join("cache");
    config.store.fetch_timeout_ms = 10_000;

    let service = Arc::new(Service::new(config, source.clone(), index, Metrics::new())?);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let http_addr = listener.local_addr()?;
    let router = create_router(service);
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("HTTP server failed");
    });

    Ok(TestContext {
        http_url: format!("http://{}", http_addr),
        source,
        _temp_dir: temp_dir,
    })
}

fn hello_source() -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    source.add_commit(
        REPO,
        OLD,
        &[("README.md", README.as_bytes()), ("main.go", MAIN_GO.as_bytes())],
    );
    source
}

fn request(commit: &str, pattern: &str, case_sensitive: bool) -> Request {
    Request {
        repo: REPO.into(),
        commit: commit.into(),
        feat_hybrid: true,
        pattern_info: PatternInfo {
            query: QueryNode::literal(pattern),
            is_case_sensitive: case_sensitive,
            limit: 100,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Split an event stream body into match batches and the terminal event.
fn parse_events(body: &str) -> (Vec<FileMatch>, Option<DoneEvent>, usize) {
    let mut matches = Vec::new();
    let mut done = None;
    let mut done_count = 0;
    for block in body.split("\n\n") {
        let mut event = None;
        let mut data = String::new();
        for line in block.lines() {
            if let Some(v) = line.strip_prefix("event:") {
                event = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("data:") {
                data.push_str(v.trim_start());
            }
        }
        match event.as_deref() {
            Some("matches") => {
                let batch: Vec<FileMatch> = serde_json::from_str(&data).unwrap();
                matches.extend(batch);
            }
            Some("done") => {
                done = Some(serde_json::from_str(&data).unwrap());
                done_count += 1;
            }
            _ => {}
        }
    }
    matches.sort_by(|a, b| a.path.cmp(&b.path));
    (matches, done, done_count)
}

async fn search(ctx: &TestContext, req: &Request) -> Result<(Vec<FileMatch>, DoneEvent)> {
    let response = reqwest::Client::new()
        .post(format!("{}/search", ctx.http_url))
        .json(req)
        .send()
        .await?;
    assert!(response.status().is_success(), "Expected 200 OK, got {}", response.status());
    let body = response.text().await?;
    let (matches, done, done_count) = parse_events(&body);
    assert_eq!(done_count, 1, "Expected exactly one done event in {:?}", body);
    Ok((matches, done.unwrap_or_default()))
}

fn lines(m: &FileMatch) -> Vec<u32> {
    m.chunk_matches
        .iter()
        .flat_map(|c| c.ranges.iter().map(|r| r.start.line))
        .collect()
}

#[tokio::test]
async fn test_case_sensitive_search() -> Result<()> {
    let ctx = setup_test_server(hello_source(), Arc::new(NoIndex)).await?;
    let (matches, done) = search(&ctx, &request(OLD, "World", true)).await?;

    assert!(done.error.is_empty(), "{}", done.error);
    assert!(!done.limit_hit);
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].path, "README.md");
    assert_eq!(lines(&matches[0]), vec![0]);
    assert_eq!(matches[0].chunk_matches[0].content, "# Hello World");
    Ok(())
}

#[tokio::test]
async fn test_case_insensitive_search() -> Result<()> {
    let ctx = setup_test_server(hello_source(), Arc::new(NoIndex)).await?;
    let (matches, done) = search(&ctx, &request(OLD, "world", false)).await?;

    assert!(done.error.is_empty(), "{}", done.error);
    let paths: Vec<_> = matches.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec!["README.md", "main.go"]);
    assert_eq!(lines(&matches[0]), vec![0, 2]);
    assert_eq!(lines(&matches[1]), vec![5]);
    // the archive is fetched once and reused
    let (again, _) = search(&ctx, &request(OLD, "hello", false)).await?;
    assert_eq!(again.len(), 2);
    assert_eq!(ctx.source.fetch_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_limit_hit() -> Result<()> {
    let ctx = setup_test_server(hello_source(), Arc::new(NoIndex)).await?;
    let mut req = request(OLD, "world", false);
    req.pattern_info.limit = 1;
    let (matches, done) = search(&ctx, &req).await?;

    let total: usize = matches.iter().map(FileMatch::match_count).sum();
    assert_eq!(total, 1);
    assert!(done.limit_hit);
    assert!(done.error.is_empty(), "{}", done.error);
    Ok(())
}

#[tokio::test]
async fn test_path_only_search() -> Result<()> {
    let ctx = setup_test_server(hello_source(), Arc::new(NoIndex)).await?;
    let mut req = request(OLD, r"\.go$", false);
    req.pattern_info.query = QueryNode::regexp(r"\.go$");
    req.pattern_info.pattern_matches_path = true;
    let (matches, done) = search(&ctx, &req).await?;

    assert!(done.error.is_empty(), "{}", done.error);
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].path, "main.go");
    assert!(matches[0].chunk_matches.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unknown_commit_reports_error_in_done() -> Result<()> {
    let ctx = setup_test_server(hello_source(), Arc::new(NoIndex)).await?;
    let (matches, done) = search(&ctx, &request(NEW, "world", false)).await?;

    assert!(matches.is_empty());
    assert!(!done.error.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_validation_error_is_bad_request() -> Result<()> {
    let ctx = setup_test_server(hello_source(), Arc::new(NoIndex)).await?;
    let response = reqwest::Client::new()
        .post(format!("{}/search", ctx.http_url))
        .json(&request("HEAD", "world", false))
        .send()
        .await?;

    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["code"], "BAD_REQUEST");
    assert!(body["error"].as_str().unwrap().contains("40 character"));

    let mut bad_regex = request(OLD, "", false);
    bad_regex.pattern_info.query = QueryNode::regexp("(unclosed");
    let response = reqwest::Client::new()
        .post(format!("{}/search", ctx.http_url))
        .json(&bad_regex)
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 400);
    Ok(())
}

#[tokio::test]
async fn test_structural_compound_query_is_bad_request() -> Result<()> {
    let ctx = setup_test_server(hello_source(), Arc::new(NoIndex)).await?;
    let mut req = request(OLD, "", false);
    req.pattern_info.is_structural = true;
    req.pattern_info.query = QueryNode::Or {
        children: vec![QueryNode::literal("fmt.Println(:[x])"), QueryNode::literal("main")],
    };
    let response = reqwest::Client::new()
        .post(format!("{}/search", ctx.http_url))
        .json(&req)
        .send()
        .await?;

    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["code"], "BAD_REQUEST");
    assert!(body["error"].as_str().unwrap().contains("single pattern"));
    Ok(())
}

#[tokio::test]
async fn test_request_deadline_is_reported_in_done() -> Result<()> {
    let source = hello_source();
    source.set_fetch_delay(Duration::from_millis(500));
    let ctx = setup_test_server(source, Arc::new(NoIndex)).await?;
    let mut req = request(OLD, "world", false);
    req.timeout_ms = 50;

    let started = Instant::now();
    let (matches, done) = search(&ctx, &req).await?;
    assert!(matches.is_empty());
    assert_eq!(done.error, "deadline exceeded");
    assert!(!done.limit_hit);
    assert!(started.elapsed() < Duration::from_millis(500));
    Ok(())
}

#[tokio::test]
async fn test_hybrid_search_skips_unchanged_paths() -> Result<()> {
    let source = Arc::new(MemorySource::new());
    source.add_commit(
        REPO,
        OLD,
        &[
            ("changed.go", b"package main\n// hello world v1\n"),
            ("removed.md", b"a removed world\n"),
            ("unchanged.md", b"an unchanged world\n"),
        ],
    );
    source.add_commit(
        REPO,
        NEW,
        &[
            ("added.md", b"an added world\n"),
            ("changed.go", b"package main\n// hello world v2\n"),
            ("unchanged.md", b"an unchanged world\n"),
        ],
    );
    let index = Arc::new(MemoryIndex::new());
    index.index(
        REPO,
        OLD,
        &[
            ("changed.go", b"package main\n// hello world v1\n"),
            ("removed.md", b"a removed world\n"),
            ("unchanged.md", b"an unchanged world\n"),
        ],
    );

    let ctx = setup_test_server(source, index.clone()).await?;
    let mut req = request(NEW, "world", false);
    req.indexed = true;
    let (matches, done) = search(&ctx, &req).await?;

    assert!(done.error.is_empty(), "{}", done.error);
    let paths: Vec<_> = matches.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec!["added.md", "changed.go", "unchanged.md"]);
    let changed = &matches[1];
    assert!(changed.chunk_matches[0].content.contains("v2"));

    let fetched = ctx.source.fetched_paths();
    assert!(!fetched.iter().any(|p| p == "unchanged.md"), "{:?}", fetched);
    assert_eq!(index.searches(), 1);
    Ok(())
}

#[tokio::test]
async fn test_http_health_endpoint() -> Result<()> {
    let ctx = setup_test_server(hello_source(), Arc::new(NoIndex)).await?;
    let response = reqwest::get(format!("{}/healthz", ctx.http_url)).await?;
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[tokio::test]
async fn test_http_stats_endpoint() -> Result<()> {
    let ctx = setup_test_server(hello_source(), Arc::new(NoIndex)).await?;
    search(&ctx, &request(OLD, "world", false)).await?;

    let response = reqwest::get(format!("{}/api/stats", ctx.http_url)).await?;
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["searches_total"], 1);
    assert_eq!(body["archive_cache_misses"], 1);
    assert_eq!(body["running_searches"], 0);
    assert!(body["fetch_limit"].as_u64().unwrap() >= 1);
    Ok(())
}
