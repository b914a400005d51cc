//! Structural search through a `comby` subprocess.
//!
//! Candidates are narrowed first with a regex translation of the structural
//! pattern. Archives on disk are handed over with `-zip`; content that only
//! exists in memory (from the index) is streamed as tar over stdin.

use crate::config::StructuralConfig;
use crate::error::{Result, SearchError};
use crate::index::{IndexBackend, IndexSearchOptions};
use crate::metrics::{Metrics, SharedMetrics};
use crate::protocol::{ChunkMatch, FileMatch, Location, PatternInfo, QueryNode, Range};
use crate::search::chunk::{chunk_ranges, chunks_to_matches};
use crate::search::engine::Matcher;
use crate::search::sink::LimitedStream;
use crate::store::ZipFile;
use futures_util::StreamExt;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Regex that every structural match is guaranteed to match: holes become
/// lazy wildcards and whitespace becomes `\s+`.
pub fn structural_to_regex(pattern: &str) -> String {
    let mut out = String::new();
    let mut literal = String::new();
    let mut rest = pattern;

    while !rest.is_empty() {
        let hole = rest.find(":[");
        let Some(start) = hole else {
            literal.push_str(rest);
            break;
        };
        let close = if rest[start..].starts_with(":[[") { "]]" } else { "]" };
        let Some(len) = rest[start + 2..].find(close) else {
            literal.push_str(rest);
            break;
        };
        literal.push_str(&rest[..start]);
        out.push_str(&literal_regex(&literal));
        literal.clear();
        out.push_str("(?s:.)*?");
        rest = &rest[start + 2 + len + close.len()..];
    }
    out.push_str(&literal_regex(&literal));
    out
}

fn literal_regex(literal: &str) -> String {
    let mut out = String::new();
    let mut in_space = false;
    for c in literal.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push_str(r"\s+");
            }
            in_space = true;
        } else {
            in_space = false;
            out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
        }
    }
    out
}

/// `-matcher` value: the first requested language, else the extension of
/// the first candidate, else `.generic`.
pub fn select_matcher(languages: &[String], first_candidate: Option<&str>) -> String {
    if let Some(lang) = languages.first() {
        if let Some(ext) = language_extension(lang) {
            return ext.to_string();
        }
    }
    first_candidate
        .and_then(|p| Path::new(p).extension())
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_else(|| ".generic".to_string())
}

fn language_extension(lang: &str) -> Option<&'static str> {
    Some(match lang.to_ascii_lowercase().as_str() {
        "go" => ".go",
        "rust" => ".rs",
        "python" => ".py",
        "javascript" => ".js",
        "typescript" => ".ts",
        "java" => ".java",
        "c" => ".c",
        "c++" | "cpp" => ".cc",
        "c#" | "csharp" => ".cs",
        "ruby" => ".rb",
        "php" => ".php",
        "scala" => ".scala",
        "kotlin" => ".kt",
        "swift" => ".swift",
        "html" => ".html",
        "json" => ".json",
        "yaml" => ".yaml",
        "shell" | "bash" => ".sh",
        _ => return None,
    })
}

/// Input handed to the subprocess.
pub enum StructuralInput<'a> {
    /// Archive on disk; only `files` are searched.
    Zip { zf: &'a ZipFile, files: Vec<String> },
    /// Files streamed as tar over stdin.
    Tar { files: Vec<(String, Vec<u8>)> },
}

impl StructuralInput<'_> {
    fn paths(&self) -> Vec<&str> {
        match self {
            StructuralInput::Zip { files, .. } => files.iter().map(String::as_str).collect(),
            StructuralInput::Tar { files } => files.iter().map(|(p, _)| p.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct CombyLocation {
    offset: u32,
    line: u32,
    column: u32,
}

impl From<CombyLocation> for Location {
    fn from(l: CombyLocation) -> Self {
        Location::new(l.offset, l.line.saturating_sub(1), l.column.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct CombyRange {
    start: CombyLocation,
    end: CombyLocation,
}

impl From<CombyRange> for Range {
    fn from(r: CombyRange) -> Self {
        Range::new(r.start.into(), r.end.into())
    }
}

#[derive(Debug, Deserialize)]
struct CombyMatch {
    range: CombyRange,
    #[serde(default)]
    matched: String,
}

#[derive(Debug, Deserialize)]
struct CombyChunk {
    content: String,
    start: CombyLocation,
    ranges: Vec<CombyRange>,
}

/// One output line: chunk records (`-chunk-matches`) or flat matches.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CombyRecord {
    Chunks {
        uri: String,
        chunk_matches: Vec<CombyChunk>,
    },
    Flat {
        uri: String,
        matches: Vec<CombyMatch>,
    },
}

/// Convert one output record, using the file's content to build display
/// chunks for flat matches when it is known.
fn record_to_file_match(record: CombyRecord, content: Option<&[u8]>, context_lines: u32) -> FileMatch {
    match record {
        CombyRecord::Chunks { uri, chunk_matches } => FileMatch {
            path: uri,
            chunk_matches: chunk_matches
                .into_iter()
                .map(|c| ChunkMatch {
                    content: c.content,
                    content_start: c.start.into(),
                    ranges: c.ranges.into_iter().map(Range::from).collect(),
                })
                .collect(),
            limit_hit: false,
        },
        CombyRecord::Flat { uri, matches } => {
            let in_bounds = |buf: &[u8]| {
                matches
                    .iter()
                    .all(|m| (m.range.end.offset as usize) <= buf.len() && m.range.start.offset <= m.range.end.offset)
            };
            let chunk_matches = match content.filter(|buf| in_bounds(buf)) {
                Some(buf) => {
                    let ranges = matches.into_iter().map(|m| Range::from(m.range)).collect();
                    chunks_to_matches(buf, chunk_ranges(ranges, 0), context_lines)
                }
                None => matches
                    .into_iter()
                    .map(|m| {
                        let range = Range::from(m.range);
                        ChunkMatch {
                            content: m.matched,
                            content_start: range.start,
                            ranges: vec![range],
                        }
                    })
                    .collect(),
            };
            FileMatch {
                path: uri,
                chunk_matches,
                limit_hit: false,
            }
        }
    }
}

pub struct StructuralSearcher {
    config: StructuralConfig,
    metrics: SharedMetrics,
}

impl StructuralSearcher {
    pub fn new(config: StructuralConfig, metrics: SharedMetrics) -> Self {
        Self { config, metrics }
    }

    /// Matcher for the regex translation, honouring the request's path
    /// filters.
    fn prefilter(info: &PatternInfo) -> Result<Matcher> {
        let pattern = info
            .query
            .pattern_value()
            .ok_or_else(|| SearchError::bad_request("structural search takes a single pattern"))?;
        let prefilter = PatternInfo {
            query: QueryNode::regexp(structural_to_regex(pattern)),
            is_case_sensitive: true,
            is_word_match: false,
            pattern_matches_content: true,
            pattern_matches_path: false,
            ..info.clone()
        };
        Matcher::new(&prefilter, 0)
    }

    /// Search an archive on disk. The prefilter reads every entry, so it
    /// runs on the blocking pool; `zf` is handed back for the subprocess.
    pub async fn search_zip<Z>(
        &self,
        zf: Z,
        info: &PatternInfo,
        context_lines: u32,
        sink: &LimitedStream,
    ) -> Result<()>
    where
        Z: Deref<Target = ZipFile> + Send + 'static,
    {
        let matcher = Self::prefilter(info)?;
        let ctx = sink.context().clone();
        let (zf, candidates) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut scratch = Vec::new();
            let mut candidates = Vec::new();
            for file in zf.files() {
                ctx.check()?;
                let buf = zf.checked_data_for(file)?;
                if matcher.search_file(&file.name, buf, 0, &mut scratch).is_some() {
                    candidates.push(file.name.clone());
                }
            }
            Ok((zf, candidates))
        })
        .await??;
        debug!(
            files = zf.files().len(),
            candidates = candidates.len(),
            "structural prefilter"
        );
        if candidates.is_empty() {
            return Ok(());
        }
        self.run(
            StructuralInput::Zip {
                zf: &zf,
                files: candidates,
            },
            info,
            context_lines,
            sink,
        )
        .await
    }

    /// Search the index's copy of `repo`: candidates come from the index with
    /// their whole content and are streamed to the subprocess.
    pub async fn search_index(
        &self,
        index: &dyn IndexBackend,
        repo: &str,
        info: &PatternInfo,
        context_lines: u32,
        sink: &LimitedStream,
    ) -> Result<()> {
        let matcher = Self::prefilter(info)?;
        let query = crate::search::hybrid::index_query(repo, &[], &matcher);
        let opts = IndexSearchOptions {
            max_matches: 0,
            context_lines: 0,
            whole_file: true,
        };
        let ctx = sink.context();
        let mut stream = index.stream_search(ctx, query, opts).await?;
        let mut files = Vec::new();
        while let Some(event) = stream.next().await {
            ctx.check()?;
            for f in event?.files {
                if let Some(content) = f.content {
                    files.push((f.path, content));
                }
            }
        }
        debug!(repo, candidates = files.len(), "structural index prefilter");
        if files.is_empty() {
            return Ok(());
        }
        self.run(StructuralInput::Tar { files }, info, context_lines, sink)
            .await
    }

    fn args(&self, input: &StructuralInput<'_>, info: &PatternInfo, zip_path: Option<&Path>) -> Vec<String> {
        let paths = input.paths();
        let mut args = vec![
            info.query.pattern_value().unwrap_or_default().to_string(),
            String::new(),
        ];
        if !info.comby_rule.is_empty() {
            args.push("-rule".into());
            args.push(info.comby_rule.clone());
        }
        if !paths.is_empty() {
            args.push("-f".into());
            args.push(paths.join(","));
        }
        args.extend([
            "-json-lines".to_string(),
            "-match-only".to_string(),
            "-jobs".to_string(),
            self.config.jobs.max(1).to_string(),
            "-matcher".to_string(),
            select_matcher(&info.languages, paths.first().copied()),
        ]);
        match zip_path {
            Some(path) => {
                args.push("-zip".into());
                args.push(path.to_string_lossy().into_owned());
            }
            None => {
                args.push("-tar".into());
                args.push("-chunk-matches".into());
                args.push("0".into());
            }
        }
        args
    }

    /// Run the subprocess over `input`, sending a [`FileMatch`] per output
    /// line.
    pub async fn run(
        &self,
        input: StructuralInput<'_>,
        info: &PatternInfo,
        context_lines: u32,
        sink: &LimitedStream,
    ) -> Result<()> {
        let zip_path: Option<PathBuf> = match &input {
            StructuralInput::Zip { zf, .. } => Some(zf.path().to_path_buf()),
            StructuralInput::Tar { .. } => None,
        };
        let args = self.args(&input, info, zip_path.as_deref());
        let mut cmd = Command::new(&self.config.comby_path);
        cmd.args(&args)
            .stdin(if zip_path.is_some() {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Metrics::incr(&self.metrics.structural_runs);
        let mut child = cmd.spawn().map_err(|e| {
            SearchError::Structural(format!(
                "failed to start {}: {}",
                self.config.comby_path.display(),
                e
            ))
        })?;
        info!(
            comby = %self.config.comby_path.display(),
            mode = if zip_path.is_some() { "zip" } else { "tar" },
            files = input.paths().len(),
            "started structural search"
        );

        let result = self.drive(&mut child, input, context_lines, sink).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                reap_in_background(child);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        child: &mut Child,
        input: StructuralInput<'_>,
        context_lines: u32,
        sink: &LimitedStream,
    ) -> Result<()> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SearchError::Structural("stdout not captured".into()))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let (contents, writer) = match input {
            StructuralInput::Zip { zf, files } => {
                let index: FxHashMap<&str, &crate::store::SrcFile> =
                    zf.files().iter().map(|f| (f.name.as_str(), f)).collect();
                let contents: FxHashMap<String, Vec<u8>> = files
                    .iter()
                    .filter_map(|name| {
                        let file = index.get(name.as_str())?;
                        Some((name.clone(), zf.checked_data_for(file).ok()?.to_vec()))
                    })
                    .collect();
                (contents, None)
            }
            StructuralInput::Tar { files } => {
                let tar = build_tar(&files)?;
                let mut stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| SearchError::Structural("stdin not captured".into()))?;
                let writer = tokio::spawn(async move {
                    stdin.write_all(&tar).await?;
                    stdin.shutdown().await
                });
                (files.into_iter().collect(), Some(writer))
            }
        };

        let mut lines = BufReader::new(stdout).lines();
        let ctx = sink.context();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = ctx.done() => break,
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            let record: CombyRecord = serde_json::from_str(&line).map_err(|e| {
                SearchError::Structural(format!("unexpected output line {:?}: {}", line, e))
            })?;
            let path = match &record {
                CombyRecord::Chunks { uri, .. } | CombyRecord::Flat { uri, .. } => uri.clone(),
            };
            let content = contents.get(&path).map(Vec::as_slice);
            sink.send(record_to_file_match(record, content, context_lines));
        }

        if ctx.is_done() {
            // stopped early: the limit was hit or the caller went away
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "structural subprocess already exited");
            }
            child.wait().await?;
            if let Some(writer) = writer {
                let _ = writer.await;
            }
            return if sink.limit_hit() { Ok(()) } else { ctx.check() };
        }

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // the subprocess may stop reading once it has what it needs
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(e.into()),
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(SearchError::Structural(format!(
                "comby exited with {}: {}",
                status,
                stderr.trim()
            )));
        }
        debug!("structural search finished");
        Ok(())
    }
}

fn build_tar(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, content.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

/// Kill the child and wait for it off the request path.
fn reap_in_background(mut child: Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "structural subprocess already exited");
    }
    tokio::spawn(async move {
        if let Err(e) = child.wait().await {
            warn!(error = %e, "failed to reap structural subprocess");
        }
    });
}
