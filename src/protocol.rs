//! Request and response types shared by the HTTP surface, the matching
//! engine, the hybrid orchestrator and the structural bridge.

use crate::error::SearchError;
use serde::{Deserialize, Serialize};

/// A position in a file.
///
/// `offset` is a byte offset, `line` is 0-based and `column` is the number of
/// runes (not bytes) between the start of the line and `offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub offset: u32,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(offset: u32, line: u32, column: u32) -> Self {
        Self {
            offset,
            line,
            column,
        }
    }
}

/// Half-open range `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Location,
    pub end: Location,
}

impl Range {
    pub fn new(start: Location, end: Location) -> Self {
        Self { start, end }
    }
}

/// A context-expanded span of a file grouping one or more nearby matches.
///
/// `content` is an owned copy; it never borrows from a mapped archive.
/// `ranges` are absolute positions in the original file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub content: String,
    pub content_start: Location,
    pub ranges: Vec<Range>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMatch {
    pub path: String,
    #[serde(default)]
    pub chunk_matches: Vec<ChunkMatch>,
    #[serde(default)]
    pub limit_hit: bool,
}

impl FileMatch {
    pub fn path_only(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            chunk_matches: Vec::new(),
            limit_hit: false,
        }
    }

    /// Number of results this match counts against a limit. A match without
    /// any ranges (path match, or negated content match) counts as one.
    pub fn match_count(&self) -> usize {
        let ranges: usize = self.chunk_matches.iter().map(|c| c.ranges.len()).sum();
        ranges.max(1)
    }

    /// Truncate to at most `limit` ranges, dropping chunks left empty.
    pub fn limit(&mut self, limit: usize) {
        let mut remaining = limit;
        for chunk in &mut self.chunk_matches {
            if chunk.ranges.len() > remaining {
                chunk.ranges.truncate(remaining);
            }
            remaining -= chunk.ranges.len();
        }
        self.chunk_matches.retain(|c| !c.ranges.is_empty());
        self.limit_hit = true;
    }
}

/// Query AST accepted in a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryNode {
    Pattern {
        value: String,
        #[serde(default)]
        is_negated: bool,
        #[serde(default)]
        is_regexp: bool,
        #[serde(default)]
        boost: bool,
    },
    And {
        children: Vec<QueryNode>,
    },
    Or {
        children: Vec<QueryNode>,
    },
}

impl Default for QueryNode {
    fn default() -> Self {
        QueryNode::literal("")
    }
}

impl QueryNode {
    pub fn literal(value: impl Into<String>) -> Self {
        QueryNode::Pattern {
            value: value.into(),
            is_negated: false,
            is_regexp: false,
            boost: false,
        }
    }

    pub fn regexp(value: impl Into<String>) -> Self {
        QueryNode::Pattern {
            value: value.into(),
            is_negated: false,
            is_regexp: true,
            boost: false,
        }
    }

    pub fn negated(self) -> Self {
        match self {
            QueryNode::Pattern {
                value,
                is_regexp,
                boost,
                ..
            } => QueryNode::Pattern {
                value,
                is_negated: true,
                is_regexp,
                boost,
            },
            other => other,
        }
    }

    /// True when the query carries no pattern text at all.
    pub fn is_empty(&self) -> bool {
        match self {
            QueryNode::Pattern { value, .. } => value.is_empty(),
            QueryNode::And { children } | QueryNode::Or { children } => {
                children.iter().all(QueryNode::is_empty)
            }
        }
    }

    pub fn has_negation(&self) -> bool {
        match self {
            QueryNode::Pattern { is_negated, .. } => *is_negated,
            QueryNode::And { children } | QueryNode::Or { children } => {
                children.iter().any(QueryNode::has_negation)
            }
        }
    }

    /// The pattern text of a single-leaf query.
    pub fn pattern_value(&self) -> Option<&str> {
        match self {
            QueryNode::Pattern { value, .. } => Some(value),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternInfo {
    #[serde(default)]
    pub query: QueryNode,
    #[serde(default)]
    pub is_structural: bool,
    #[serde(default)]
    pub is_word_match: bool,
    #[serde(default)]
    pub is_case_sensitive: bool,
    /// Regex; paths matching it are excluded.
    #[serde(default)]
    pub exclude_paths: String,
    /// Regexes; a path must match all of them.
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub path_patterns_are_case_sensitive: bool,
    /// Maximum number of results (ranges) to return.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub pattern_matches_content: bool,
    #[serde(default)]
    pub pattern_matches_path: bool,
    #[serde(default)]
    pub comby_rule: String,
    #[serde(default)]
    pub languages: Vec<String>,
}

impl PatternInfo {
    /// Content matching is implied when neither target is selected.
    pub fn match_targets(&self) -> (bool, bool) {
        if !self.pattern_matches_content && !self.pattern_matches_path {
            (true, false)
        } else {
            (self.pattern_matches_content, self.pattern_matches_path)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub repo: String,
    #[serde(default)]
    pub repo_id: u32,
    pub commit: String,
    #[serde(default)]
    pub branch: String,
    /// Whether the external index holds this repository.
    #[serde(default)]
    pub indexed: bool,
    /// Time allowed to prepare the archive; 0 selects the server default.
    #[serde(default)]
    pub fetch_timeout_ms: u64,
    /// Deadline for the whole search; 0 selects the server default.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub feat_hybrid: bool,
    #[serde(default)]
    pub num_context_lines: u32,
    pub pattern_info: PatternInfo,
}

/// Largest context window a request may ask for.
pub const MAX_CONTEXT_LINES: u32 = 20;

impl Request {
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.repo.is_empty() {
            return Err(SearchError::bad_request("repo must be non-empty"));
        }
        if !is_resolved_commit(&self.commit) {
            return Err(SearchError::bad_request(format!(
                "commit must be resolved to a 40 character object id, got {:?}",
                self.commit
            )));
        }
        let p = &self.pattern_info;
        if p.query.is_empty() && p.exclude_paths.is_empty() && p.include_paths.is_empty() {
            return Err(SearchError::bad_request(
                "at least one of pattern, include paths or exclude paths must be non-empty",
            ));
        }
        if p.is_structural && p.query.has_negation() {
            return Err(SearchError::bad_request(
                "negated patterns are not supported for structural search",
            ));
        }
        if p.is_structural && p.query.pattern_value().is_none() {
            return Err(SearchError::bad_request(
                "structural search takes a single pattern, not an and/or query",
            ));
        }
        Ok(())
    }

    pub fn context_lines(&self) -> u32 {
        self.num_context_lines.min(MAX_CONTEXT_LINES)
    }
}

fn is_resolved_commit(commit: &str) -> bool {
    commit.len() == 40 && commit.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Terminal event of every response stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneEvent {
    pub limit_hit: bool,
    #[serde(default)]
    pub error: String,
}
