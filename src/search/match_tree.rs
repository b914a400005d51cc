//! Boolean match trees over regex leaves.

use crate::error::Result;
use crate::index::query::{IndexQuery, BOOST_SCORE};
use crate::protocol::QueryNode;
use crate::search::regex_search::{pattern_expr, RegexAnalysis};
use memchr::memmem;

/// A regex predicate.
#[derive(Debug, Clone)]
pub struct RegexLeaf {
    analysis: RegexAnalysis,
    literal: Option<memmem::Finder<'static>>,
    /// Expression before case lowering, as sent to the index.
    expr: String,
    case_sensitive: bool,
    is_negated: bool,
    boost: bool,
}

impl RegexLeaf {
    pub fn new(expr: &str, case_sensitive: bool, is_negated: bool, boost: bool) -> Result<Self> {
        let analysis = RegexAnalysis::analyze(expr, case_sensitive)?;
        let literal = analysis.literal_finder();
        Ok(Self {
            analysis,
            literal,
            expr: expr.to_string(),
            case_sensitive,
            is_negated,
            boost,
        })
    }

    pub fn literal(&self) -> Option<&[u8]> {
        self.analysis.literal.as_deref()
    }

    fn matches_file(&self, buf: &[u8], limit: usize) -> (bool, Vec<(usize, usize)>) {
        if let Some(finder) = &self.literal {
            if finder.find(buf).is_none() {
                return (self.is_negated, Vec::new());
            }
        }
        if self.is_negated {
            return (!self.analysis.regex.is_match(buf), Vec::new());
        }
        let locs: Vec<(usize, usize)> = self
            .analysis
            .regex
            .find_iter(buf)
            .take(limit)
            .map(|m| (m.start(), m.end()))
            .collect();
        (!locs.is_empty(), locs)
    }
}

/// Immutable boolean tree compiled from a [`QueryNode`].
#[derive(Debug, Clone)]
pub enum MatchTree {
    All,
    Regex(RegexLeaf),
    And(Vec<MatchTree>),
    Or(Vec<MatchTree>),
}

impl MatchTree {
    /// Compile a query. An empty pattern leaf matches everything.
    pub fn from_query(node: &QueryNode, is_word_match: bool, case_sensitive: bool) -> Result<Self> {
        match node {
            QueryNode::Pattern {
                value,
                is_negated,
                is_regexp,
                boost,
            } => {
                if value.is_empty() {
                    return Ok(MatchTree::All);
                }
                let expr = pattern_expr(value, *is_regexp, is_word_match);
                Ok(MatchTree::Regex(RegexLeaf::new(
                    &expr,
                    case_sensitive,
                    *is_negated,
                    *boost,
                )?))
            }
            QueryNode::And { children } => Ok(MatchTree::And(
                children
                    .iter()
                    .map(|c| Self::from_query(c, is_word_match, case_sensitive))
                    .collect::<Result<_>>()?,
            )),
            QueryNode::Or { children } => Ok(MatchTree::Or(
                children
                    .iter()
                    .map(|c| Self::from_query(c, is_word_match, case_sensitive))
                    .collect::<Result<_>>()?,
            )),
        }
    }

    /// Test a string (a path). The caller lowers it for case-insensitive
    /// trees.
    pub fn matches_string(&self, s: &str) -> bool {
        match self {
            MatchTree::All => true,
            MatchTree::Regex(leaf) => {
                leaf.analysis.regex.is_match(s.as_bytes()) != leaf.is_negated
            }
            MatchTree::And(children) => children.iter().all(|c| c.matches_string(s)),
            MatchTree::Or(children) => children.iter().any(|c| c.matches_string(s)),
        }
    }

    /// Test file content, returning whether it matched and up to `limit`
    /// sorted, non-overlapping match offsets. A negated leaf can match with no
    /// offsets.
    pub fn matches_file(&self, buf: &[u8], limit: usize) -> (bool, Vec<(usize, usize)>) {
        match self {
            MatchTree::All => (true, Vec::new()),
            MatchTree::Regex(leaf) => leaf.matches_file(buf, limit),
            MatchTree::And(children) => {
                let mut all = Vec::new();
                for child in children {
                    let (matched, locs) = child.matches_file(buf, limit);
                    if !matched {
                        return (false, Vec::new());
                    }
                    all.extend(locs);
                }
                (true, merge_matches(all, limit))
            }
            MatchTree::Or(children) => {
                let mut any = false;
                let mut all = Vec::new();
                for child in children {
                    let (matched, locs) = child.matches_file(buf, limit);
                    if matched {
                        any = true;
                        all.extend(locs);
                    }
                }
                (any, merge_matches(all, limit))
            }
        }
    }

    /// Lower into the index query algebra.
    pub fn to_index_query(&self, match_content: bool, match_path: bool) -> IndexQuery {
        match self {
            MatchTree::All => IndexQuery::Const(true),
            MatchTree::Regex(leaf) => {
                let mut q = IndexQuery::Regexp {
                    pattern: leaf.expr.clone(),
                    case_sensitive: leaf.case_sensitive,
                    content: match_content,
                    file_name: match_path,
                };
                if leaf.is_negated {
                    q = IndexQuery::not(q);
                }
                if leaf.boost {
                    q = IndexQuery::boost(q, BOOST_SCORE);
                }
                q
            }
            MatchTree::And(children) => IndexQuery::And(
                children
                    .iter()
                    .map(|c| c.to_index_query(match_content, match_path))
                    .collect(),
            ),
            MatchTree::Or(children) => IndexQuery::Or(
                children
                    .iter()
                    .map(|c| c.to_index_query(match_content, match_path))
                    .collect(),
            ),
        }
    }
}

/// Sort by start, drop any match overlapping an earlier kept one, truncate.
pub fn merge_matches(mut matches: Vec<(usize, usize)>, limit: usize) -> Vec<(usize, usize)> {
    if matches.is_empty() {
        return matches;
    }
    matches.sort_by_key(|m| m.0);

    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(matches.len());
    for m in matches {
        if let Some(last) = merged.last() {
            if m.0 < last.1 {
                continue;
            }
        }
        merged.push(m);
    }
    merged.truncate(limit);
    merged
}
