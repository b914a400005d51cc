//! Query algebra understood by the external index.

use std::collections::BTreeSet;
use std::fmt;

/// Boost applied to leaves flagged as boosted.
pub const BOOST_SCORE: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    Const(bool),
    /// Restrict to one repository.
    Repo(String),
    /// Regex over content and/or file names. With neither flag set, either
    /// target may match.
    Regexp {
        pattern: String,
        case_sensitive: bool,
        content: bool,
        file_name: bool,
    },
    /// Exact set of file names.
    FileNameSet(BTreeSet<String>),
    Not(Box<IndexQuery>),
    And(Vec<IndexQuery>),
    Or(Vec<IndexQuery>),
    Boost { query: Box<IndexQuery>, boost: f64 },
}

impl IndexQuery {
    pub fn not(query: IndexQuery) -> Self {
        IndexQuery::Not(Box::new(query))
    }

    pub fn boost(query: IndexQuery, boost: f64) -> Self {
        IndexQuery::Boost {
            query: Box::new(query),
            boost,
        }
    }

    /// Drop trivially true conjuncts and flatten single-child nodes.
    pub fn simplify(self) -> Self {
        match self {
            IndexQuery::And(children) => {
                let children: Vec<_> = children
                    .into_iter()
                    .map(IndexQuery::simplify)
                    .filter(|q| *q != IndexQuery::Const(true))
                    .collect();
                if children.iter().any(|q| *q == IndexQuery::Const(false)) {
                    return IndexQuery::Const(false);
                }
                match children.len() {
                    0 => IndexQuery::Const(true),
                    1 => children.into_iter().next().unwrap_or(IndexQuery::Const(true)),
                    _ => IndexQuery::And(children),
                }
            }
            IndexQuery::Or(children) => {
                let children: Vec<_> = children.into_iter().map(IndexQuery::simplify).collect();
                if children.iter().any(|q| *q == IndexQuery::Const(true)) {
                    return IndexQuery::Const(true);
                }
                match children.len() {
                    1 => children.into_iter().next().unwrap_or(IndexQuery::Const(false)),
                    _ => IndexQuery::Or(children),
                }
            }
            IndexQuery::Not(inner) => match inner.simplify() {
                IndexQuery::Const(b) => IndexQuery::Const(!b),
                other => IndexQuery::not(other),
            },
            other => other,
        }
    }
}

impl fmt::Display for IndexQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexQuery::Const(b) => write!(f, "{}", b),
            IndexQuery::Repo(repo) => write!(f, "repo:{}", repo),
            IndexQuery::Regexp {
                pattern,
                case_sensitive,
                content,
                file_name,
            } => {
                let target = match (content, file_name) {
                    (true, false) => "content",
                    (false, true) => "file",
                    _ => "any",
                };
                write!(f, "regex:{}:{:?}", target, pattern)?;
                if *case_sensitive {
                    write!(f, ":case")?;
                }
                Ok(())
            }
            IndexQuery::FileNameSet(names) => write!(f, "files:{{{} names}}", names.len()),
            IndexQuery::Not(q) => write!(f, "-{}", q),
            IndexQuery::And(qs) => write_list(f, "and", qs),
            IndexQuery::Or(qs) => write_list(f, "or", qs),
            IndexQuery::Boost { query, boost } => write!(f, "(boost {} {})", boost, query),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, op: &str, qs: &[IndexQuery]) -> fmt::Result {
    write!(f, "({}", op)?;
    for q in qs {
        write!(f, " {}", q)?;
    }
    write!(f, ")")
}
