//! Path filtering using include/exclude regular expressions.
//!
//! Applied before any content is read so excluded files cost nothing more
//! than a regex test on their name.

use crate::error::Result;
use regex::Regex;

/// Filters files by path patterns.
///
/// - Include patterns: a path must match every one of them
/// - Exclude pattern: a path must not match it
///
/// Patterns are matched against archive-relative paths.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<Regex>,
    exclude: Option<Regex>,
}

impl PathFilter {
    /// Create a new path filter.
    ///
    /// Empty include lists and an empty exclude pattern are treated as "no
    /// filter". When `case_sensitive` is false every pattern is compiled with
    /// `(?i)`.
    pub fn new(include_patterns: &[String], exclude_pattern: &str, case_sensitive: bool) -> Result<Self> {
        let compile = |pattern: &str| -> Result<Regex> {
            if case_sensitive {
                Ok(Regex::new(pattern)?)
            } else {
                Ok(Regex::new(&format!("(?i:{})", pattern))?)
            }
        };

        let include = include_patterns
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()?;

        let exclude = if exclude_pattern.is_empty() {
            None
        } else {
            Some(compile(exclude_pattern)?)
        };

        Ok(Self { include, exclude })
    }

    /// Check if a path matches the filter criteria.
    pub fn matches(&self, path: &str) -> bool {
        if !self.include.iter().all(|re| re.is_match(path)) {
            return false;
        }
        match &self.exclude {
            Some(re) => !re.is_match(path),
            None => true,
        }
    }

    /// Check if this filter has any patterns (include or exclude).
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_none()
    }

    /// Include patterns as source strings, for lowering into index queries.
    pub fn include_patterns(&self) -> impl Iterator<Item = &str> {
        self.include.iter().map(|re| re.as_str())
    }

    pub fn exclude_pattern(&self) -> Option<&str> {
        self.exclude.as_ref().map(|re| re.as_str())
    }
}
