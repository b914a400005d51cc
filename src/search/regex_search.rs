//! Pattern compilation with literal-hint extraction.
//!
//! Patterns are compiled into byte regexes. Case-insensitive search does not
//! use `(?i)`: the parsed regex is lowered to ASCII lowercase and the search
//! buffer is lowered before matching, which keeps the hot loop on the fast
//! literal paths of the regex engine. A literal substring that every match
//! must contain is extracted so files can be rejected with a plain substring
//! scan.

use crate::error::{Result, SearchError};
use memchr::memmem;
use regex::bytes::Regex;
use regex_syntax::hir::{Capture, Class, ClassBytesRange, ClassUnicodeRange, Hir, HirKind, Repetition};

/// Result of analyzing a pattern.
#[derive(Debug, Clone)]
pub struct RegexAnalysis {
    /// Compiled regex for matching
    pub regex: Regex,
    /// Literal that every match contains, when one could be found
    pub literal: Option<Vec<u8>>,
}

impl RegexAnalysis {
    /// Compile a query pattern.
    ///
    /// Literal patterns are meta-quoted, word matches are wrapped in `\b`, and
    /// every pattern is evaluated in multi-line mode.
    pub fn compile(
        value: &str,
        is_regexp: bool,
        is_word_match: bool,
        case_sensitive: bool,
    ) -> Result<Self> {
        Self::analyze(&pattern_expr(value, is_regexp, is_word_match), case_sensitive)
    }

    /// Analyze an already-built regex expression.
    pub fn analyze(pattern: &str, case_sensitive: bool) -> Result<Self> {
        let hir = regex_syntax::parse(pattern)
            .map_err(|e| SearchError::bad_request(format!("invalid regex {:?}: {}", pattern, e)))?;

        let (regex, hir) = if case_sensitive {
            (Regex::new(pattern)?, hir)
        } else {
            let lowered = lower_hir(&hir);
            (Regex::new(&lowered.to_string())?, lowered)
        };

        let literal = Some(longest_literal(&hir)).filter(|l| !l.is_empty());
        Ok(Self { regex, literal })
    }

    /// Substring finder for the literal hint.
    pub fn literal_finder(&self) -> Option<memmem::Finder<'static>> {
        self.literal
            .as_ref()
            .map(|l| memmem::Finder::new(l.as_slice()).into_owned())
    }
}

/// Build the regex expression for a query pattern.
pub fn pattern_expr(value: &str, is_regexp: bool, is_word_match: bool) -> String {
    let mut expr = if is_regexp {
        value.to_string()
    } else {
        regex::escape(value)
    };
    if is_word_match {
        expr = format!(r"\b{}\b", expr);
    }
    format!("(?m:{})", expr)
}

/// Longest literal that every match is guaranteed to contain.
///
/// Conservative: only literals, captures, concatenations and repetitions with
/// a minimum of at least one are walked. Alternations yield nothing.
pub fn longest_literal(hir: &Hir) -> Vec<u8> {
    match hir.kind() {
        HirKind::Literal(lit) => lit.0.to_vec(),
        HirKind::Capture(capture) => longest_literal(&capture.sub),
        HirKind::Repetition(rep) if rep.min >= 1 => longest_literal(&rep.sub),
        HirKind::Concat(subs) => {
            let mut longest = Vec::new();
            for sub in subs {
                let candidate = longest_literal(sub);
                if candidate.len() > longest.len() {
                    longest = candidate;
                }
            }
            longest
        }
        _ => Vec::new(),
    }
}

/// Rewrite a regex so it matches the ASCII-lowercased form of what the
/// original matched. Literals are lowered; classes overlapping `A-Z` gain the
/// matching lowercase ranges unless one range already spans all of `a-z`.
pub fn lower_hir(hir: &Hir) -> Hir {
    match hir.kind() {
        HirKind::Empty => Hir::empty(),
        HirKind::Literal(lit) => Hir::literal(lit.0.to_ascii_lowercase()),
        HirKind::Class(class) => Hir::class(lower_class(class)),
        HirKind::Look(look) => Hir::look(*look),
        HirKind::Repetition(rep) => Hir::repetition(Repetition {
            min: rep.min,
            max: rep.max,
            greedy: rep.greedy,
            sub: Box::new(lower_hir(&rep.sub)),
        }),
        HirKind::Capture(capture) => Hir::capture(Capture {
            index: capture.index,
            name: capture.name.clone(),
            sub: Box::new(lower_hir(&capture.sub)),
        }),
        HirKind::Concat(subs) => Hir::concat(subs.iter().map(lower_hir).collect()),
        HirKind::Alternation(subs) => Hir::alternation(subs.iter().map(lower_hir).collect()),
    }
}

fn lower_class(class: &Class) -> Class {
    match class {
        Class::Unicode(cls) => {
            let ranges: Vec<(u32, u32)> = cls
                .iter()
                .map(|r| (r.start() as u32, r.end() as u32))
                .collect();
            let mut lowered = cls.clone();
            for (a, b) in uppercase_overlaps(&ranges) {
                lowered.push(ClassUnicodeRange::new(
                    (a as u8).to_ascii_lowercase() as char,
                    (b as u8).to_ascii_lowercase() as char,
                ));
            }
            Class::Unicode(lowered)
        }
        Class::Bytes(cls) => {
            let ranges: Vec<(u32, u32)> = cls
                .iter()
                .map(|r| (r.start() as u32, r.end() as u32))
                .collect();
            let mut lowered = cls.clone();
            for (a, b) in uppercase_overlaps(&ranges) {
                lowered.push(ClassBytesRange::new(
                    (a as u8).to_ascii_lowercase(),
                    (b as u8).to_ascii_lowercase(),
                ));
            }
            Class::Bytes(lowered)
        }
    }
}

/// Parts of `ranges` inside `A-Z`, or nothing when a single range already
/// spans all of `a-z`.
fn uppercase_overlaps(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let (upper_a, upper_z) = (u32::from(b'A'), u32::from(b'Z'));
    let (lower_a, lower_z) = (u32::from(b'a'), u32::from(b'z'));
    if ranges.iter().any(|&(a, b)| a <= lower_a && b >= lower_z) {
        return Vec::new();
    }
    ranges
        .iter()
        .filter(|&&(a, b)| a <= upper_z && b >= upper_a)
        .map(|&(a, b)| (a.max(upper_a), b.min(upper_z)))
        .collect()
}
