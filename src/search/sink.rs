//! Result sink with a global match budget.

use crate::context::SearchContext;
use crate::protocol::FileMatch;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Callback receiving every delivered match.
pub type MatchCallback = Arc<dyn Fn(FileMatch) + Send + Sync>;

/// Forwards matches to a callback until a limit is reached.
///
/// The send that meets or crosses the limit truncates its own match to
/// exactly fill the budget, marks the limit as hit and cancels the stream's
/// context. Later sends deliver nothing.
pub struct LimitedStream {
    ctx: SearchContext,
    remaining: AtomicI64,
    limit_hit: AtomicBool,
    on_match: MatchCallback,
}

impl LimitedStream {
    /// Create a stream with its own child of `parent`; the child is canceled
    /// once the limit is reached.
    pub fn new(parent: &SearchContext, limit: usize, on_match: MatchCallback) -> Self {
        Self {
            ctx: parent.child(),
            remaining: AtomicI64::new(i64::try_from(limit).unwrap_or(i64::MAX)),
            limit_hit: AtomicBool::new(false),
            on_match,
        }
    }

    /// Context canceled when the limit is hit.
    pub fn context(&self) -> &SearchContext {
        &self.ctx
    }

    pub fn send(&self, mut file_match: FileMatch) {
        let count = file_match.match_count() as i64;
        let after = self.remaining.fetch_sub(count, Ordering::SeqCst) - count;
        let before = after + count;
        if before <= 0 {
            return;
        }
        if after < 0 {
            file_match.limit(before as usize);
        }
        (self.on_match)(file_match);
        if after <= 0 {
            self.limit_hit.store(true, Ordering::SeqCst);
            self.ctx.cancel();
        }
    }

    pub fn send_all(&self, matches: impl IntoIterator<Item = FileMatch>) {
        for m in matches {
            self.send(m);
        }
    }

    /// Budget left, never negative.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn limit_hit(&self) -> bool {
        self.limit_hit.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChunkMatch, Location, Range};
    use std::sync::Mutex;

    fn collecting(limit: usize) -> (LimitedStream, Arc<Mutex<Vec<FileMatch>>>, SearchContext) {
        let parent = SearchContext::background();
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = out.clone();
        let stream = LimitedStream::new(
            &parent,
            limit,
            Arc::new(move |m| sink.lock().unwrap().push(m)),
        );
        (stream, out, parent)
    }

    fn with_ranges(path: &str, n: u32) -> FileMatch {
        let ranges = (0..n)
            .map(|i| Range::new(Location::new(i, i, 0), Location::new(i + 1, i, 1)))
            .collect();
        FileMatch {
            path: path.into(),
            chunk_matches: vec![ChunkMatch {
                content: String::new(),
                content_start: Location::default(),
                ranges,
            }],
            limit_hit: false,
        }
    }

    #[test]
    fn test_straddling_send_is_truncated() {
        let (stream, out, parent) = collecting(5);
        stream.send(with_ranges("a", 3));
        assert!(!stream.limit_hit());
        stream.send(with_ranges("b", 4));
        assert!(stream.limit_hit());
        assert!(stream.context().is_done());
        assert!(!parent.is_done());

        stream.send(with_ranges("c", 1));
        let got = out.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].match_count(), 2);
        assert!(got[1].limit_hit);
        let total: usize = got.iter().map(|m| m.match_count()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn test_exact_fill_marks_limit() {
        let (stream, out, _) = collecting(2);
        stream.send(FileMatch::path_only("a"));
        stream.send(FileMatch::path_only("b"));
        assert!(stream.limit_hit());
        stream.send(FileMatch::path_only("c"));
        assert_eq!(out.lock().unwrap().len(), 2);
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn test_concurrent_senders_respect_budget() {
        let (stream, out, _) = collecting(100);
        let stream = Arc::new(stream);
        std::thread::scope(|s| {
            for t in 0..8 {
                let stream = stream.clone();
                s.spawn(move || {
                    for i in 0..50 {
                        stream.send(with_ranges(&format!("{}-{}", t, i), 3));
                    }
                });
            }
        });
        let total: usize = out.lock().unwrap().iter().map(|m| m.match_count()).sum();
        assert_eq!(total, 100);
        assert!(stream.limit_hit());
    }
}
