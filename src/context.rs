//! Cancellation context passed down every search call.
//!
//! A [`SearchContext`] couples a [`CancellationToken`] with an optional
//! deadline and remembers *why* it ended, so callers can tell a caller that
//! went away (or a satisfied result budget) from a stalled operation.

use crate::error::SearchError;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Reason a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    Canceled,
    DeadlineExceeded,
}

impl From<ContextError> for SearchError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Canceled => SearchError::Canceled,
            ContextError::DeadlineExceeded => SearchError::DeadlineExceeded,
        }
    }
}

struct Inner {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: OnceLock<ContextError>,
    parent: Option<SearchContext>,
}

#[derive(Clone)]
pub struct SearchContext {
    inner: Arc<Inner>,
}

impl Default for SearchContext {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for SearchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchContext")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

impl SearchContext {
    /// A root context that is never done on its own.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                deadline: None,
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derive a child that is canceled together with `self`.
    pub fn child(&self) -> Self {
        self.derive(self.inner.deadline)
    }

    /// Derive a child whose deadline is the earlier of `deadline` and ours.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(own) if own < deadline => own,
            _ => deadline,
        };
        self.derive(Some(deadline))
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                deadline,
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Cancel this context and all of its children. Idempotent.
    pub fn cancel(&self) {
        let _ = self.inner.cause.set(ContextError::Canceled);
        self.inner.token.cancel();
    }

    /// Why this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(cause) = self.inner.cause.get() {
            return Some(*cause);
        }
        if let Some(parent) = &self.inner.parent {
            if let Some(cause) = parent.err() {
                return Some(self.finish(cause));
            }
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return Some(self.finish(ContextError::DeadlineExceeded));
            }
        }
        if self.inner.token.is_cancelled() {
            return Some(self.finish(ContextError::Canceled));
        }
        None
    }

    fn finish(&self, cause: ContextError) -> ContextError {
        let cause = *self.inner.cause.get_or_init(|| cause);
        self.inner.token.cancel();
        cause
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Return the context error as a [`SearchError`] if done.
    pub fn check(&self) -> Result<(), SearchError> {
        match self.err() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) {
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.inner.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => self.inner.token.cancelled().await,
        }
        let _ = self.err();
    }

    /// Time left before the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_child() {
        let parent = SearchContext::background();
        let child = parent.child();
        assert!(!child.is_done());
        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let parent = SearchContext::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[test]
    fn test_deadline_exceeded() {
        let ctx = SearchContext::background().with_deadline(Instant::now());
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        // cause is sticky even if canceled afterwards
        ctx.cancel();
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn test_cancel_before_deadline_stays_canceled() {
        let ctx = SearchContext::background().with_timeout(Duration::from_millis(1));
        ctx.cancel();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_child_keeps_earlier_deadline() {
        let parent = SearchContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_done_resolves_on_deadline() {
        let ctx = SearchContext::background().with_timeout(Duration::from_millis(10));
        ctx.done().await;
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }
}
