//! Progress notifications and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a long-running mailbox operation is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Parsing: bytes scanned out of the file size.
    Reading { done: u64, total: u64 },
    /// Syncing: messages written out of the messages to rewrite.
    Writing { done: usize, total: usize },
}

/// Passive progress sink. Nothing depends on what it does.
pub type ProgressSink = Box<dyn Fn(ProgressEvent) + Send>;

/// Interrupt flag checked at parse loop boundaries.
///
/// Clones share the same flag, so a token handed to a signal handler or
/// another thread can stop a parse running on the mailbox thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a pending cancellation. Returns whether one was pending.
    pub fn reset(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(token.reset());
        assert!(!other.is_cancelled());
        assert!(!token.reset());
    }
}
