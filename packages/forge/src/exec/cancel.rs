//! Cooperative cancellation.
//!
//! One build-wide flag plus a per-action flag, checked at the defined
//! polling points: deque pops, subprocess poll ticks, and cache lookups.
//! Cancellation never interrupts a thread; a stuck subprocess is killed by
//! the executor's timeout handling, not by the scheduler.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// A cancellation token.
///
/// Cloning shares the flag; `child` derives a token that also observes the
/// parent, so cancelling a build cancels every action token derived from
/// it without touching the per-action flags.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    own: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token cancelled by either this token or its own flag.
    pub fn child(&self) -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.own)),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.own.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested on this token or its parent.
    pub fn cancelled(&self) -> bool {
        self.own.load(Ordering::Acquire)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_cancels_children() {
        let build = CancelToken::new();
        let action = build.child();

        assert!(!action.cancelled());
        build.cancel();
        assert!(action.cancelled());
        assert!(build.cancelled());
    }

    #[test]
    fn child_cancel_is_isolated() {
        let build = CancelToken::new();
        let first = build.child();
        let second = build.child();

        first.cancel();
        assert!(first.cancelled());
        assert!(!second.cancelled());
        assert!(!build.cancelled());
    }
}
