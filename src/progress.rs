//! Progress-callback trait for per-item pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgress>`] via
//! [`crate::config::PipelineConfigBuilder::progress`] to receive real-time
//! events as line items are classified.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers
//! can forward events to a channel, a WebSocket, or a terminal progress bar
//! without the library knowing how the host application communicates. The
//! trait is `Send + Sync` because items are classified concurrently.

use std::sync::Arc;

/// Called by the pipeline as it classifies each line item.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `on_item_done` may be called concurrently from
/// different tasks; implementations must synchronise shared mutable state.
pub trait PipelineProgress: Send + Sync {
    /// Called once after parsing, before any classification call is issued.
    fn on_run_start(&self, total_items: usize) {
        let _ = total_items;
    }

    /// Called as each item's classification finishes (in completion order,
    /// not document order).
    ///
    /// `failed` is true when the item ends up `ClassificationUnavailable`.
    fn on_item_done(&self, ordinal: usize, total_items: usize, failed: bool) {
        let _ = (ordinal, total_items, failed);
    }

    /// Called once after every item has been attempted.
    fn on_run_complete(&self, total_items: usize, failed_items: usize) {
        let _ = (total_items, failed_items);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgress;

impl PipelineProgress for NoopProgress {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type Progress = Arc<dyn PipelineProgress>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracking {
        done: AtomicUsize,
        failed: AtomicUsize,
    }

    impl PipelineProgress for Tracking {
        fn on_item_done(&self, _ordinal: usize, _total: usize, failed: bool) {
            self.done.fetch_add(1, Ordering::SeqCst);
            if failed {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn noop_does_not_panic() {
        let p = NoopProgress;
        p.on_run_start(3);
        p.on_item_done(0, 3, false);
        p.on_item_done(1, 3, true);
        p.on_run_complete(3, 1);
    }

    #[test]
    fn tracking_receives_events() {
        let t = Tracking {
            done: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        };
        t.on_item_done(0, 2, false);
        t.on_item_done(1, 2, true);
        assert_eq!(t.done.load(Ordering::SeqCst), 2);
        assert_eq!(t.failed.load(Ordering::SeqCst), 1);
    }
}
