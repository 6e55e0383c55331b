//! Caller-facing progress reporting and cooperative cancellation.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use tokio_util::sync::CancellationToken;

/// A handle carrying total/completed byte counts and a cancellation flag.
///
/// A `Progress` is cheap to clone; all clones observe the same counters. The
/// total starts out at `-1`, meaning "not yet known"; the first component
/// that learns the segment length seeds it.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

#[derive(Debug)]
struct ProgressInner {
    total: AtomicI64,
    completed: AtomicI64,
    cancel: CancellationToken,
}

impl Default for ProgressInner {
    fn default() -> Self {
        Self {
            total: AtomicI64::new(-1),
            completed: AtomicI64::new(0),
            cancel: CancellationToken::new(),
        }
    }
}

impl Progress {
    /// A fresh handle with an unknown total.
    pub fn new() -> Self {
        Self::default()
    }

    /// The expected number of units, or a negative value when unknown.
    pub fn total(&self) -> i64 {
        self.inner.total.load(Ordering::Acquire)
    }

    /// Sets the expected number of units.
    pub fn set_total(&self, total: i64) {
        self.inner.total.store(total, Ordering::Release);
    }

    /// The number of units completed so far.
    pub fn completed(&self) -> i64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Sets the completed unit count.
    pub fn set_completed(&self, completed: i64) {
        self.inner.completed.store(completed, Ordering::Release);
    }

    /// Adds to the completed unit count.
    pub fn add_completed(&self, units: u64) {
        self.inner.completed.fetch_add(units as i64, Ordering::AcqRel);
    }

    /// Requests cancellation of the operation this handle was passed to.
    ///
    /// Cancellation is cooperative: in-flight work checks the flag at chunk
    /// boundaries and answers with a terminal `on_aborted(None)`.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await;
    }
}
