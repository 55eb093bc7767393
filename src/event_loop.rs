//! Cooperative event loop.
//!
//! Every callback surfaced to user code runs here: one Tokio task draining a
//! FIFO of boxed tasks. Engine I/O tasks and the public API only *post* to
//! the loop, so callbacks never run concurrently with each other and never
//! run inline inside the call that caused them.
//!
//! "Next turn" means "after everything already queued": [`EventLoop::defer`]
//! appends to the same FIFO the engine posts to.

// ============================================================================
// Imports
// ============================================================================

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

// ============================================================================
// Types
// ============================================================================

/// A unit of work executed on the loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// EventLoop
// ============================================================================

/// Handle to the single-threaded cooperative scheduling context.
///
/// Cloning is cheap; all clones feed the same queue. The loop task ends
/// once every handle is dropped.
#[derive(Clone)]
pub struct EventLoop {
    /// Queue feeding the loop task.
    tx: mpsc::UnboundedSender<Task>,
}

impl EventLoop {
    /// Spawns the loop task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(rx));
        Self { tx }
    }

    /// Schedules `task` for the next turn.
    ///
    /// Returns `false` if the loop has stopped.
    pub fn defer(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }

    /// Schedules `task` on the loop once `delay` has elapsed.
    pub fn defer_after(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.defer(task);
        });
    }

    /// Resolves once every task queued before this call has run.
    pub async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        if self.defer(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }

    /// Drains the queue, isolating panics in user callbacks.
    async fn run(mut rx: mpsc::UnboundedReceiver<Task>) {
        trace!("Event loop started");

        while let Some(task) = rx.recv().await {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("Callback panicked on the event loop");
            }
        }

        trace!("Event loop stopped");
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
