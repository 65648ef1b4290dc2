//! Deferred timeout tasks.

use std::time::{Duration, Instant};

use tokio::{runtime::Handle, task::AbortHandle};

/// Schedules closures to run after a delay on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TimeoutScheduler {
    runtime: Handle,
}

impl TimeoutScheduler {
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }

    /// Runs `task` once `delay` has elapsed unless the handle is cancelled
    /// first. A delay past the clock's range never fires.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now().checked_add(delay);
        let join = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimeoutHandle {
            abort: join.abort_handle(),
            deadline,
            delay,
        }
    }
}

/// Cancellable handle to a scheduled timeout.
#[derive(Debug)]
pub struct TimeoutHandle {
    abort: AbortHandle,
    deadline: Option<Instant>,
    delay: Duration,
}

impl TimeoutHandle {
    /// Prevents the task from running if it has not fired yet.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    /// `None` when the delay cannot be represented as an instant.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }
}
