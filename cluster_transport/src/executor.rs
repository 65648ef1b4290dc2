//! Named execution categories for handler bodies.
//!
//! Handlers declare the category they run under. The default pool runs
//! [`names::SAME`] inline on the dispatching task and everything else on
//! tokio's blocking pool, bounded per category by a semaphore, so a slow
//! handler never holds up frame delivery.

use std::{collections::HashMap, sync::Arc};

use tokio::{runtime::Handle, sync::Semaphore};

use crate::error::{Result, TransportError};

/// Well-known category names.
pub mod names {
    /// Run inline on the calling task. Intended for tests and trivial
    /// callbacks only.
    pub const SAME: &str = "same";
    pub const GENERIC: &str = "generic";
    pub const MANAGEMENT: &str = "management";
}

/// A unit of work submitted to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks under named categories.
pub trait TaskExecutor: Send + Sync {
    /// # Errors
    ///
    /// Returns `UnknownExecutor` if `category` is not configured.
    fn execute(&self, category: &str, task: Task) -> Result<()>;

    fn has_category(&self, category: &str) -> bool;
}

/// Default [`TaskExecutor`] backed by a tokio runtime.
pub struct ThreadPool {
    runtime: Handle,
    categories: HashMap<String, Arc<Semaphore>>,
}

impl ThreadPool {
    /// Default concurrency of the `generic` category.
    pub const DEFAULT_GENERIC_SIZE: usize = 128;
    /// Default concurrency of the `management` category.
    pub const DEFAULT_MANAGEMENT_SIZE: usize = 5;

    /// Pool with the default categories on `runtime`.
    #[must_use]
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            categories: HashMap::new(),
        }
        .with_category(names::GENERIC, Self::DEFAULT_GENERIC_SIZE)
        .with_category(names::MANAGEMENT, Self::DEFAULT_MANAGEMENT_SIZE)
    }

    /// Pool on the runtime of the calling context.
    ///
    /// # Errors
    ///
    /// Returns `Config` when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| TransportError::Config(format!("no tokio runtime: {e}")))
    }

    /// Adds or resizes a category allowing `max_concurrent` tasks at once.
    #[must_use]
    pub fn with_category(mut self, name: impl Into<String>, max_concurrent: usize) -> Self {
        self.categories.insert(
            name.into(),
            Arc::new(Semaphore::new(max_concurrent.max(1))),
        );
        self
    }
}

impl TaskExecutor for ThreadPool {
    fn execute(&self, category: &str, task: Task) -> Result<()> {
        if category == names::SAME {
            task();
            return Ok(());
        }

        let permits = self
            .categories
            .get(category)
            .cloned()
            .ok_or_else(|| TransportError::UnknownExecutor(category.to_string()))?;

        self.runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                if e.is_panic() {
                    tracing::warn!("executor task panicked");
                }
            }
        });
        Ok(())
    }

    fn has_category(&self, category: &str) -> bool {
        category == names::SAME || self.categories.contains_key(category)
    }
}
