//! Tokio-backed scheduler with a bounded number of in-flight tasks.
//!
//! Submissions beyond the bound are rejected immediately rather than queued.

use std::sync::Arc;

use junction_core::{RejectedExecution, ScheduledTask, Scheduler, TaskHandle};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::config::SchedulerConfig;

/// Runs submitted tasks on a Tokio runtime, holding a semaphore permit for
/// each one until it finishes.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    name: String,
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl TokioScheduler {
    /// Creates a scheduler on the given runtime.
    #[must_use]
    pub fn new(name: impl Into<String>, handle: Handle, config: SchedulerConfig) -> Self {
        Self {
            name: name.into(),
            handle,
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
        }
    }

    /// Creates a scheduler on the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn current(name: impl Into<String>, config: SchedulerConfig) -> Self {
        Self::new(name, Handle::current(), config)
    }

    /// Permits currently available for new submissions.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Scheduler for TokioScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, task: ScheduledTask) -> Result<TaskHandle, RejectedExecution> {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            tracing::warn!(scheduler = %self.name, "scheduler saturated, rejecting task");
            return Err(RejectedExecution {
                scheduler: self.name.clone(),
                reason: "maximum in-flight tasks reached".to_string(),
            });
        };

        let (task, handle) = TaskHandle::wrap(task);
        self.handle.spawn(async move {
            // Hold the permit for the duration of the task.
            task.await;
            drop(permit);
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn scheduler(max_in_flight: usize) -> TokioScheduler {
        TokioScheduler::current("test", SchedulerConfig { max_in_flight })
    }

    #[tokio::test]
    async fn runs_submitted_task() {
        let scheduler = scheduler(4);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = scheduler
            .submit(Box::pin(async move {
                let _ = tx.send(42);
            }))
            .unwrap();
        assert!(handle.finished().await);
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn rejects_when_saturated() {
        let scheduler = scheduler(1);
        let _busy = scheduler
            .submit(Box::pin(tokio::time::sleep(Duration::from_millis(200))))
            .unwrap();

        let err = scheduler.submit(Box::pin(async {})).unwrap_err();
        assert_eq!(err.scheduler, "test");
        assert_eq!(scheduler.available(), 0);
    }

    #[tokio::test]
    async fn releases_permit_when_task_finishes() {
        let scheduler = scheduler(1);
        let handle = scheduler.submit(Box::pin(async {})).unwrap();
        assert!(handle.finished().await);
        // The permit is dropped right after the completion signal.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(scheduler.available(), 1);
        assert!(scheduler.submit(Box::pin(async {})).is_ok());
    }
}
