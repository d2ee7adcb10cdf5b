//! Extension points of the routing core: processors that handle events and
//! schedulers that run route tasks.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::RejectedExecution;
use crate::event::Event;

/// A route target: consumes an event and produces a result event or fails.
///
/// Processors receive the event explicitly. Anything they need from the
/// surrounding flow (variables, context) travels on the event itself.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, event: Event) -> anyhow::Result<Event>;
}

/// Adapts an async closure into a [`Processor`].
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Event>> + Send + 'static,
{
    FnProcessor(f)
}

/// Processor backed by a closure. See [`processor_fn`].
#[derive(Clone)]
pub struct FnProcessor<F>(F);

impl<F> fmt::Debug for FnProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnProcessor")
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Event>> + Send + 'static,
{
    async fn process(&self, event: Event) -> anyhow::Result<Event> {
        (self.0)(event).await
    }
}

/// Unit of work handed to a [`Scheduler`].
pub type ScheduledTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Executes submitted work, possibly on another thread, and may refuse it.
///
/// Implementations must either run the task to completion or reject it up
/// front; a task that was accepted and then silently dropped leaves its
/// fork-join waiting on a route that never reports.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Submits a task for execution.
    ///
    /// # Errors
    ///
    /// Returns [`RejectedExecution`] if the scheduler cannot accept the task.
    fn submit(&self, task: ScheduledTask) -> Result<TaskHandle, RejectedExecution>;
}

/// Completion handle for a submitted task. Runtime-agnostic: schedulers wrap
/// the task with [`TaskHandle::wrap`] before running it however they like.
#[derive(Debug)]
pub struct TaskHandle {
    done: oneshot::Receiver<()>,
}

impl TaskHandle {
    /// Wraps `task` so the returned handle observes its completion.
    #[must_use]
    pub fn wrap(task: ScheduledTask) -> (ScheduledTask, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let wrapped = Box::pin(async move {
            task.await;
            let _ = tx.send(());
        });
        (wrapped, TaskHandle { done: rx })
    }

    /// True once the task ran to completion or was dropped by its executor.
    pub fn is_finished(&mut self) -> bool {
        !matches!(self.done.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }

    /// Waits for the task to finish. Returns `false` if the executor dropped
    /// it without running it to completion.
    pub async fn finished(self) -> bool {
        self.done.await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EventContext;
    use crate::message::Message;
    use crate::value::Value;

    #[tokio::test]
    async fn processor_fn_runs_closure() {
        let upper = processor_fn(|event: Event| async move {
            let text = event.message().payload().value().to_string().to_uppercase();
            Ok::<_, anyhow::Error>(event.with_message(Message::of(text)))
        });
        let out = upper
            .process(Event::new(EventContext::root(), Message::of("abc")))
            .await
            .unwrap();
        assert_eq!(out.message().payload().value(), &Value::from("ABC"));
    }

    #[tokio::test]
    async fn task_handle_observes_completion() {
        let (task, mut handle) = TaskHandle::wrap(Box::pin(async {}));
        assert!(!handle.is_finished());
        task.await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn task_handle_reports_dropped_task() {
        let (task, handle) = TaskHandle::wrap(Box::pin(async {}));
        drop(task);
        assert!(!handle.finished().await);
    }
}
