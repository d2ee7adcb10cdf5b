//! Execution of a single route under its own child context.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use junction_core::{panic_message, Event, EventContext, Processor, RouteFailure, RouteTimeout};

/// Runs `route` with `event` rebound to `context`, then completes `context`
/// with the outcome.
///
/// With a timeout the route runs on its own task and races a timer. When the
/// timer wins the task is left running detached; its eventual result is
/// dropped.
pub(crate) async fn run_route(
    index: usize,
    route: Arc<dyn Processor>,
    event: Event,
    context: EventContext,
    timeout: Option<Duration>,
) -> Result<Event, RouteFailure> {
    tracing::debug!(route = index, context = %context.id(), "dispatching route");
    let event = event.with_context(context.clone());

    let outcome = match timeout {
        None => match AssertUnwindSafe(route.process(event)).catch_unwind().await {
            Ok(result) => result.map_err(RouteFailure::from),
            Err(payload) => Err(RouteFailure::Panicked(panic_message(payload.as_ref()))),
        },
        Some(timeout) => {
            let task = tokio::spawn(async move { route.process(event).await });
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => result.map_err(RouteFailure::from),
                Ok(Err(join_err)) if join_err.is_panic() => Err(RouteFailure::Panicked(
                    panic_message(join_err.into_panic().as_ref()),
                )),
                Ok(Err(_)) => Err(RouteFailure::Panicked("route task was cancelled".to_string())),
                Err(_elapsed) => Err(RouteFailure::Timeout(RouteTimeout { timeout })),
            }
        }
    };

    match &outcome {
        Ok(result) => {
            context.success_with(result.clone());
        }
        Err(failure) => {
            tracing::debug!(route = index, error = %failure, "route failed");
            context.error(Arc::new(failure.clone()));
        }
    }
    outcome
}
