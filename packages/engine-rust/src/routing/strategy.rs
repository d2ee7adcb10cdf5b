//! Fork-join routing strategy.
//!
//! Fans a set of routing pairs out to their routes, bounded by the configured
//! concurrency, and reduces the outcomes to one event. In eager mode the first
//! failure fails the whole operation. In delayed mode every route runs to
//! completion and failures are reported together.

use std::sync::Arc;
use std::time::Instant;

use junction_core::{
    CompositeRoutingError, Event, RouteFailure, RoutingError, RoutingPair, Scheduler,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info_span, Instrument};

use super::accumulator::RouteAccumulator;
use super::aggregation::{aggregate_event, Aggregation, CollectList, CollectMap, JoinOnly};
use super::route::run_route;
use crate::config::ForkJoinConfig;

/// Fork-join that collects route outputs into a list.
pub type CollectListStrategy = ForkJoinStrategy<CollectList>;
/// Fork-join that collects route outputs into an index-keyed map.
pub type CollectMapStrategy = ForkJoinStrategy<CollectMap>;
/// Fork-join that keeps the original message and only merges variables.
pub type JoinOnlyStrategy = ForkJoinStrategy<JoinOnly>;

type Completion = (usize, Result<Event, RouteFailure>);

/// Fans an event out to routes on the scheduler and joins their outputs with
/// the aggregation `A`.
///
/// At most `max_concurrency` routes run at once. With `delay_errors` every
/// route runs to the end and failures are reported together. Otherwise the
/// first failure is returned at once and no further routes are dispatched.
pub struct ForkJoinStrategy<A> {
    config: ForkJoinConfig,
    scheduler: Arc<dyn Scheduler>,
    aggregation: A,
}

impl<A: Aggregation> ForkJoinStrategy<A> {
    #[must_use]
    pub fn new(config: ForkJoinConfig, scheduler: Arc<dyn Scheduler>, aggregation: A) -> Self {
        Self {
            config,
            scheduler,
            aggregation,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ForkJoinConfig {
        &self.config
    }

    #[must_use]
    pub fn aggregation(&self) -> &A {
        &self.aggregation
    }

    /// Runs every pair and aggregates the outputs into one event bound to
    /// `original`'s context.
    ///
    /// # Errors
    ///
    /// - [`RoutingError::Route`]: eager mode, the first route failure.
    /// - [`RoutingError::Composite`]: delayed mode, at least one route failed.
    /// - [`RoutingError::Rejected`]: the scheduler refused a route, in either mode.
    /// - [`RoutingError::Context`]: a child context could not be created.
    /// - [`RoutingError::Abandoned`]: a scheduled route never reported back.
    pub async fn fork_join(
        &self,
        original: Event,
        pairs: Vec<RoutingPair>,
    ) -> Result<Event, RoutingError> {
        let span = info_span!(
            "fork_join",
            aggregation = self.aggregation.name(),
            routes = pairs.len(),
            concurrency = self.config.max_concurrency,
            delay_errors = self.config.delay_errors,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async move {
            let start = Instant::now();
            let result = self.run(&original, pairs).await;

            let outcome = match &result {
                Ok(_) => "ok",
                Err(RoutingError::Composite(_)) => "partial_failure",
                Err(e) if e.is_timeout() => "timeout",
                Err(_) => "error",
            };
            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);
            tracing::info!(duration_ms, outcome, "fork-join complete");

            result
        }
        .instrument(span)
        .await
    }

    /// Blocking variant of [`fork_join`](Self::fork_join) for synchronous
    /// callers.
    ///
    /// # Errors
    ///
    /// Same as [`fork_join`](Self::fork_join).
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn fork_join_blocking(
        &self,
        handle: &Handle,
        original: Event,
        pairs: Vec<RoutingPair>,
    ) -> Result<Event, RoutingError> {
        handle.block_on(self.fork_join(original, pairs))
    }

    async fn run(&self, original: &Event, pairs: Vec<RoutingPair>) -> Result<Event, RoutingError> {
        let mut acc = RouteAccumulator::new(pairs.len());
        if self.config.max_concurrency <= 1 {
            self.run_sequential(original, pairs, &mut acc).await?;
        } else {
            self.run_concurrent(original, pairs, &mut acc).await?;
        }

        if acc.has_failures() {
            return Err(CompositeRoutingError::new(acc.into_routing_result()).into());
        }
        Ok(aggregate_event(
            &self.aggregation,
            original,
            &acc.successes(),
        ))
    }

    /// Runs routes inline, one at a time, without touching the scheduler.
    async fn run_sequential(
        &self,
        original: &Event,
        pairs: Vec<RoutingPair>,
        acc: &mut RouteAccumulator,
    ) -> Result<(), RoutingError> {
        let timeout = self.config.timeout();
        for (index, pair) in pairs.into_iter().enumerate() {
            let context = original.context().child()?;
            let outcome = run_route(index, pair.route, pair.event, context, timeout).await;
            if let Err(failure) = &outcome {
                if !self.config.delay_errors {
                    return Err(RoutingError::Route(failure.clone()));
                }
            }
            acc.record(index, outcome);
        }
        Ok(())
    }

    /// Aggregator loop: keeps up to `max_concurrency` routes scheduled and
    /// folds their completions into `acc` as they arrive.
    async fn run_concurrent(
        &self,
        original: &Event,
        pairs: Vec<RoutingPair>,
        acc: &mut RouteAccumulator,
    ) -> Result<(), RoutingError> {
        let timeout = self.config.timeout();
        let delay_errors = self.config.delay_errors;
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        // Dropped once every route is dispatched so that routes lost by the
        // scheduler surface as a closed channel.
        let mut sender = Some(tx);
        let mut pending = pairs.into_iter().enumerate();
        let mut in_flight = 0usize;

        loop {
            while in_flight < self.config.max_concurrency && (delay_errors || !acc.has_failures())
            {
                let Some((index, pair)) = pending.next() else {
                    sender = None;
                    break;
                };
                let Some(tx) = sender.clone() else { break };

                let context = original.context().child()?;
                let task_context = context.clone();
                let task = Box::pin(async move {
                    let outcome =
                        run_route(index, pair.route, pair.event, task_context, timeout).await;
                    // The aggregator is gone when an eager fork-join already failed.
                    let _ = tx.send((index, outcome));
                });

                if let Err(source) = self.scheduler.submit(task) {
                    tracing::warn!(route = index, error = %source, "route rejected by scheduler");
                    context.error(Arc::new(source.clone()));
                    return Err(RoutingError::Rejected { index, source });
                }
                in_flight += 1;
            }

            if in_flight == 0 {
                return Ok(());
            }

            let Some((index, outcome)) = rx.recv().await else {
                return Err(RoutingError::Abandoned { pending: in_flight });
            };
            in_flight -= 1;

            if let Err(failure) = &outcome {
                if !delay_errors {
                    return Err(RoutingError::Route(failure.clone()));
                }
            }
            acc.record(index, outcome);
        }
    }
}

impl<A: Aggregation + std::fmt::Debug> std::fmt::Debug for ForkJoinStrategy<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkJoinStrategy")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler.name())
            .field("aggregation", &self.aggregation)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
