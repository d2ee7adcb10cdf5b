//! Scatter-gather router: one event, many routes, one aggregated reply.

use std::sync::Arc;

use async_trait::async_trait;
use junction_core::{Event, Processor, RoutingPair};

use super::aggregation::{Aggregation, CollectMap};
use super::strategy::ForkJoinStrategy;
use super::RouterError;

/// Sends the same event to every route and aggregates the replies.
///
/// A scatter-gather is itself a [`Processor`], so it can be a route of
/// another fork-join.
pub struct ScatterGather<A = CollectMap> {
    routes: Vec<Arc<dyn Processor>>,
    strategy: ForkJoinStrategy<A>,
}

impl<A: Aggregation> ScatterGather<A> {
    pub const MIN_ROUTES: usize = 2;

    /// # Errors
    ///
    /// Returns [`RouterError::TooFewRoutes`] with fewer than two routes.
    pub fn new(
        routes: Vec<Arc<dyn Processor>>,
        strategy: ForkJoinStrategy<A>,
    ) -> Result<Self, RouterError> {
        if routes.len() < Self::MIN_ROUTES {
            return Err(RouterError::TooFewRoutes {
                min: Self::MIN_ROUTES,
                actual: routes.len(),
            });
        }
        Ok(Self { routes, strategy })
    }

    #[must_use]
    pub fn routes(&self) -> &[Arc<dyn Processor>] {
        &self.routes
    }
}

#[async_trait]
impl<A: Aggregation> Processor for ScatterGather<A> {
    async fn process(&self, event: Event) -> anyhow::Result<Event> {
        let pairs = self
            .routes
            .iter()
            .map(|route| RoutingPair::new(event.clone(), Arc::clone(route)))
            .collect();
        Ok(self.strategy.fork_join(event, pairs).await?)
    }
}
