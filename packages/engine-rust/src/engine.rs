//! Engine facade: owns the configuration and the shared scheduler, and builds
//! strategies, routers, and resource managers from them.

use std::sync::Arc;

use junction_core::{Event, EventContext, Message, Processor, Scheduler};
use tokio::runtime::Handle;

use crate::config::{ConfigError, EngineConfig};
use crate::routing::{
    Aggregation, CollectList, CollectListStrategy, CollectMap, CollectMapStrategy,
    ForkJoinStrategy, JoinOnly, JoinOnlyStrategy, ParallelForEach, RouterError, ScatterGather,
    TokioScheduler,
};
use crate::transaction::{ResourceManager, TransactionalResource, XaResourceManager};

/// Entry point for embedding the engine. Every strategy and router it builds
/// shares one scheduler and the validated [`EngineConfig`].
pub struct RoutingEngine {
    config: EngineConfig,
    scheduler: Arc<dyn Scheduler>,
}

impl RoutingEngine {
    /// Creates an engine whose routes run on `handle`.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting in `config`.
    pub fn new(config: EngineConfig, handle: Handle) -> Result<Self, ConfigError> {
        let scheduler = Arc::new(TokioScheduler::new("routing", handle, config.scheduler));
        Self::with_scheduler(config, scheduler)
    }

    /// Creates an engine that submits routes to a custom scheduler.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting in `config`.
    pub fn with_scheduler(
        config: EngineConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        tracing::info!(
            scheduler = scheduler.name(),
            max_concurrency = config.fork_join.max_concurrency,
            delay_errors = config.fork_join.delay_errors,
            timeout_ms = config.fork_join.timeout_ms,
            "routing engine created"
        );
        Ok(Self { config, scheduler })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// A new event under a fresh root context that uses the configured
    /// call-stack limit.
    #[must_use]
    pub fn new_event(&self, message: Message) -> Event {
        Event::new(EventContext::root_with(self.config.context), message)
    }

    #[must_use]
    pub fn strategy<A: Aggregation>(&self, aggregation: A) -> ForkJoinStrategy<A> {
        ForkJoinStrategy::new(
            self.config.fork_join,
            Arc::clone(&self.scheduler),
            aggregation,
        )
    }

    #[must_use]
    pub fn collect_list(&self) -> CollectListStrategy {
        self.strategy(CollectList)
    }

    #[must_use]
    pub fn collect_map(&self) -> CollectMapStrategy {
        self.strategy(CollectMap)
    }

    #[must_use]
    pub fn join_only(&self) -> JoinOnlyStrategy {
        self.strategy(JoinOnly)
    }

    /// # Errors
    ///
    /// Returns [`RouterError::TooFewRoutes`] with fewer than two routes.
    pub fn scatter_gather(
        &self,
        routes: Vec<Arc<dyn Processor>>,
    ) -> Result<ScatterGather<CollectMap>, RouterError> {
        ScatterGather::new(routes, self.collect_map())
    }

    #[must_use]
    pub fn parallel_for_each(&self, route: Arc<dyn Processor>) -> ParallelForEach {
        ParallelForEach::new(route, self.collect_list())
    }

    pub fn resource_manager<R: TransactionalResource>(
        &self,
        name: impl Into<String>,
        resource: R,
    ) -> ResourceManager<R> {
        ResourceManager::new(name, resource, self.config.transactions)
    }

    pub fn xa_resource_manager<R: TransactionalResource>(
        &self,
        name: impl Into<String>,
        resource: R,
    ) -> XaResourceManager<R> {
        XaResourceManager::new(name, resource, self.config.transactions)
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler.name())
            .finish()
    }
}
