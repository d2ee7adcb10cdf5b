//! Fork-join routing: strategies, scheduling, and the routers built on them.

mod accumulator;
pub mod aggregation;
pub mod foreach;
pub mod processor;
mod route;
pub mod scatter_gather;
pub mod scheduler;
pub mod strategy;

use junction_core::ValueKind;

pub use aggregation::{
    aggregate_event, merge_variables, Aggregation, CollectList, CollectMap, JoinOnly,
};
pub use foreach::ParallelForEach;
pub use processor::ServiceProcessor;
pub use scatter_gather::ScatterGather;
pub use scheduler::TokioScheduler;
pub use strategy::{CollectListStrategy, CollectMapStrategy, ForkJoinStrategy, JoinOnlyStrategy};

/// Misconfiguration or misuse of a router.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("router needs at least {min} routes, got {actual}")]
    TooFewRoutes { min: usize, actual: usize },
    #[error("payload of kind {kind:?} is not a collection")]
    NotACollection { kind: ValueKind },
}
