//! Junction core: events, the context completion tracker, routing results,
//! and the processor and scheduler contracts.

pub mod context;
pub mod error;
pub mod event;
pub mod message;
pub mod routing;
pub mod traits;
pub mod value;

pub use context::{
    AsyncWorkGuard, ContextConfig, ContextResponse, ContextState, EventContext, SharedError,
};
pub use error::{
    panic_message, ContextError, RejectedExecution, RouteFailure, RouteTimeout, RoutingError,
};
pub use event::{Event, EventBuilder, Variables};
pub use message::Message;
pub use routing::{CompositeRoutingError, RouteKey, RoutingPair, RoutingResult};
pub use traits::{processor_fn, FnProcessor, Processor, ScheduledTask, Scheduler, TaskHandle};
pub use value::{DataType, TypedValue, Value, ValueKind};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
