//! Parallel for-each router over the elements of an array payload.

use std::sync::Arc;

use async_trait::async_trait;
use junction_core::{Event, Message, Processor, RoutingPair, Value};

use super::aggregation::CollectList;
use super::strategy::ForkJoinStrategy;
use super::RouterError;

/// Runs one route invocation per element of an array payload, in parallel,
/// and collects the outputs in element order.
///
/// Elements that are messages are sent as they are. Any other element becomes
/// the payload of a fresh message.
pub struct ParallelForEach {
    route: Arc<dyn Processor>,
    strategy: ForkJoinStrategy<CollectList>,
    target: Option<String>,
}

impl ParallelForEach {
    #[must_use]
    pub fn new(route: Arc<dyn Processor>, strategy: ForkJoinStrategy<CollectList>) -> Self {
        Self {
            route,
            strategy,
            target: None,
        }
    }

    /// Stores the collected list in variable `name` and keeps the incoming
    /// message as the result message.
    #[must_use]
    pub fn with_target(mut self, name: impl Into<String>) -> Self {
        self.target = Some(name.into());
        self
    }

    fn split(event: &Event) -> Result<Vec<Message>, RouterError> {
        let payload = event.message().payload().value();
        let Value::Array(items) = payload else {
            return Err(RouterError::NotACollection {
                kind: payload.kind(),
            });
        };
        Ok(items
            .iter()
            .map(|item| match item {
                Value::Message(message) => (**message).clone(),
                other => Message::of(other.clone()),
            })
            .collect())
    }
}

#[async_trait]
impl Processor for ParallelForEach {
    async fn process(&self, event: Event) -> anyhow::Result<Event> {
        let pairs = Self::split(&event)?
            .into_iter()
            .map(|message| {
                RoutingPair::new(event.clone().with_message(message), Arc::clone(&self.route))
            })
            .collect();

        let result = self.strategy.fork_join(event.clone(), pairs).await?;
        Ok(match &self.target {
            Some(name) => {
                let collected = result.message().payload().clone();
                result
                    .with_message(event.message().clone())
                    .with_variable(name.clone(), collected)
            }
            None => result,
        })
    }
}
