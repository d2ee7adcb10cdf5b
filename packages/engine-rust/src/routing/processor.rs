//! Tower service adapter for routes.

use async_trait::async_trait;
use junction_core::{Event, Processor};
use tower::{Service, ServiceExt};

/// Exposes a `tower::Service<Event>` as a route [`Processor`].
///
/// Each call clones the service and drives it with `oneshot`, so readiness
/// is awaited per event and the shared instance is never borrowed mutably.
#[derive(Debug, Clone)]
pub struct ServiceProcessor<S> {
    inner: S,
}

impl<S> ServiceProcessor<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> Processor for ServiceProcessor<S>
where
    S: Service<Event, Response = Event> + Clone + Send + Sync + 'static,
    S::Error: Into<anyhow::Error>,
    S::Future: Send + 'static,
{
    async fn process(&self, event: Event) -> anyhow::Result<Event> {
        self.inner.clone().oneshot(event).await.map_err(Into::into)
    }
}
