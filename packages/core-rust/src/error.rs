//! Error taxonomy shared by the routing engine and its collaborators.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::routing::CompositeRoutingError;

/// A route did not produce a result within its configured timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("route timed out after {timeout:?}")]
pub struct RouteTimeout {
    pub timeout: Duration,
}

/// Why a single route of a fork-join did not produce a result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteFailure {
    #[error(transparent)]
    Timeout(RouteTimeout),
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
    #[error("route panicked: {0}")]
    Panicked(String),
}

impl RouteFailure {
    pub fn failed(cause: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(cause.into()))
    }

    /// True for timeouts raised by the strategy and for timeout causes a
    /// processor returned itself.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Failed(cause) => cause
                .chain()
                .any(|e| e.is::<RouteTimeout>() || e.is::<tokio::time::error::Elapsed>()),
            Self::Panicked(_) => false,
        }
    }

    /// The processor's own error, when there is one.
    #[must_use]
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Failed(cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for RouteFailure {
    fn from(cause: anyhow::Error) -> Self {
        Self::Failed(Arc::new(cause))
    }
}

/// The scheduler refused a submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("scheduler '{scheduler}' rejected task: {reason}")]
pub struct RejectedExecution {
    pub scheduler: String,
    pub reason: String,
}

/// Fatal errors raised by the context tree. Never retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("too many nested child contexts: depth {depth} exceeds the limit of {max}")]
    CallStackOverflow { depth: usize, max: usize },
    /// A complete context cannot gain children.
    #[error("context {id} is already complete")]
    AlreadyComplete { id: String },
}

/// Failure of a whole fork-join operation.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// Eager mode: the first route failure, unwrapped.
    #[error(transparent)]
    Route(RouteFailure),
    /// Delayed mode: at least one route failed.
    #[error(transparent)]
    Composite(#[from] CompositeRoutingError),
    #[error("route {index} could not be scheduled")]
    Rejected {
        index: usize,
        #[source]
        source: RejectedExecution,
    },
    #[error(transparent)]
    Context(#[from] ContextError),
    /// The route completions stopped arriving before every route reported.
    #[error("fork-join abandoned with {pending} route(s) still pending")]
    Abandoned { pending: usize },
}

impl RoutingError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Route(failure) if failure.is_timeout())
    }
}

impl From<RouteFailure> for RoutingError {
    fn from(failure: RouteFailure) -> Self {
        Self::Route(failure)
    }
}

/// Extracts a readable message from a caught panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_recognized_through_cause_chain() {
        let direct = RouteFailure::Timeout(RouteTimeout {
            timeout: Duration::from_millis(5),
        });
        assert!(direct.is_timeout());

        let returned = RouteFailure::failed(
            anyhow::Error::new(RouteTimeout {
                timeout: Duration::from_millis(5),
            })
            .context("calling downstream"),
        );
        assert!(returned.is_timeout());

        let plain = RouteFailure::failed(anyhow::anyhow!("boom"));
        assert!(!plain.is_timeout());
        assert_eq!(plain.to_string(), "boom");
    }

    #[test]
    fn routing_error_timeout_only_for_route_variant() {
        let err = RoutingError::from(RouteFailure::Timeout(RouteTimeout {
            timeout: Duration::from_millis(1),
        }));
        assert!(err.is_timeout());
        assert!(!RoutingError::Abandoned { pending: 1 }.is_timeout());
    }

    #[test]
    fn panic_message_handles_str_and_string() {
        let a: Box<dyn Any + Send> = Box::new("static");
        let b: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let c: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(a.as_ref()), "static");
        assert_eq!(panic_message(b.as_ref()), "owned");
        assert_eq!(panic_message(c.as_ref()), "unknown panic payload");
    }
}
