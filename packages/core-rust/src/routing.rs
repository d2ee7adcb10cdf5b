//! Routing pairs and the per-route outcome of a fork-join.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::RouteFailure;
use crate::event::Event;
use crate::message::Message;
use crate::traits::Processor;
use crate::value::Value;

/// One route of a fan-out: the event to send and the processor to send it to.
#[derive(Clone)]
pub struct RoutingPair {
    pub event: Event,
    pub route: Arc<dyn Processor>,
}

impl RoutingPair {
    pub fn new(event: Event, route: Arc<dyn Processor>) -> Self {
        Self { event, route }
    }
}

impl fmt::Debug for RoutingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingPair")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Zero-based position of a route in submission order.
///
/// Orders numerically and displays as its decimal string, so `"10"` sorts
/// after `"9"` in every map keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteKey(pub usize);

impl RouteKey {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for RouteKey {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

// ---------------------------------------------------------------------------
// RoutingResult
// ---------------------------------------------------------------------------

/// Successes and failures of a fork-join, keyed by route index.
///
/// Every route index appears in exactly one of the two maps.
#[derive(Debug, Clone, Default)]
pub struct RoutingResult {
    results: BTreeMap<RouteKey, Event>,
    failures: BTreeMap<RouteKey, RouteFailure>,
}

impl RoutingResult {
    #[must_use]
    pub fn new(
        results: BTreeMap<RouteKey, Event>,
        failures: BTreeMap<RouteKey, RouteFailure>,
    ) -> Self {
        Self { results, failures }
    }

    #[must_use]
    pub fn results(&self) -> &BTreeMap<RouteKey, Event> {
        &self.results
    }

    #[must_use]
    pub fn failures(&self) -> &BTreeMap<RouteKey, RouteFailure> {
        &self.failures
    }

    /// Results keyed by the stringified route index, in index order.
    #[must_use]
    pub fn results_by_name(&self) -> Vec<(String, &Event)> {
        self.results.iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    /// Failures keyed by the stringified route index, in index order.
    #[must_use]
    pub fn failures_by_name(&self) -> Vec<(String, &RouteFailure)> {
        self.failures.iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[must_use]
    pub fn route_count(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    #[must_use]
    pub fn into_parts(self) -> (BTreeMap<RouteKey, Event>, BTreeMap<RouteKey, RouteFailure>) {
        (self.results, self.failures)
    }
}

// ---------------------------------------------------------------------------
// CompositeRoutingError
// ---------------------------------------------------------------------------

/// Raised in delayed-error mode when at least one route failed. Carries every
/// success and every failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "{} of {} route(s) failed: {}",
    .result.failures().len(),
    .result.route_count(),
    describe_failures(.result)
)]
pub struct CompositeRoutingError {
    result: RoutingResult,
}

fn describe_failures(result: &RoutingResult) -> String {
    result
        .failures()
        .iter()
        .map(|(key, failure)| format!("route {key}: {failure}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl CompositeRoutingError {
    #[must_use]
    pub fn new(result: RoutingResult) -> Self {
        Self { result }
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.result.failures().len()
    }

    #[must_use]
    pub fn routing_result(&self) -> &RoutingResult {
        &self.result
    }

    #[must_use]
    pub fn into_routing_result(self) -> RoutingResult {
        self.result
    }

    /// The routing result rendered as a message, for error handlers that
    /// want to inspect partial output.
    #[must_use]
    pub fn error_message(&self) -> Message {
        let results = self
            .result
            .results()
            .iter()
            .map(|(key, event)| (key.to_string(), Value::from(event.message().clone())))
            .collect();
        let failures = self
            .result
            .failures()
            .iter()
            .map(|(key, failure)| (key.to_string(), Value::from(failure.to_string())))
            .collect();
        Message::of(Value::Map(BTreeMap::from([
            ("results".to_string(), Value::Map(results)),
            ("failures".to_string(), Value::Map(failures)),
        ])))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EventContext;

    fn event(payload: &str) -> Event {
        Event::new(EventContext::root(), Message::of(payload))
    }

    #[test]
    fn route_keys_order_numerically() {
        let mut keys = vec![RouteKey(10), RouteKey(2), RouteKey(9)];
        keys.sort();
        let names: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["2", "9", "10"]);
    }

    #[test]
    fn composite_error_message_lists_results_and_failures() {
        let result = RoutingResult::new(
            BTreeMap::from([(RouteKey(0), event("ok"))]),
            BTreeMap::from([(RouteKey(1), RouteFailure::failed(anyhow::anyhow!("bad")))]),
        );
        let err = CompositeRoutingError::new(result);

        assert_eq!(err.failure_count(), 1);
        assert_eq!(err.to_string(), "1 of 2 route(s) failed: route 1: bad");

        let message = err.error_message();
        let map = message.payload().value().as_map().unwrap();
        let results = map["results"].as_map().unwrap();
        let failures = map["failures"].as_map().unwrap();
        assert_eq!(
            results["0"].as_message().unwrap().payload().value(),
            &Value::from("ok")
        );
        assert_eq!(failures["1"], Value::from("bad"));
    }

    #[test]
    fn string_views_follow_index_order() {
        let result = RoutingResult::new(
            (0..12).map(|i| (RouteKey(i), event("x"))).collect(),
            BTreeMap::new(),
        );
        let names: Vec<String> = result.results_by_name().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names.first().map(String::as_str), Some("0"));
        assert_eq!(names.last().map(String::as_str), Some("11"));
        assert_eq!(result.route_count(), 12);
    }

    proptest::proptest! {
        #[test]
        fn key_order_matches_index_order(
            mut indices in proptest::collection::vec(0usize..10_000, 0..50),
        ) {
            let mut keys: Vec<RouteKey> = indices.iter().copied().map(RouteKey::from).collect();
            keys.sort();
            indices.sort_unstable();
            let sorted: Vec<usize> = keys.into_iter().map(RouteKey::index).collect();
            proptest::prop_assert_eq!(sorted, indices);
        }
    }
}
