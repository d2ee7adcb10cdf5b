use std::collections::BTreeMap;

use junction_core::{Event, RouteFailure, RouteKey, RoutingResult};

/// Collects route outcomes as they complete, keyed by submission index.
///
/// Owned by the single aggregator loop of a fork-join, so it needs no locking.
#[derive(Debug)]
pub(crate) struct RouteAccumulator {
    expected: usize,
    results: BTreeMap<RouteKey, Event>,
    failures: BTreeMap<RouteKey, RouteFailure>,
}

impl RouteAccumulator {
    pub(crate) fn new(expected: usize) -> Self {
        Self {
            expected,
            results: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }

    /// Records the outcome of route `index`. A second outcome for the same
    /// index is ignored.
    pub(crate) fn record(&mut self, index: usize, outcome: Result<Event, RouteFailure>) {
        let key = RouteKey(index);
        if self.results.contains_key(&key) || self.failures.contains_key(&key) {
            tracing::warn!(route = index, "duplicate route outcome ignored");
            return;
        }
        match outcome {
            Ok(event) => {
                self.results.insert(key, event);
            }
            Err(failure) => {
                self.failures.insert(key, failure);
            }
        }
    }

    pub(crate) fn completed(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.completed() >= self.expected
    }

    pub(crate) fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Route outputs in submission order.
    pub(crate) fn successes(&self) -> Vec<Event> {
        self.results.values().cloned().collect()
    }

    pub(crate) fn into_routing_result(self) -> RoutingResult {
        RoutingResult::new(self.results, self.failures)
    }
}
