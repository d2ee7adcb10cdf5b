//! Reduction of successful route outputs into one result event.

use std::collections::BTreeMap;

use junction_core::{DataType, Event, Message, TypedValue, Value, ValueKind, Variables};

/// Builds the result message of a fork-join whose routes all succeeded.
///
/// Outputs arrive in submission order. Variable merging and context handling
/// are shared by every aggregation and happen in [`aggregate_event`].
pub trait Aggregation: Send + Sync + 'static {
    /// Short name used in logs and spans.
    fn name(&self) -> &'static str;

    fn aggregate(&self, original: &Event, outputs: &[Event]) -> Message;
}

/// Result payload is the list of route output messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectList;

impl Aggregation for CollectList {
    fn name(&self) -> &'static str {
        "collect_list"
    }

    fn aggregate(&self, _original: &Event, outputs: &[Event]) -> Message {
        let items: Vec<Value> = outputs
            .iter()
            .map(|event| Value::from(event.message().clone()))
            .collect();
        Message::new(
            TypedValue::with_type(
                Value::Array(items),
                DataType {
                    kind: ValueKind::Array,
                    item: Some(ValueKind::Message),
                    media_type: None,
                },
            ),
            TypedValue::null(),
        )
    }
}

/// Result payload maps each route's index ("0", "1", ...) to its output message.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectMap;

impl Aggregation for CollectMap {
    fn name(&self) -> &'static str {
        "collect_map"
    }

    fn aggregate(&self, _original: &Event, outputs: &[Event]) -> Message {
        let entries: BTreeMap<String, Value> = outputs
            .iter()
            .enumerate()
            .map(|(i, event)| (i.to_string(), Value::from(event.message().clone())))
            .collect();
        Message::of(Value::Map(entries))
    }
}

/// Routes run for their side effects; the original message passes through.
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinOnly;

impl Aggregation for JoinOnly {
    fn name(&self) -> &'static str {
        "join_only"
    }

    fn aggregate(&self, original: &Event, _outputs: &[Event]) -> Message {
        original.message().clone()
    }
}

/// Applies `aggregation` and merges variables. The result keeps the original
/// event's context.
pub fn aggregate_event<A: Aggregation + ?Sized>(
    aggregation: &A,
    original: &Event,
    outputs: &[Event],
) -> Event {
    let message = aggregation.aggregate(original, outputs);
    let variables = merge_variables(original.variables(), outputs);
    original
        .clone()
        .with_message(message)
        .with_variables(variables)
}

/// Merges route variables into the original set.
///
/// A variable added or changed by exactly one route takes that route's value.
/// One touched by several routes becomes a list of their values in submission
/// order. Variables a route removed stay in the result.
#[must_use]
pub fn merge_variables(original: &Variables, outputs: &[Event]) -> Variables {
    let mut touched: BTreeMap<&str, Vec<&TypedValue>> = BTreeMap::new();
    for output in outputs {
        for (name, value) in output.variables() {
            if original.get(name) != Some(value) {
                touched.entry(name.as_str()).or_default().push(value);
            }
        }
    }

    let mut merged = original.clone();
    for (name, values) in touched {
        let value = match values.as_slice() {
            [single] => (*single).clone(),
            [first, ..] => TypedValue::with_type(
                Value::Array(values.iter().map(|v| v.value().clone()).collect()),
                DataType::list_of(first.data_type()),
            ),
            [] => continue,
        };
        merged.insert(name.to_string(), value);
    }
    merged
}
