//! Events and the flow variables they carry.

use std::collections::BTreeMap;

use crate::context::EventContext;
use crate::message::Message;
use crate::value::TypedValue;

/// Named flow variables carried by an event. Ordered for deterministic merges.
pub type Variables = BTreeMap<String, TypedValue>;

/// The unit of work handed to processors: a message, its flow variables and the
/// context tracking its completion.
///
/// Events are values. Every modification returns a new event and leaves the
/// original untouched, so a fan-out can hand the same source event to several
/// routes without any of them observing the others' changes.
#[derive(Debug, Clone)]
pub struct Event {
    context: EventContext,
    message: Message,
    variables: Variables,
}

impl Event {
    #[must_use]
    pub fn new(context: EventContext, message: Message) -> Self {
        Self {
            context,
            message,
            variables: Variables::new(),
        }
    }

    #[must_use]
    pub fn builder(context: EventContext) -> EventBuilder {
        EventBuilder {
            context,
            message: Message::empty(),
            variables: Variables::new(),
        }
    }

    #[must_use]
    pub fn context(&self) -> &EventContext {
        &self.context
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    #[must_use]
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&TypedValue> {
        self.variables.get(name)
    }

    #[must_use]
    pub fn into_message(self) -> Message {
        self.message
    }

    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.message = message;
        self
    }

    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: TypedValue) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn without_variable(mut self, name: &str) -> Self {
        self.variables.remove(name);
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Rebinds the event to another context, keeping message and variables.
    #[must_use]
    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }
}

/// Builder for [`Event`].
#[derive(Debug)]
pub struct EventBuilder {
    context: EventContext,
    message: Message,
    variables: Variables,
}

impl EventBuilder {
    #[must_use]
    pub fn message(mut self, message: Message) -> Self {
        self.message = message;
        self
    }

    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, value: TypedValue) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn build(self) -> Event {
        Event {
            context: self.context,
            message: self.message,
            variables: self.variables,
        }
    }
}
