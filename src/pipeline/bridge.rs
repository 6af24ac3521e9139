//! Tracing layer feeding events into a [`Dispatcher`]
//!
//! Each event becomes one log item: the target is the tag, the `message` field
//! the message, and every other field is carried along as a structured field.
//! Events from this crate's own targets are skipped so store failures reported
//! through `tracing` cannot loop back into the stores.

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::item::{Fields, Level};

use super::dispatcher::Dispatcher;

const OWN_TARGET: &str = "alog";

/// A tracing layer forwarding events to a dispatcher
pub struct DispatchLayer {
    dispatcher: Dispatcher,
}

impl DispatchLayer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Fields,
}

impl FieldVisitor {
    fn record_value(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.record_value(field, format!("{:?}", value).into());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.record_value(field, value.into());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record_value(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, value.into());
    }
}

fn is_own_target(target: &str) -> bool {
    target == OWN_TARGET || target.starts_with("alog::")
}

impl<S> Layer<S> for DispatchLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_own_target(metadata.target()) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let message = visitor
            .message
            .unwrap_or_else(|| metadata.name().to_string());

        self.dispatcher.log_with_fields(
            Level::from(*metadata.level()),
            metadata.target(),
            message,
            visitor.fields,
        );
    }
}
