//! Log items
//!
//! A `LogItem` is created once at log-call time and read by every store
//! without being modified.

mod level;

pub use level::{Level, ParseLevelError};

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured fields attached to a log item
pub type Fields = BTreeMap<String, Value>;

/// A JSON document as inserted into a document store
pub type Document = serde_json::Map<String, Value>;

/// A single structured log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogItem {
    /// Sequence number assigned by the producer
    pub id: u64,
    /// Time the record was created
    pub time: DateTime<Local>,
    /// Free-form category, usually the component or application name
    pub tag: String,
    /// Severity
    pub level: Level,
    /// Log message
    pub message: String,
    /// Additional structured data
    #[serde(default)]
    pub fields: Fields,
}

impl LogItem {
    /// Create a new log item stamped with the current time
    pub fn new(id: u64, level: Level, tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            time: Local::now(),
            tag: tag.into(),
            level,
            message: message.into(),
            fields: Fields::new(),
        }
    }

    /// Replace the structured fields
    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }

    /// Override the timestamp
    pub fn with_time(mut self, time: DateTime<Local>) -> Self {
        self.time = time;
        self
    }

    /// Project the item into a flat document.
    ///
    /// Structured fields come first; the reserved keys `id`, `time`, `level`,
    /// `tag` and `message` overwrite fields with the same name.
    pub fn to_document(&self) -> Document {
        let mut doc: Document = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        doc.insert("id".to_string(), Value::from(self.id));
        doc.insert("time".to_string(), Value::from(self.time.to_rfc3339()));
        doc.insert("level".to_string(), Value::from(self.level.as_lower_str()));
        doc.insert("tag".to_string(), Value::from(self.tag.clone()));
        doc.insert("message".to_string(), Value::from(self.message.clone()));
        doc
    }
}
