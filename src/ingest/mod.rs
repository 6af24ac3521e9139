//! HTTP ingestion
//!
//! Lets other processes submit log items over HTTP on localhost.

pub mod server;

pub use server::{start, ServerHandle};

use serde::{Deserialize, Serialize};

use crate::item::Fields;

/// A log item submitted over HTTP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    /// Level name, case-insensitive (`info`, `W`, `error`, ...)
    pub level: String,
    /// Tag; the dispatcher's default tag when absent
    #[serde(default)]
    pub tag: Option<String>,
    pub message: String,
    #[serde(default)]
    pub fields: Fields,
}

/// Reply to an accepted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReply {
    /// Assigned id, `None` when the level was filtered out
    pub id: Option<u64>,
}
