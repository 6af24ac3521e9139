//! Storage backends
//!
//! Every backend implements [`Store`]. The dispatcher holds a list of
//! `Arc<dyn Store>` and fans each item out without knowing the concrete kind.

mod console;
mod document;
mod file;
mod retention;

pub use console::{ConsoleOptions, ConsoleSink};
pub use document::{DocumentClient, DocumentSession, DocumentStore, MemoryClient};
pub use file::{FileStore, FileStoreOptions};
pub use retention::{sweep_before, sweep_expired, RetentionTask};

use std::path::PathBuf;

use crate::item::LogItem;
use crate::template::TemplateError;

/// Errors raised by storage backends
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid template: {0}")]
    Template(#[from] TemplateError),

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("log file name escapes the store root: {0}")]
    InvalidName(String),

    #[error("console write failed: {0}")]
    Console(#[source] std::io::Error),

    #[error("document store connection failed: {0}")]
    Connection(String),

    #[error("document insert failed: {0}")]
    Insert(String),

    #[error("{0}")]
    Runtime(String),
}

/// A log sink
///
/// Implementations serialize internally, so `store` may be called from
/// several threads. `close` is called once at shutdown; calling `store`
/// afterwards is only supported where an implementation says so.
///
/// # Object Safety
/// This trait is object-safe to allow `Arc<dyn Store>` usage.
pub trait Store: Send + Sync {
    /// Short backend name for diagnostics
    fn name(&self) -> &str;

    /// Persist or display one item
    fn store(&self, item: &LogItem) -> Result<(), StoreError>;

    /// Flush and release backend resources
    fn close(&self) -> Result<(), StoreError>;
}
