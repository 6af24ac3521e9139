//! alog - buffered log pipeline
//!
//! Producers hand log items to a [`pipeline::Dispatcher`], which writes them to
//! the console and fans them out to storage backends: size-rotated files with
//! age-based retention, and a document store.

pub mod config;
pub mod diagnostics;
pub mod ingest;
pub mod item;
pub mod pipeline;
pub mod store;
pub mod template;
