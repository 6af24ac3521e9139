//! Process-wide tracing setup
//!
//! Diagnostics of the pipeline itself go to stderr through a fmt layer. When a
//! dispatcher is supplied, events from other targets are also forwarded into
//! the pipeline via [`DispatchLayer`].

use anyhow::{anyhow, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::pipeline::{DispatchLayer, Dispatcher};

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "alog=info";

/// Env filter from `RUST_LOG`, falling back to `default`
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber
///
/// The env filter applies to the stderr layer only; the bridge sees every
/// event and leaves level filtering to the dispatcher. Fails if a global
/// subscriber is already set.
pub fn init(bridge: Option<Dispatcher>) -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(bridge.map(DispatchLayer::new))
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize tracing: {}", e))
}
