use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use alog::config::Config;
use alog::diagnostics;
use alog::ingest;
use alog::item::{Fields, Level};
use alog::pipeline::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args_os().nth(1) {
        Some(path) => Config::load_from(&PathBuf::from(path))?,
        None => Config::load()?,
    };

    let dispatcher = Dispatcher::from_config(&config, None)?;

    // The bridge needs the dispatcher, so diagnostics start after it
    let bridge = config.bridge_tracing.then(|| dispatcher.clone());
    diagnostics::init(bridge)?;
    tracing::info!(
        mode = ?dispatcher.mode(),
        bridge = config.bridge_tracing,
        "alog started"
    );

    let server = if config.ingest.enabled {
        Some(ingest::start(config.ingest.port, dispatcher.clone()).await?)
    } else {
        None
    };

    // Every stdin line becomes an INFO item
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    dispatcher
                        .submit(Level::Info, dispatcher.tag(), line, Fields::new())
                        .await;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    if let Some(server) = server {
        server.shutdown()?;
    }
    dispatcher
        .shutdown()
        .await
        .context("Failed to shut down log pipeline")?;
    Ok(())
}
