//! Watch command handler

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use ec2_sync_core::aggregator::start_watching;
use ec2_sync_core::{SyncDirection, WatchCommand, WatchOptions, WatchTaskEvent};

use super::{build_orchestrator, load_config, with_hint};
use crate::output::Output;

/// Watch until Ctrl-C
pub async fn run(
    config_path: Option<&Path>,
    direction: SyncDirection,
    no_initial_sync: bool,
    output: &Output,
) -> Result<bool> {
    let config = load_config(config_path)?;
    let mut options = WatchOptions::from_config(&config, direction);
    if no_initial_sync {
        options.initial_sync = false;
    }

    let orchestrator = Arc::new(build_orchestrator(config)?);
    let mut handle = start_watching(orchestrator, options).map_err(with_hint)?;
    output.message("Watching for changes. Press Ctrl-C to stop.");

    let mut stopping = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                output.message("Stopping, waiting for the current sync to finish...");
                let _ = handle.command_tx.send(WatchCommand::Shutdown).await;
            }
            event = handle.event_rx.recv() => {
                match event {
                    Some(WatchTaskEvent::Stopped) | None => break,
                    Some(event) => output.print_watch_event(&event)?,
                }
            }
        }
    }

    output.success("Stopped watching");
    Ok(true)
}
