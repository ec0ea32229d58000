//! One-shot sync command handler (`sync`, `push`, `pull`)

use std::path::Path;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use ec2_sync_core::{CycleRequest, SyncDirection};

use super::{build_orchestrator, load_config};
use crate::output::Output;

/// Run one full cycle; returns whether it succeeded
pub async fn run(
    config_path: Option<&Path>,
    direction: SyncDirection,
    dry_run: bool,
    output: &Output,
) -> Result<bool> {
    let config = load_config(config_path)?;
    let orchestrator = build_orchestrator(config)?;

    let mappings = orchestrator.config().enabled_mappings().count();
    output.message(&format!(
        "Syncing {} mapping(s) with {} ({}{})...",
        mappings,
        orchestrator.config().instance.label(),
        direction,
        if dry_run { ", dry run" } else { "" }
    ));

    // Ctrl-C stops the cycle before the next mapping or transfer
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let request = CycleRequest::full(direction).dry_run(dry_run);
    let result = orchestrator.run_cycle(request, &cancel).await;
    output.print_result(&result)?;

    Ok(result.success)
}
