//! Status and doctor command handlers

use std::path::Path;

use anyhow::Result;

use ec2_sync_core::status::{check_connectivity, collect_status};
use ec2_sync_core::{AwsCliProvider, RsyncTransport};

use super::{connect, load_config, with_hint};
use crate::output::Output;

/// Show instance and mapping status without starting anything
///
/// Remote roots are summarized only if the instance is already running.
pub async fn show(config_path: Option<&Path>, output: &Output) -> Result<()> {
    let config = load_config(config_path)?;
    let provider = AwsCliProvider::new(&config.instance);
    let transport = RsyncTransport::from_config(&config);
    let status = collect_status(&config, &provider, Some(&transport)).await;
    output.print_status(&status)
}

/// Resolve the endpoint and probe ssh/rsync; returns whether all checks passed
pub async fn doctor(config_path: Option<&Path>, output: &Output) -> Result<bool> {
    let config = load_config(config_path)?;
    config.validate().map_err(|e| with_hint(e.into()))?;

    output.message(&format!("Checking {}...", config.instance.label()));
    let (resolver, transport) = connect(&config);
    let report =
        check_connectivity(&resolver, transport.as_ref(), config.transfer.stat_timeout()).await;
    output.print_connectivity(&report)?;

    Ok(report.success)
}
