//! Command handlers

pub mod config;
pub mod status;
pub mod sync;
pub mod watch;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use ec2_sync_core::{
    AwsCliProvider, Config, EndpointResolver, ResolverSettings, RetryPolicy, RsyncTransport,
    SyncError, SyncOrchestrator,
};

/// Load configuration from the CLI override or the default locations
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let path = Config::config_file_path(config_path);
    tracing::debug!("Loading configuration from {}", path.display());
    Config::load_from_path(&path).context("Failed to load configuration")
}

/// Resolver and transport backed by the aws CLI, ssh and rsync
pub fn connect(config: &Config) -> (Arc<EndpointResolver>, Arc<RsyncTransport>) {
    let provider = Arc::new(AwsCliProvider::new(&config.instance));
    let resolver = Arc::new(EndpointResolver::new(
        provider,
        ResolverSettings::from(&config.instance),
        RetryPolicy::from(&config.retry),
    ));
    let transport = Arc::new(RsyncTransport::from_config(config));
    (resolver, transport)
}

pub fn build_orchestrator(config: Config) -> Result<SyncOrchestrator> {
    let (resolver, transport) = connect(&config);
    SyncOrchestrator::new(config, resolver, transport).map_err(with_hint)
}

/// Attach the recovery suggestion to an error
pub fn with_hint(err: SyncError) -> anyhow::Error {
    match err.recovery_suggestion() {
        Some(hint) => anyhow!("{}\n\nHint: {}", err, hint),
        None => anyhow::Error::new(err),
    }
}
