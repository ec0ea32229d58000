//! Status and diagnostics
//!
//! Read-only views for the `status` and `doctor` commands. `collect_status`
//! only describes the instance and never starts it; remote roots are only
//! summarized when the instance is already running with an address.
//! `check_connectivity` resolves the endpoint like a cycle would and probes it.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::endpoint::{Endpoint, EndpointResolver, InstanceProvider, PowerState};
use crate::error::SyncError;
use crate::filter::IgnoreMatcher;
use crate::local;
use crate::transfer::{RemoteDirInfo, Transport};

/// What the provider reports about the instance
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstanceStatus {
    /// Configured id or `Name=` lookup
    pub lookup: String,
    pub instance_id: Option<String>,
    pub power_state: Option<PowerState>,
    pub address: Option<String>,
    pub instance_type: Option<String>,
    pub error: Option<String>,
}

/// Both sides of one mapping
#[derive(Debug, Clone, Serialize)]
pub struct MappingStatus {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub enabled: bool,
    pub local_exists: bool,
    /// Files that would be considered for sync
    pub file_count: usize,
    /// Remote root summary, when the instance was reachable without starting it
    pub remote: Option<RemoteDirInfo>,
    pub remote_error: Option<String>,
}

/// Overall status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub project_name: String,
    pub region: String,
    pub instance: InstanceStatus,
    pub mappings: Vec<MappingStatus>,
}

/// Describe the instance and summarize every mapping
///
/// With a transport, enabled mappings also get a remote summary if the
/// instance is running and has an address.
pub async fn collect_status(
    config: &Config,
    provider: &dyn InstanceProvider,
    transport: Option<&dyn Transport>,
) -> SyncStatus {
    let mut instance = InstanceStatus {
        lookup: config.instance.label(),
        ..Default::default()
    };
    let mut endpoint = None;
    match tokio::time::timeout(config.instance.call_timeout(), provider.describe()).await {
        Ok(Ok(desc)) => {
            if let (PowerState::Running, Some(address)) = (desc.power_state, &desc.address) {
                endpoint = Some(Endpoint {
                    instance_id: desc.instance_id.clone(),
                    address: address.clone(),
                    generation: 0,
                });
            }
            instance.instance_id = Some(desc.instance_id);
            instance.power_state = Some(desc.power_state);
            instance.address = desc.address;
            instance.instance_type = desc.instance_type;
        }
        Ok(Err(e)) => instance.error = Some(SyncError::from(e).to_string()),
        Err(_) => instance.error = Some("describe timed out".to_string()),
    }
    let remote = transport.zip(endpoint.as_ref());

    let mut mappings = Vec::with_capacity(config.mappings.len());
    for mapping in &config.mappings {
        let matcher = IgnoreMatcher::for_mapping(&config.ignore, mapping, config.rule_precedence);
        let local_exists = mapping.local_path.is_dir();
        let file_count = if local_exists {
            match local::scan(&mapping.local_path, &matcher).await {
                Ok(files) => files.len(),
                Err(e) => {
                    tracing::warn!(mapping = %mapping.name, "Cannot scan local root: {}", e);
                    0
                }
            }
        } else {
            0
        };

        let mut status = MappingStatus {
            name: mapping.name.clone(),
            local_path: mapping.local_path.clone(),
            remote_path: mapping.remote_path.clone(),
            enabled: mapping.enabled,
            local_exists,
            file_count,
            remote: None,
            remote_error: None,
        };
        if let (true, Some((transport, endpoint))) = (mapping.enabled, remote) {
            let limit = config.transfer.stat_timeout();
            match tokio::time::timeout(limit, transport.remote_dir_info(endpoint, mapping)).await {
                Ok(Ok(info)) => status.remote = Some(info),
                Ok(Err(e)) => status.remote_error = Some(e.to_string()),
                Err(_) => {
                    status.remote_error =
                        Some(format!("remote summary timed out after {}s", limit.as_secs()))
                }
            }
        }
        mappings.push(status);
    }

    SyncStatus {
        project_name: config.project_name.clone(),
        region: config.instance.region.clone(),
        instance,
        mappings,
    }
}

/// Outcome of a connectivity check
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectivityReport {
    pub instance_found: bool,
    pub running: bool,
    pub address: Option<String>,
    pub ssh_ok: bool,
    /// Remote `rsync --version` banner
    pub remote_rsync: Option<String>,
    pub error: Option<String>,
    pub suggestion: Option<String>,
    pub success: bool,
}

/// Resolve the endpoint and probe it
pub async fn check_connectivity(
    resolver: &EndpointResolver,
    transport: &dyn Transport,
    probe_timeout: Duration,
) -> ConnectivityReport {
    let mut report = ConnectivityReport::default();

    let endpoint = match resolver.resolve(false).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            report.instance_found = !matches!(
                e,
                SyncError::InstanceNotFound(_) | SyncError::PermissionDenied(_)
            );
            report.error = Some(e.to_string());
            report.suggestion = e.recovery_suggestion().map(str::to_string);
            return report;
        }
    };
    report.instance_found = true;
    report.running = true;
    report.address = Some(endpoint.address.clone());

    match tokio::time::timeout(probe_timeout, transport.probe(&endpoint)).await {
        Ok(Ok(probe)) => {
            report.ssh_ok = probe.ssh_ok;
            report.remote_rsync = probe.remote_rsync;
            if !report.ssh_ok {
                report.error = Some(format!("ssh to {} failed", endpoint.address));
            } else if report.remote_rsync.is_none() {
                report.error = Some("rsync is not installed on the instance".to_string());
            }
        }
        Ok(Err(e)) => {
            let err = SyncError::from(e);
            report.error = Some(err.to_string());
            report.suggestion = err.recovery_suggestion().map(str::to_string);
        }
        Err(_) => {
            report.error = Some(format!("probe timed out after {}s", probe_timeout.as_secs()));
        }
    }

    report.success = report.ssh_ok && report.remote_rsync.is_some();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileState;
    use crate::testing::{self, FakeProvider, FakeTransport};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_collect_status_counts_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("main.rs"), "fn main() {}").unwrap();
        std::fs::write(temp_dir.path().join("build.log"), "noise").unwrap();
        let missing = temp_dir.path().join("not-yet");
        let config = testing::config(&[("src", temp_dir.path()), ("later", missing.as_path())]);

        let provider = FakeProvider::new(PowerState::Stopped, None);
        let transport = FakeTransport::new();
        let status = collect_status(&config, &provider, Some(&transport)).await;

        assert_eq!(status.instance.lookup, "i-test");
        assert_eq!(status.instance.power_state, Some(PowerState::Stopped));
        assert!(status.instance.address.is_none());
        assert_eq!(provider.with(|s| s.start_calls), 0);

        assert_eq!(status.mappings[0].file_count, 1);
        assert!(status.mappings[0].local_exists);
        assert!(!status.mappings[1].local_exists);
        assert_eq!(status.mappings[1].file_count, 0);

        // Stopped instance: the remote side is not contacted
        assert!(status.mappings.iter().all(|m| m.remote.is_none()));
    }

    #[tokio::test]
    async fn test_collect_status_summarizes_remote_when_running() {
        let temp_dir = TempDir::new().unwrap();
        let config = testing::config(&[
            ("src", temp_dir.path()),
            ("docs", temp_dir.path()),
        ]);
        let provider = FakeProvider::new(PowerState::Running, Some("3.3.3.3"));
        let transport = FakeTransport::new();
        transport.set_remote(
            "src",
            vec![
                FileState::present("main.rs", 100, 1_700_000_000),
                FileState::present("lib/mod.rs", 28, 1_700_000_000),
            ],
        );

        let status = collect_status(&config, &provider, Some(&transport)).await;
        assert_eq!(
            status.mappings[0].remote,
            Some(RemoteDirInfo {
                exists: true,
                file_count: 2,
                total_bytes: 128,
            })
        );
        assert_eq!(status.mappings[1].remote.as_ref().map(|r| r.exists), Some(false));
        assert!(status.mappings[0].remote_error.is_none());
        assert_eq!(provider.with(|s| s.start_calls), 0);

        // Without a transport only the local side is reported
        let status = collect_status(&config, &provider, None).await;
        assert!(status.mappings[0].remote.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_connectivity_success() {
        let provider = Arc::new(FakeProvider::new(PowerState::Running, Some("3.3.3.3")));
        let resolver = testing::resolver(&provider);
        let report =
            check_connectivity(&resolver, &FakeTransport::new(), Duration::from_secs(30)).await;

        assert!(report.success);
        assert_eq!(report.address.as_deref(), Some("3.3.3.3"));
        assert!(report.remote_rsync.unwrap().starts_with("rsync"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_connectivity_missing_instance() {
        let provider = Arc::new(FakeProvider::new(PowerState::Terminated, None));
        let resolver = testing::resolver(&provider);
        let report =
            check_connectivity(&resolver, &FakeTransport::new(), Duration::from_secs(30)).await;

        assert!(!report.success);
        assert!(!report.instance_found);
        assert!(report.suggestion.is_some());
    }
}
