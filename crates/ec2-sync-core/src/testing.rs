//! In-memory provider and transport shared by unit tests

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Config, DirectoryMapping};
use crate::endpoint::{
    Endpoint, EndpointResolver, InstanceDescription, InstanceProvider, PowerState, ProviderError,
    ResolverSettings,
};
use crate::models::FileState;
use crate::retry::RetryPolicy;
use crate::transfer::{
    ProbeReport, RemoteDirInfo, TransferDirection, TransferError, TransferReport, Transport,
};

/// Config with one mapping per `(name, local root)` pair
pub fn config(mappings: &[(&str, &Path)]) -> Config {
    let mut config = Config::default();
    config.instance.instance_id = Some("i-test".to_string());
    config.mappings = mappings
        .iter()
        .map(|(name, root)| DirectoryMapping::new(*name, root.to_path_buf(), format!("/srv/{}", name)))
        .collect();
    config
}

pub fn resolver(provider: &Arc<FakeProvider>) -> Arc<EndpointResolver> {
    Arc::new(EndpointResolver::new(
        provider.clone(),
        ResolverSettings {
            auto_start: true,
            max_wait: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        },
        RetryPolicy::immediate(3),
    ))
}

pub struct ProviderState {
    pub power: PowerState,
    pub address: Option<String>,
    pub next_address: String,
    /// Describes that still report `pending` after a start
    pub boot_polls: u32,
    /// Describes that report `running` without an address
    pub addressless_polls: u32,
    pub describe_calls: u32,
    pub start_calls: u32,
    pub failures: Vec<ProviderError>,
    pub describe_delay: Duration,
}

pub struct FakeProvider {
    inner: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn new(power: PowerState, address: Option<&str>) -> Self {
        Self {
            inner: Mutex::new(ProviderState {
                power,
                address: address.map(str::to_string),
                next_address: "10.0.0.2".to_string(),
                boot_polls: 1,
                addressless_polls: 0,
                describe_calls: 0,
                start_calls: 0,
                failures: Vec::new(),
                describe_delay: Duration::ZERO,
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ProviderState) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }
}

#[async_trait]
impl InstanceProvider for FakeProvider {
    async fn describe(&self) -> Result<InstanceDescription, ProviderError> {
        let delay = self.with(|s| s.describe_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            s.describe_calls += 1;
            if let Some(err) = s.failures.pop() {
                return Err(err);
            }
            if s.power == PowerState::Pending {
                if s.boot_polls == 0 {
                    s.power = PowerState::Running;
                    s.address = Some(s.next_address.clone());
                } else {
                    s.boot_polls -= 1;
                }
            }
            let address = if s.power != PowerState::Running {
                None
            } else if s.addressless_polls > 0 {
                s.addressless_polls -= 1;
                None
            } else {
                s.address.clone()
            };
            Ok(InstanceDescription {
                instance_id: "i-test".to_string(),
                power_state: s.power,
                address,
                instance_type: None,
            })
        })
    }

    async fn start(&self, _instance_id: &str) -> Result<(), ProviderError> {
        self.with(|s| {
            s.start_calls += 1;
            s.power = PowerState::Pending;
        });
        Ok(())
    }
}

#[derive(Default)]
struct TransportState {
    remote: HashMap<String, Vec<FileState>>,
    hanging: HashSet<String>,
    refuse_once: HashSet<String>,
    fail_paths: HashMap<String, String>,
    stat_paths: HashMap<String, Vec<Option<Vec<String>>>>,
    transfers: Vec<(String, TransferDirection, Vec<String>)>,
}

/// Transport backed by an in-memory remote listing
///
/// Transfers are recorded but do not change the listing.
#[derive(Default)]
pub struct FakeTransport {
    inner: Mutex<TransportState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_remote(&self, mapping: &str, states: Vec<FileState>) {
        self.lock().remote.insert(mapping.to_string(), states);
    }

    /// Every remote call for the mapping blocks forever
    pub fn hang(&self, mapping: &str) {
        self.lock().hanging.insert(mapping.to_string());
    }

    pub fn unhang(&self, mapping: &str) {
        self.lock().hanging.remove(mapping);
    }

    /// The next remote stat for the mapping is refused
    pub fn refuse_once(&self, mapping: &str) {
        self.lock().refuse_once.insert(mapping.to_string());
    }

    /// Transfers of this path report a per-file failure
    pub fn fail_path(&self, path: &str, reason: &str) {
        self.lock()
            .fail_paths
            .insert(path.to_string(), reason.to_string());
    }

    pub fn heal(&self, path: &str) {
        self.lock().fail_paths.remove(path);
    }

    pub fn stat_calls(&self, mapping: &str) -> usize {
        self.lock().stat_paths.get(mapping).map_or(0, Vec::len)
    }

    pub fn stat_paths(&self, mapping: &str) -> Vec<Option<Vec<String>>> {
        self.lock().stat_paths.get(mapping).cloned().unwrap_or_default()
    }

    pub fn transfers(&self) -> Vec<(String, TransferDirection, Vec<String>)> {
        self.lock().transfers.clone()
    }

    pub fn transfers_for(&self, mapping: &str) -> Vec<(String, TransferDirection, Vec<String>)> {
        self.transfers()
            .into_iter()
            .filter(|(m, _, _)| m == mapping)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TransportState> {
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn remote_states(
        &self,
        _endpoint: &Endpoint,
        mapping: &DirectoryMapping,
        paths: Option<&[String]>,
    ) -> Result<Vec<FileState>, TransferError> {
        let (hang, refused, states) = {
            let mut s = self.lock();
            s.stat_paths
                .entry(mapping.name.clone())
                .or_default()
                .push(paths.map(<[String]>::to_vec));
            let refused = s.refuse_once.remove(&mapping.name);
            let states = s.remote.get(&mapping.name).cloned().unwrap_or_default();
            (s.hanging.contains(&mapping.name), refused, states)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if refused {
            return Err(TransferError::Connection("connection refused".to_string()));
        }
        Ok(states
            .into_iter()
            .filter(|st| paths.map_or(true, |p| p.contains(&st.path)))
            .collect())
    }

    async fn transfer(
        &self,
        _endpoint: &Endpoint,
        mapping: &DirectoryMapping,
        direction: TransferDirection,
        paths: &[String],
    ) -> Result<TransferReport, TransferError> {
        let hang = {
            let mut s = self.lock();
            s.transfers
                .push((mapping.name.clone(), direction, paths.to_vec()));
            s.hanging.contains(&mapping.name)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let s = self.lock();
        let mut report = TransferReport::default();
        for path in paths {
            match s.fail_paths.get(path) {
                Some(reason) => report.failed.push((path.clone(), reason.clone())),
                None => report.succeeded.push(path.clone()),
            }
        }
        Ok(report)
    }

    async fn probe(&self, _endpoint: &Endpoint) -> Result<ProbeReport, TransferError> {
        Ok(ProbeReport {
            ssh_ok: true,
            remote_rsync: Some("rsync  version 3.2.7  protocol version 31".to_string()),
        })
    }

    /// A mapping with no listing set has no remote root
    async fn remote_dir_info(
        &self,
        _endpoint: &Endpoint,
        mapping: &DirectoryMapping,
    ) -> Result<RemoteDirInfo, TransferError> {
        let s = self.lock();
        Ok(match s.remote.get(&mapping.name) {
            Some(states) => RemoteDirInfo {
                exists: true,
                file_count: states.len(),
                total_bytes: states.iter().map(|st| st.size).sum(),
            },
            None => RemoteDirInfo::default(),
        })
    }
}
