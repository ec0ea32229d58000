//! Endpoint resolution and caching
//!
//! The resolver owns the only copy of [`EndpointState`]. Callers get an
//! [`Endpoint`] handle carrying the generation it was resolved at, and can
//! later ask [`EndpointResolver::is_current`] whether the address moved.
//!
//! Resolution is exclusive: one describe/start/poll sequence runs at a time,
//! and callers queued behind it reuse its result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};

use super::provider::{InstanceDescription, InstanceProvider, PowerState, ProviderError};
use crate::config::InstanceConfig;
use crate::error::SyncError;
use crate::retry::RetryPolicy;

/// A resolved, reachable endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub instance_id: String,
    pub address: String,
    /// Generation the address was resolved at
    pub generation: u64,
}

/// Resolver-owned view of the remote instance
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointState {
    pub instance_id: Option<String>,
    pub address: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub power_state: Option<PowerState>,
    /// Bumped every time the resolved address changes
    pub generation: u64,
    /// Set by `invalidate`; the next resolve bypasses the cache
    pub stale: bool,
}

impl EndpointState {
    fn cached(&self) -> Option<Endpoint> {
        if self.stale {
            return None;
        }
        Some(Endpoint {
            instance_id: self.instance_id.clone()?,
            address: self.address.clone()?,
            generation: self.generation,
        })
    }
}

/// Timing and behaviour of a resolution
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub auto_start: bool,
    /// Budget for reaching `running`
    pub max_wait: Duration,
    pub poll_interval: Duration,
    /// Bound on one describe/start call
    pub call_timeout: Duration,
}

impl From<&InstanceConfig> for ResolverSettings {
    fn from(config: &InstanceConfig) -> Self {
        Self {
            auto_start: config.auto_start,
            max_wait: config.max_wait(),
            poll_interval: config.poll_interval(),
            call_timeout: config.call_timeout(),
        }
    }
}

/// Resolves and caches the remote endpoint
pub struct EndpointResolver {
    provider: Arc<dyn InstanceProvider>,
    settings: ResolverSettings,
    retry: RetryPolicy,
    /// Held for the duration of a resolution
    gate: tokio::sync::Mutex<()>,
    state: Mutex<EndpointState>,
    /// Completed resolution attempts, successful or not
    resolutions: AtomicU64,
    endpoint_tx: watch::Sender<Option<Endpoint>>,
}

impl EndpointResolver {
    pub fn new(
        provider: Arc<dyn InstanceProvider>,
        settings: ResolverSettings,
        retry: RetryPolicy,
    ) -> Self {
        let (endpoint_tx, _) = watch::channel(None);
        Self {
            provider,
            settings,
            retry,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(EndpointState::default()),
            resolutions: AtomicU64::new(0),
            endpoint_tx,
        }
    }

    /// Return a live endpoint, resolving it if needed
    ///
    /// With a warm cache and `force_refresh == false` this makes no provider
    /// call.
    pub async fn resolve(&self, force_refresh: bool) -> Result<Endpoint, SyncError> {
        let observed = self.resolutions.load(Ordering::Acquire);
        if !force_refresh {
            if let Some(endpoint) = self.lock_state().cached() {
                return Ok(endpoint);
            }
        }

        let _gate = self.gate.lock().await;

        // A resolution finished while we were queued
        if self.resolutions.load(Ordering::Acquire) != observed {
            if let Some(endpoint) = self.lock_state().cached() {
                tracing::debug!("Reusing endpoint resolved by a concurrent caller");
                return Ok(endpoint);
            }
        }

        let outcome = self.resolve_uncached().await;
        self.resolutions.fetch_add(1, Ordering::Release);
        outcome
    }

    /// Force the next `resolve` to query the provider
    pub fn invalidate(&self) {
        let mut state = self.lock_state();
        if !state.stale {
            tracing::debug!(generation = state.generation, "Endpoint invalidated");
        }
        state.stale = true;
    }

    /// Last resolved endpoint, even if invalidated since
    pub fn current(&self) -> Option<Endpoint> {
        let state = self.lock_state();
        Some(Endpoint {
            instance_id: state.instance_id.clone()?,
            address: state.address.clone()?,
            generation: state.generation,
        })
    }

    /// Whether a handle resolved at `generation` still names the current address
    pub fn is_current(&self, generation: u64) -> bool {
        self.lock_state().generation == generation
    }

    /// Current generation counter
    pub fn generation(&self) -> u64 {
        self.lock_state().generation
    }

    /// Snapshot of the resolver state
    pub fn state(&self) -> EndpointState {
        self.lock_state().clone()
    }

    /// Receive every endpoint whose address differs from the previous one
    pub fn subscribe(&self) -> watch::Receiver<Option<Endpoint>> {
        self.endpoint_tx.subscribe()
    }

    fn lock_state(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn resolve_uncached(&self) -> Result<Endpoint, SyncError> {
        let started = Instant::now();
        let deadline = started + self.settings.max_wait;
        let mut start_requested = false;

        loop {
            let desc = self.describe().await?;
            self.observe(&desc);

            match desc.power_state {
                PowerState::Running => match desc.address {
                    Some(address) => return Ok(self.commit(desc.instance_id, address)),
                    // Freshly started instances can take a moment to get an address
                    None if !start_requested => {
                        return Err(SyncError::AddressUnavailable(format!(
                            "instance {} is running but has no address",
                            desc.instance_id
                        )));
                    }
                    None => {}
                },
                PowerState::Terminated => {
                    return Err(SyncError::InstanceNotFound(format!(
                        "instance {} is terminated",
                        desc.instance_id
                    )));
                }
                PowerState::Stopped if !self.settings.auto_start => {
                    return Err(SyncError::InstanceStopped(desc.instance_id));
                }
                PowerState::Stopped if !start_requested => {
                    tracing::info!("Instance {} is stopped, starting it", desc.instance_id);
                    self.start(&desc.instance_id).await?;
                    start_requested = true;
                }
                PowerState::Stopped | PowerState::Pending | PowerState::Stopping => {
                    tracing::debug!(
                        "Instance {} is {}, waiting",
                        desc.instance_id,
                        desc.power_state
                    );
                }
            }

            let now = Instant::now();
            if now + self.settings.poll_interval > deadline {
                return match desc.power_state {
                    PowerState::Running => Err(SyncError::AddressUnavailable(format!(
                        "instance {} started but no address was assigned",
                        desc.instance_id
                    ))),
                    _ => Err(SyncError::InstanceStartTimeout {
                        instance_id: desc.instance_id,
                        waited: now - started,
                    }),
                };
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Describe with a per-call timeout, retrying transient failures
    async fn describe(&self) -> Result<InstanceDescription, SyncError> {
        let mut attempt = 1;
        loop {
            let result = match timeout(self.settings.call_timeout, self.provider.describe()).await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Unavailable(format!(
                    "describe timed out after {}s",
                    self.settings.call_timeout.as_secs()
                ))),
            };

            match result {
                Ok(desc) => return Ok(desc),
                Err(ProviderError::Unavailable(msg)) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        "Describe failed (attempt {}): {}; retrying in {:?}",
                        attempt,
                        msg,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn start(&self, instance_id: &str) -> Result<(), SyncError> {
        match timeout(self.settings.call_timeout, self.provider.start(instance_id)).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::AddressUnavailable(format!(
                "start request for {} timed out",
                instance_id
            ))),
        }
    }

    fn observe(&self, desc: &InstanceDescription) {
        let mut state = self.lock_state();
        state.power_state = Some(desc.power_state);
        if state.instance_id.as_deref() != Some(desc.instance_id.as_str()) {
            state.instance_id = Some(desc.instance_id.clone());
        }
    }

    fn commit(&self, instance_id: String, address: String) -> Endpoint {
        let endpoint = {
            let mut state = self.lock_state();
            if state.address.as_deref() != Some(address.as_str()) {
                state.generation += 1;
                tracing::info!(
                    old = state.address.as_deref().unwrap_or("-"),
                    new = %address,
                    generation = state.generation,
                    "Endpoint address changed"
                );
                state.address = Some(address.clone());
            }
            state.instance_id = Some(instance_id.clone());
            state.resolved_at = Some(Utc::now());
            state.stale = false;
            Endpoint {
                instance_id,
                address,
                generation: state.generation,
            }
        };

        self.endpoint_tx.send_if_modified(|current| {
            let changed = current.as_ref().map(|e| e.generation) != Some(endpoint.generation);
            if changed {
                *current = Some(endpoint.clone());
            }
            changed
        });
        endpoint
    }
}
