//! Sync orchestrator
//!
//! Drives one cycle end to end:
//!
//! 1. Resolve the endpoint, retrying start timeouts and missing addresses
//!    with backoff. Fatal errors stop the cycle.
//! 2. For each mapping in scope (concurrently, up to `max_concurrency`),
//!    gather local and remote file state for the candidate paths.
//! 3. Decide every path with the conflict engine.
//! 4. Run at most one transfer per direction for the mapping, honouring the
//!    cycle direction. Dry-run stops after step 3.
//!
//! Connectivity failures invalidate the endpoint and retry the failed remote
//! call once against a fresh resolution. Whatever still fails is recorded per
//! file; other mappings carry on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DirectoryMapping, ReconcileScope};
use crate::conflict::decide;
use crate::endpoint::{Endpoint, EndpointResolver};
use crate::error::SyncError;
use crate::filter::IgnoreMatcher;
use crate::local;
use crate::models::{
    ConflictDecision, FileFailure, FileState, MappingResult, SyncAction, SyncBatch,
    SyncDirection, SyncResult,
};
use crate::retry::RetryPolicy;
use crate::transfer::{TransferDirection, TransferError, Transport};

/// Which mappings a cycle covers
#[derive(Debug, Clone)]
pub enum CycleScope {
    /// Every enabled mapping, whole tree
    Full,
    /// Batches closed by the change aggregator
    Targeted(Vec<SyncBatch>),
}

/// Parameters of one cycle
#[derive(Debug, Clone)]
pub struct CycleRequest {
    pub direction: SyncDirection,
    pub dry_run: bool,
    pub scope: CycleScope,
}

impl CycleRequest {
    /// Full cycle in the given direction
    pub fn full(direction: SyncDirection) -> Self {
        Self {
            direction,
            dry_run: false,
            scope: CycleScope::Full,
        }
    }

    /// Cycle over closed batches
    pub fn targeted(direction: SyncDirection, batches: Vec<SyncBatch>) -> Self {
        Self {
            direction,
            dry_run: false,
            scope: CycleScope::Targeted(batches),
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// A mapping to process and, for targeted cycles, the paths to look at
struct Target<'a> {
    mapping: &'a DirectoryMapping,
    paths: Option<BTreeSet<String>>,
}

/// Runs sync cycles
pub struct SyncOrchestrator {
    config: Config,
    resolver: Arc<EndpointResolver>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    matchers: HashMap<String, IgnoreMatcher>,
}

impl SyncOrchestrator {
    /// Build an orchestrator; invalid configuration is rejected here
    pub fn new(
        config: Config,
        resolver: Arc<EndpointResolver>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let matchers = config
            .mappings
            .iter()
            .map(|m| {
                let matcher = IgnoreMatcher::for_mapping(&config.ignore, m, config.rule_precedence);
                (m.name.clone(), matcher)
            })
            .collect();

        Ok(Self {
            retry: RetryPolicy::from(&config.retry),
            config,
            resolver,
            transport,
            matchers,
        })
    }

    /// Replace the cycle-level retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<EndpointResolver> {
        &self.resolver
    }

    /// Run one cycle
    ///
    /// Never fails: cycle-level errors are reported in [`SyncResult::error`].
    pub async fn run_cycle(&self, request: CycleRequest, cancel: &CancellationToken) -> SyncResult {
        let mut result = SyncResult::begin(request.direction, request.dry_run);
        tracing::info!(
            cycle = %result.cycle_id,
            direction = %request.direction,
            dry_run = request.dry_run,
            "Sync cycle started"
        );

        let targets = self.targets(&request.scope);

        let endpoint = match self.acquire_endpoint(&mut result, cancel).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::error!("Sync cycle aborted: {}", e);
                result.fail(&e);
                return result.finish();
            }
        };
        result.endpoint = Some(endpoint.address.clone());

        let direction = request.direction;
        let dry_run = request.dry_run;
        let jobs: Vec<_> = targets
            .into_iter()
            .map(|target| self.sync_mapping(target, &endpoint, direction, dry_run, cancel))
            .collect();
        result.mappings = stream::iter(jobs)
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let result = result.finish();
        let summary = result.summary();
        tracing::info!(
            cycle = %result.cycle_id,
            success = result.success,
            transferred = summary.transferred,
            skipped = summary.skipped,
            conflicted = summary.conflicted,
            failed = summary.failed,
            duration_ms = result.duration_ms,
            "Sync cycle finished"
        );
        result
    }

    fn targets(&self, scope: &CycleScope) -> Vec<Target<'_>> {
        match scope {
            CycleScope::Full => self
                .config
                .enabled_mappings()
                .map(|mapping| Target {
                    mapping,
                    paths: None,
                })
                .collect(),
            CycleScope::Targeted(batches) => {
                let mut merged: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
                for batch in batches {
                    merged
                        .entry(batch.mapping.as_str())
                        .or_default()
                        .extend(batch.paths.iter().cloned());
                }

                let mut targets = Vec::new();
                for mapping in self.config.enabled_mappings() {
                    let Some(paths) = merged.remove(mapping.name.as_str()) else {
                        continue;
                    };
                    let paths = match self.config.reconcile {
                        ReconcileScope::Affected => Some(paths),
                        ReconcileScope::Full => None,
                    };
                    targets.push(Target { mapping, paths });
                }
                for name in merged.keys() {
                    tracing::warn!("Ignoring batch for unknown or disabled mapping '{}'", name);
                }
                targets
            }
        }
    }

    /// Resolve the endpoint, retrying retryable failures with backoff
    async fn acquire_endpoint(
        &self,
        result: &mut SyncResult,
        cancel: &CancellationToken,
    ) -> Result<Endpoint, SyncError> {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            result.attempts = attempt;

            match self.resolver.resolve(false).await {
                Ok(endpoint) => return Ok(endpoint),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        "Endpoint resolution failed (attempt {}/{}): {}; retrying in {:?}",
                        attempt,
                        self.retry.max_attempts,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn sync_mapping(
        &self,
        target: Target<'_>,
        endpoint: &Endpoint,
        direction: SyncDirection,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> MappingResult {
        let mapping = target.mapping;
        let mut out = MappingResult::new(&mapping.name);

        if cancel.is_cancelled() {
            out.error = Some(SyncError::Cancelled.to_string());
            return out;
        }

        let Some(matcher) = self.matchers.get(&mapping.name) else {
            out.error = Some(format!("no ignore rules compiled for '{}'", mapping.name));
            return out;
        };

        let mut endpoint = endpoint.clone();
        let mut reconnected = false;
        let stat_timeout = self.config.transfer.stat_timeout();

        // Local side, and the candidate path set
        let (local, candidates): (HashMap<String, FileState>, Option<Vec<String>>) =
            match &target.paths {
                None => match local::scan(&mapping.local_path, matcher).await {
                    Ok(states) => {
                        let by_path = states.into_iter().map(|s| (s.path.clone(), s)).collect();
                        (by_path, None)
                    }
                    Err(e) => {
                        out.error = Some(format!("local scan failed: {}", e));
                        return out;
                    }
                },
                Some(paths) => {
                    let wanted: Vec<String> = paths
                        .iter()
                        .filter(|p| !matcher.should_ignore(p, false))
                        .cloned()
                        .collect();
                    let mut states = HashMap::new();
                    for path in &wanted {
                        let state = local::local_state(&mapping.local_path, path).await;
                        states.insert(path.clone(), state);
                    }
                    (states, Some(wanted))
                }
            };

        if candidates.as_ref().is_some_and(|c| c.is_empty()) {
            return out;
        }

        // Remote side
        let remote = self
            .with_reconnect(&mut endpoint, &mut reconnected, stat_timeout, |ep| {
                let transport = self.transport.clone();
                let paths = candidates.as_deref();
                async move { transport.remote_states(&ep, mapping, paths).await }
            })
            .await;
        let remote: HashMap<String, FileState> = match remote {
            Ok(states) => states
                .into_iter()
                .filter(|s| !matcher.should_ignore(&s.path, false))
                .map(|s| (s.path.clone(), s))
                .collect(),
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(mapping = %mapping.name, "Remote stat failed: {}", message);
                let affected: BTreeSet<&String> = match &candidates {
                    Some(paths) => paths.iter().collect(),
                    None => local.keys().collect(),
                };
                for path in affected {
                    out.record_failure(FileFailure::transfer(path.clone(), message.clone()));
                }
                out.error = Some(SyncError::from(e).to_string());
                return out;
            }
        };

        // Decide
        let paths: BTreeSet<&String> = match &candidates {
            Some(paths) => paths.iter().collect(),
            None => local.keys().chain(remote.keys()).collect(),
        };
        let decisions: Vec<ConflictDecision> = paths
            .into_iter()
            .map(|path| {
                let absent = || FileState::absent(path.clone());
                let l = local.get(path).cloned().unwrap_or_else(absent);
                let r = remote.get(path).cloned().unwrap_or_else(absent);
                decide(&l, &r, self.config.conflict_strategy)
            })
            .collect();

        let mut to_remote = Vec::new();
        let mut to_local = Vec::new();
        for decision in &decisions {
            match decision.action {
                SyncAction::Skip => out.skipped += 1,
                SyncAction::FlagManual => {
                    tracing::warn!(
                        mapping = %mapping.name,
                        path = %decision.path,
                        reason = ?decision.reason,
                        "Conflict needs manual resolution"
                    );
                    out.conflicted += 1;
                }
                action if !direction.allows(action) => out.skipped += 1,
                SyncAction::CopyToRemote => to_remote.push(decision.path.clone()),
                SyncAction::CopyToLocal => to_local.push(decision.path.clone()),
            }
        }
        out.decisions = decisions;

        if dry_run {
            tracing::info!(
                mapping = %mapping.name,
                to_remote = to_remote.len(),
                to_local = to_local.len(),
                "Dry run, no files transferred"
            );
            return out;
        }

        // Transfer, one batched invocation per direction
        let transfer_timeout = self.config.transfer.timeout();
        for (transfer_direction, files) in [
            (TransferDirection::ToRemote, to_remote),
            (TransferDirection::ToLocal, to_local),
        ] {
            if files.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                for path in files {
                    out.record_failure(FileFailure {
                        path,
                        code: "Cancelled".to_string(),
                        reason: SyncError::Cancelled.to_string(),
                    });
                }
                out.error = Some(SyncError::Cancelled.to_string());
                continue;
            }

            let report = self
                .with_reconnect(&mut endpoint, &mut reconnected, transfer_timeout, |ep| {
                    let transport = self.transport.clone();
                    let files = &files;
                    async move {
                        transport
                            .transfer(&ep, mapping, transfer_direction, files)
                            .await
                    }
                })
                .await;

            match report {
                Ok(report) => {
                    out.transferred += report.succeeded.len();
                    for (path, reason) in report.failed {
                        out.record_failure(FileFailure::transfer(path, reason));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        mapping = %mapping.name,
                        direction = ?transfer_direction,
                        "Transfer failed: {}",
                        e
                    );
                    let reason = e.to_string();
                    for path in files {
                        out.record_failure(FileFailure::transfer(path, reason.clone()));
                    }
                    if e.is_connectivity() {
                        out.error = Some(SyncError::from(e).to_string());
                    }
                }
            }
        }

        out
    }

    /// Run a remote call under a timeout, re-resolving once on connectivity failure
    async fn with_reconnect<T, F, Fut>(
        &self,
        endpoint: &mut Endpoint,
        reconnected: &mut bool,
        limit: Duration,
        op: F,
    ) -> Result<T, TransferError>
    where
        F: Fn(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        loop {
            let outcome = match timeout(limit, op(endpoint.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransferError::Timeout(limit)),
            };

            match outcome {
                Err(e) if e.is_connectivity() && !*reconnected => {
                    *reconnected = true;
                    tracing::warn!(
                        address = %endpoint.address,
                        "Remote call failed ({}), re-resolving endpoint",
                        e
                    );
                    self.resolver.invalidate();
                    match self.resolver.resolve(true).await {
                        Ok(fresh) => *endpoint = fresh,
                        Err(resolve_err) => {
                            return Err(TransferError::Connection(format!(
                                "{}; re-resolution failed: {}",
                                e, resolve_err
                            )));
                        }
                    }
                }
                outcome => return outcome,
            }
        }
    }
}
