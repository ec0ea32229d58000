//! Watch task
//!
//! Long-running loop that feeds filesystem changes into the [`Batcher`] and
//! triggers a sync cycle whenever batches close. One cycle runs at a time;
//! changes keep accumulating while it does, and mappings that were part of
//! it stay held until it finishes, fails or times out.
//!
//! Paths from a targeted cycle that did not sync go back into the batcher
//! and are retried after the mapping's cooldown.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{error::Elapsed, Instant};
use tokio_util::sync::CancellationToken;

use super::batcher::Batcher;
use super::watcher::{FsWatcher, MappingRoots};
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::SyncError;
use crate::models::{ChangeEvent, SyncDirection, SyncResult};
use crate::orchestrator::{CycleRequest, SyncOrchestrator};

/// Commands sent to the watch task
#[derive(Debug, Clone)]
pub enum WatchCommand {
    /// Run a full cycle as soon as no cycle is in flight
    SyncNow,
    /// Stop watching; an in-flight cycle is cancelled at its next checkpoint
    Shutdown,
}

/// Events emitted by the watch task
#[derive(Debug, Clone)]
pub enum WatchTaskEvent {
    /// The loop is running
    Started { mappings: usize },
    /// A mapping's batch closed
    BatchClosed { mapping: String, paths: usize },
    /// A cycle was launched
    CycleStarted { mappings: Vec<String>, full: bool },
    /// A cycle completed, successfully or not
    CycleFinished(Box<SyncResult>),
    /// The resolved address changed
    EndpointChanged(Endpoint),
    /// Error occurred
    Error(String),
    /// The loop exited
    Stopped,
}

/// Watch task status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    /// Waiting for changes
    Idle,
    /// A cycle is in flight
    Syncing,
    /// The loop exited
    Stopped,
}

/// Handle to control the watch task
pub struct WatchHandle {
    /// Send commands to the watch task
    pub command_tx: mpsc::Sender<WatchCommand>,
    /// Receive events from the watch task
    pub event_rx: mpsc::Receiver<WatchTaskEvent>,
    /// Watch loop status
    pub status_rx: watch::Receiver<WatchStatus>,
}

/// How the watch task triggers cycles
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub direction: SyncDirection,
    /// Run a full cycle before processing changes
    pub initial_sync: bool,
    /// Upper bound on one cycle
    pub cycle_timeout: Duration,
}

impl WatchOptions {
    pub fn from_config(config: &Config, direction: SyncDirection) -> Self {
        Self {
            direction,
            initial_sync: config.watch.initial_sync,
            cycle_timeout: config.cycle_timeout(),
        }
    }
}

/// Watch every enabled mapping and sync on change
///
/// The filesystem watcher lives inside the task and stops with it.
pub fn start_watching(
    orchestrator: Arc<SyncOrchestrator>,
    options: WatchOptions,
) -> Result<WatchHandle, SyncError> {
    let (change_tx, change_rx) = mpsc::channel(1024);
    let watcher = FsWatcher::start(MappingRoots::from_config(orchestrator.config()), change_tx)?;
    let batcher = Batcher::from_config(orchestrator.config());
    Ok(spawn(orchestrator, batcher, options, change_rx, Some(watcher)))
}

/// Spawn the watch task over an existing change stream
pub fn spawn_watch_task(
    orchestrator: Arc<SyncOrchestrator>,
    batcher: Batcher,
    options: WatchOptions,
    change_rx: mpsc::Receiver<ChangeEvent>,
) -> WatchHandle {
    spawn(orchestrator, batcher, options, change_rx, None)
}

fn spawn(
    orchestrator: Arc<SyncOrchestrator>,
    batcher: Batcher,
    options: WatchOptions,
    change_rx: mpsc::Receiver<ChangeEvent>,
    watcher: Option<FsWatcher>,
) -> WatchHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(WatchStatus::Idle);

    let channels = Channels {
        change_rx,
        command_rx,
        event_tx,
        status_tx,
    };
    tokio::spawn(watch_task_loop(orchestrator, batcher, options, channels, watcher));

    WatchHandle {
        command_tx,
        event_rx,
        status_rx,
    }
}

struct Channels {
    change_rx: mpsc::Receiver<ChangeEvent>,
    command_rx: mpsc::Receiver<WatchCommand>,
    event_tx: mpsc::Sender<WatchTaskEvent>,
    status_tx: watch::Sender<WatchStatus>,
}

struct RunningCycle {
    mappings: Vec<String>,
    /// Batch paths per mapping; empty for full cycles
    paths: BTreeMap<String, BTreeSet<String>>,
    handle: JoinHandle<Result<SyncResult, Elapsed>>,
}

type CycleOutcome = Result<Result<SyncResult, Elapsed>, tokio::task::JoinError>;

async fn watch_task_loop(
    orchestrator: Arc<SyncOrchestrator>,
    mut batcher: Batcher,
    options: WatchOptions,
    channels: Channels,
    _watcher: Option<FsWatcher>,
) {
    let Channels {
        mut change_rx,
        mut command_rx,
        event_tx,
        status_tx,
    } = channels;

    let shutdown = CancellationToken::new();
    let mut endpoint_rx = orchestrator.resolver().subscribe();

    let mut running: Option<RunningCycle> = None;
    let mut full_requested = options.initial_sync;

    tracing::info!(mappings = batcher.mappings().count(), "Watch loop started");
    let _ = event_tx
        .send(WatchTaskEvent::Started {
            mappings: batcher.mappings().count(),
        })
        .await;

    loop {
        if running.is_none() {
            let launched = if full_requested {
                full_requested = false;
                let mappings: Vec<String> = batcher.mappings().map(str::to_string).collect();
                for mapping in &mappings {
                    batcher.mark_in_flight(mapping);
                }
                Some((CycleRequest::full(options.direction), mappings, BTreeMap::new()))
            } else {
                let ready = batcher.take_ready(Instant::now().into_std());
                if ready.is_empty() {
                    None
                } else {
                    for batch in &ready {
                        let _ = event_tx
                            .send(WatchTaskEvent::BatchClosed {
                                mapping: batch.mapping.clone(),
                                paths: batch.len(),
                            })
                            .await;
                    }
                    let mappings = ready.iter().map(|b| b.mapping.clone()).collect();
                    let paths: BTreeMap<String, BTreeSet<String>> = ready
                        .iter()
                        .map(|b| (b.mapping.clone(), b.paths.clone()))
                        .collect();
                    Some((CycleRequest::targeted(options.direction, ready), mappings, paths))
                }
            };

            if let Some((request, mappings, paths)) = launched {
                let _ = event_tx
                    .send(WatchTaskEvent::CycleStarted {
                        mappings: mappings.clone(),
                        full: paths.is_empty(),
                    })
                    .await;
                let _ = status_tx.send(WatchStatus::Syncing);
                let handle = start_cycle(&orchestrator, &options, request, &shutdown);
                running = Some(RunningCycle {
                    mappings,
                    paths,
                    handle,
                });
            }
        }

        let deadline = if running.is_none() {
            batcher.next_deadline().map(Instant::from_std)
        } else {
            None
        };

        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(WatchCommand::SyncNow) => full_requested = true,
                    Some(WatchCommand::Shutdown) | None => break,
                }
            }
            Some(change) = change_rx.recv() => {
                batcher.record(&change, Instant::now().into_std());
            }
            joined = async {
                match running.as_mut() {
                    Some(cycle) => (&mut cycle.handle).await,
                    None => std::future::pending().await,
                }
            }, if running.is_some() => {
                if let Some(cycle) = running.take() {
                    for mapping in &cycle.mappings {
                        batcher.complete(mapping);
                    }
                    let now = Instant::now().into_std();
                    for (mapping, paths) in unsynced_paths(&joined, &cycle.paths) {
                        batcher.requeue(&mapping, paths, now);
                    }
                    report_cycle(joined, &cycle.mappings, &options, &event_tx).await;
                }
                let _ = status_tx.send(WatchStatus::Idle);
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                // Batches are collected at the top of the loop
            }
            Ok(()) = endpoint_rx.changed() => {
                let endpoint = endpoint_rx.borrow_and_update().clone();
                if let Some(endpoint) = endpoint {
                    let _ = event_tx.send(WatchTaskEvent::EndpointChanged(endpoint)).await;
                }
            }
        }
    }

    tracing::info!("Watch loop stopping");
    shutdown.cancel();
    if let Some(cycle) = running.take() {
        let joined = cycle.handle.await;
        report_cycle(joined, &cycle.mappings, &options, &event_tx).await;
    }
    let _ = status_tx.send(WatchStatus::Stopped);
    let _ = event_tx.send(WatchTaskEvent::Stopped).await;
}

fn start_cycle(
    orchestrator: &Arc<SyncOrchestrator>,
    options: &WatchOptions,
    request: CycleRequest,
    shutdown: &CancellationToken,
) -> JoinHandle<Result<SyncResult, Elapsed>> {
    let orchestrator = orchestrator.clone();
    let cancel = shutdown.child_token();
    let limit = options.cycle_timeout;
    tokio::spawn(async move {
        tokio::time::timeout(limit, orchestrator.run_cycle(request, &cancel)).await
    })
}

/// Batch paths that still need a sync after a cycle ended
///
/// A cycle that failed, timed out or panicked gives back every path. A
/// finished cycle gives back per-file failures plus the whole batch of any
/// mapping that errored.
fn unsynced_paths(
    joined: &CycleOutcome,
    batches: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeMap<String, BTreeSet<String>> {
    let result = match joined {
        Ok(Ok(result)) if result.error.is_none() => result,
        _ => return batches.clone(),
    };

    let mut retry: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for mapping in &result.mappings {
        let Some(batch) = batches.get(&mapping.name) else {
            continue;
        };
        let paths = retry.entry(mapping.name.clone()).or_default();
        if mapping.error.is_some() {
            paths.extend(batch.iter().cloned());
        }
        paths.extend(
            mapping
                .failures
                .iter()
                .filter(|f| batch.contains(&f.path))
                .map(|f| f.path.clone()),
        );
    }
    retry.retain(|_, paths| !paths.is_empty());
    retry
}

async fn report_cycle(
    joined: CycleOutcome,
    mappings: &[String],
    options: &WatchOptions,
    event_tx: &mpsc::Sender<WatchTaskEvent>,
) {
    let event = match joined {
        Ok(Ok(result)) => WatchTaskEvent::CycleFinished(Box::new(result)),
        Ok(Err(_)) => {
            tracing::error!(
                mappings = ?mappings,
                "Sync cycle exceeded {}s and was abandoned",
                options.cycle_timeout.as_secs()
            );
            WatchTaskEvent::Error(format!(
                "Sync cycle for {} timed out after {}s",
                mappings.join(", "),
                options.cycle_timeout.as_secs()
            ))
        }
        Err(e) => WatchTaskEvent::Error(format!("Sync cycle task failed: {}", e)),
    };
    let _ = event_tx.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::PowerState;
    use crate::models::ChangeKind;
    use crate::retry::RetryPolicy;
    use crate::testing::{self, FakeProvider, FakeTransport};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        root: PathBuf,
        transport: Arc<FakeTransport>,
        change_tx: mpsc::Sender<ChangeEvent>,
        handle: WatchHandle,
    }

    fn harness(initial_sync: bool, cycle_timeout: Duration) -> Harness {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("app");
        std::fs::create_dir_all(&root).unwrap();
        let config = testing::config(&[("app", root.as_path())]);

        let provider = Arc::new(FakeProvider::new(PowerState::Running, Some("10.0.0.1")));
        let transport = Arc::new(FakeTransport::new());
        let batcher = Batcher::from_config(&config);
        let orchestrator = Arc::new(
            SyncOrchestrator::new(config, testing::resolver(&provider), transport.clone())
                .unwrap()
                .with_retry(RetryPolicy::immediate(2)),
        );

        let (change_tx, change_rx) = mpsc::channel(64);
        let options = WatchOptions {
            direction: SyncDirection::Bidirectional,
            initial_sync,
            cycle_timeout,
        };
        let handle = spawn_watch_task(orchestrator, batcher, options, change_rx);
        Harness {
            _temp: temp,
            root,
            transport,
            change_tx,
            handle,
        }
    }

    async fn next_matching(
        handle: &mut WatchHandle,
        mut pred: impl FnMut(&WatchTaskEvent) -> bool,
    ) -> WatchTaskEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(3600), handle.event_rx.recv())
                .await
                .expect("watch task went quiet")
                .expect("watch task exited");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_trigger_targeted_cycle() {
        let mut h = harness(false, Duration::from_secs(1800));
        std::fs::write(h.root.join("a.txt"), "a").unwrap();
        std::fs::write(h.root.join("b.txt"), "b").unwrap();

        for name in ["a.txt", "b.txt", "a.txt"] {
            h.change_tx
                .send(ChangeEvent::new("app", h.root.join(name), ChangeKind::Modified))
                .await
                .unwrap();
        }

        let closed = next_matching(&mut h.handle, |e| {
            matches!(e, WatchTaskEvent::BatchClosed { .. })
        })
        .await;
        match closed {
            WatchTaskEvent::BatchClosed { mapping, paths } => {
                assert_eq!(mapping, "app");
                assert_eq!(paths, 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        let finished =
            next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::CycleFinished(_))).await;
        let WatchTaskEvent::CycleFinished(result) = finished else {
            unreachable!()
        };
        assert!(result.success);
        assert_eq!(result.summary().transferred, 2);
        assert_eq!(h.transport.transfers_for("app").len(), 1);

        h.handle.command_tx.send(WatchCommand::Shutdown).await.unwrap();
        next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::Stopped)).await;
        assert_eq!(*h.handle.status_rx.borrow(), WatchStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_and_requested_full_sync() {
        let mut h = harness(true, Duration::from_secs(1800));

        let started =
            next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::CycleStarted { .. })).await;
        assert!(matches!(started, WatchTaskEvent::CycleStarted { full: true, .. }));
        next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::CycleFinished(_))).await;

        h.handle.command_tx.send(WatchCommand::SyncNow).await.unwrap();
        let started =
            next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::CycleStarted { .. })).await;
        assert!(matches!(started, WatchTaskEvent::CycleStarted { full: true, .. }));
        next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::CycleFinished(_))).await;
        assert_eq!(h.transport.stat_calls("app"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_change_is_reported() {
        let mut h = harness(true, Duration::from_secs(1800));
        let event =
            next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::EndpointChanged(_))).await;
        let WatchTaskEvent::EndpointChanged(endpoint) = event else {
            unreachable!()
        };
        assert_eq!(endpoint.address, "10.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_timeout_releases_mapping() {
        let mut h = harness(false, Duration::from_secs(10));
        h.transport.hang("app");
        std::fs::write(h.root.join("a.txt"), "a").unwrap();
        h.change_tx
            .send(ChangeEvent::new("app", h.root.join("a.txt"), ChangeKind::Created))
            .await
            .unwrap();

        let event = next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::Error(_))).await;
        let WatchTaskEvent::Error(message) = event else {
            unreachable!()
        };
        assert!(message.contains("timed out"));

        // The mapping is free again and the abandoned path is retried
        h.transport.unhang("app");
        let closed =
            next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::BatchClosed { .. })).await;
        assert!(matches!(closed, WatchTaskEvent::BatchClosed { paths: 1, .. }));
        let finished =
            next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::CycleFinished(_))).await;
        let WatchTaskEvent::CycleFinished(result) = finished else {
            unreachable!()
        };
        assert!(result.success);
        let transfers = h.transport.transfers_for("app");
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].2, vec!["a.txt".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_paths_are_retried() {
        let mut h = harness(false, Duration::from_secs(1800));
        h.transport.fail_path("a.txt", "Permission denied (13)");
        std::fs::write(h.root.join("a.txt"), "a").unwrap();
        std::fs::write(h.root.join("b.txt"), "b").unwrap();
        for name in ["a.txt", "b.txt"] {
            h.change_tx
                .send(ChangeEvent::new("app", h.root.join(name), ChangeKind::Modified))
                .await
                .unwrap();
        }

        let finished =
            next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::CycleFinished(_))).await;
        let WatchTaskEvent::CycleFinished(result) = finished else {
            unreachable!()
        };
        assert_eq!(result.summary().failed, 1);
        h.transport.heal("a.txt");

        // No new change: only the failed path goes out again
        let closed =
            next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::BatchClosed { .. })).await;
        assert!(matches!(closed, WatchTaskEvent::BatchClosed { paths: 1, .. }));
        let finished =
            next_matching(&mut h.handle, |e| matches!(e, WatchTaskEvent::CycleFinished(_))).await;
        let WatchTaskEvent::CycleFinished(result) = finished else {
            unreachable!()
        };
        assert!(result.success);

        let transfers = h.transport.transfers_for("app");
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].2.len(), 2);
        assert_eq!(transfers[1].2, vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_unsynced_paths_per_outcome() {
        use crate::models::{FileFailure, MappingResult};

        let batches: BTreeMap<String, BTreeSet<String>> = [
            ("app", vec!["a.txt", "b.txt"]),
            ("docs", vec!["index.md"]),
        ]
        .into_iter()
        .map(|(m, p)| (m.to_string(), p.into_iter().map(String::from).collect()))
        .collect();

        let mut result = SyncResult::begin(SyncDirection::Bidirectional, false);
        let mut app = MappingResult::new("app");
        app.record_failure(FileFailure::transfer("b.txt", "Permission denied"));
        let mut docs = MappingResult::new("docs");
        docs.error = Some("connection refused".to_string());
        result.mappings = vec![app, docs];

        let retry = unsynced_paths(&Ok(Ok(result)), &batches);
        assert_eq!(retry["app"].iter().collect::<Vec<_>>(), vec!["b.txt"]);
        assert_eq!(retry["docs"].len(), 1);

        let mut clean = SyncResult::begin(SyncDirection::Bidirectional, false);
        clean.mappings = vec![MappingResult::new("app"), MappingResult::new("docs")];
        assert!(unsynced_paths(&Ok(Ok(clean)), &batches).is_empty());
    }
}
