//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;

use ec2_sync_core::models::ReasonCode;
use ec2_sync_core::{ConnectivityReport, SyncAction, SyncResult, SyncStatus, WatchTaskEvent};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
        println!("{}", json);
        Ok(())
    }

    /// Print the result of one sync cycle
    pub fn print_result(&self, result: &SyncResult) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(result)?,
            OutputFormat::Quiet => {
                for mapping in &result.mappings {
                    for failure in &mapping.failures {
                        println!("{}/{}", mapping.name, failure.path);
                    }
                }
            }
            OutputFormat::Human => {
                if let Some(ref err) = result.error {
                    println!("✗ Sync failed: {}", err.message);
                    if let Some(ref hint) = err.suggestion {
                        println!("  Hint: {}", hint);
                    }
                    return Ok(());
                }

                for mapping in &result.mappings {
                    println!(
                        "{:<16} {} transferred, {} skipped, {} conflict(s), {} failed",
                        mapping.name,
                        mapping.transferred,
                        mapping.skipped,
                        mapping.conflicted,
                        mapping.failed
                    );
                    if result.dry_run {
                        for decision in &mapping.decisions {
                            if let Some(arrow) = action_arrow(decision.action) {
                                println!("  {} {}", arrow, decision.path);
                            }
                        }
                    }
                    for decision in &mapping.decisions {
                        if decision.action == SyncAction::FlagManual {
                            println!("  ! {} ({})", decision.path, reason_text(decision.reason));
                        }
                    }
                    for failure in &mapping.failures {
                        println!("  ✗ {}: {}", failure.path, failure.reason);
                    }
                    if let Some(ref err) = mapping.error {
                        println!("  ✗ {}", err);
                    }
                }

                let summary = result.summary();
                let secs = result.duration_ms as f64 / 1000.0;
                let target = result.endpoint.as_deref().unwrap_or("-");
                if result.dry_run {
                    println!(
                        "✓ Dry run complete in {:.1}s against {} (nothing transferred)",
                        secs, target
                    );
                } else if result.success {
                    println!(
                        "✓ Sync complete in {:.1}s against {} ({} transferred)",
                        secs, target, summary.transferred
                    );
                } else {
                    println!(
                        "✗ Sync finished with {} failure(s) in {:.1}s against {}",
                        summary.failed, secs, target
                    );
                }
            }
        }
        Ok(())
    }

    /// Print instance and mapping status
    pub fn print_status(&self, status: &SyncStatus) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(status)?,
            OutputFormat::Quiet => {
                let state = status
                    .instance
                    .power_state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("{}", state);
            }
            OutputFormat::Human => {
                println!("ec2-sync Status ({})", status.project_name);
                println!("===============");
                println!();
                println!("Instance:");
                println!("  Lookup:  {}", status.instance.lookup);
                println!("  Region:  {}", status.region);
                if let Some(ref id) = status.instance.instance_id {
                    println!("  ID:      {}", id);
                }
                if let Some(state) = status.instance.power_state {
                    println!("  State:   {}", state);
                }
                println!(
                    "  Address: {}",
                    status.instance.address.as_deref().unwrap_or("(none)")
                );
                if let Some(ref kind) = status.instance.instance_type {
                    println!("  Type:    {}", kind);
                }
                if let Some(ref err) = status.instance.error {
                    println!("  Error:   {}", err);
                }
                println!();
                println!("Mappings:");
                for mapping in &status.mappings {
                    let state = match (mapping.enabled, mapping.local_exists) {
                        (false, _) => "disabled".to_string(),
                        (true, false) => "local root missing".to_string(),
                        (true, true) => format!("{} file(s)", mapping.file_count),
                    };
                    println!(
                        "  {:<16} {} -> {} [{}]",
                        mapping.name,
                        mapping.local_path.display(),
                        mapping.remote_path,
                        state
                    );
                    match (&mapping.remote, &mapping.remote_error) {
                        (Some(remote), _) if remote.exists => println!(
                            "  {:<16} remote: {} file(s), {}",
                            "",
                            remote.file_count,
                            human_bytes(remote.total_bytes)
                        ),
                        (Some(_), _) => println!("  {:<16} remote: root missing", ""),
                        (None, Some(err)) => println!("  {:<16} remote: {}", "", err),
                        (None, None) => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Print a connectivity check
    pub fn print_connectivity(&self, report: &ConnectivityReport) -> Result<()> {
        match self.format {
            OutputFormat::Json => self.print_json(report)?,
            OutputFormat::Quiet => println!("{}", if report.success { "ok" } else { "failed" }),
            OutputFormat::Human => {
                println!("{} Instance found", check(report.instance_found));
                println!(
                    "{} Instance running{}",
                    check(report.running),
                    report
                        .address
                        .as_deref()
                        .map(|a| format!(" at {}", a))
                        .unwrap_or_default()
                );
                if report.running {
                    println!("{} SSH reachable", check(report.ssh_ok));
                    println!(
                        "{} rsync on instance{}",
                        check(report.remote_rsync.is_some()),
                        report
                            .remote_rsync
                            .as_deref()
                            .map(|v| format!(" ({})", v))
                            .unwrap_or_default()
                    );
                }
                if let Some(ref err) = report.error {
                    println!();
                    println!("Error: {}", err);
                }
                if let Some(ref hint) = report.suggestion {
                    println!("Hint:  {}", hint);
                }
            }
        }
        Ok(())
    }

    /// Print one watch loop event; JSON output is one object per line
    pub fn print_watch_event(&self, event: &WatchTaskEvent) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let value = match event {
                    WatchTaskEvent::Started { mappings } => {
                        serde_json::json!({"event": "started", "mappings": mappings})
                    }
                    WatchTaskEvent::BatchClosed { mapping, paths } => {
                        serde_json::json!({
                            "event": "batch_closed",
                            "mapping": mapping,
                            "paths": paths
                        })
                    }
                    WatchTaskEvent::CycleStarted { mappings, full } => {
                        serde_json::json!({
                            "event": "cycle_started",
                            "mappings": mappings,
                            "full": full
                        })
                    }
                    WatchTaskEvent::CycleFinished(result) => {
                        let result = serde_json::to_value(result)
                            .context("Failed to serialize sync result")?;
                        serde_json::json!({"event": "cycle_finished", "result": result})
                    }
                    WatchTaskEvent::EndpointChanged(endpoint) => {
                        let endpoint = serde_json::to_value(endpoint)
                            .context("Failed to serialize endpoint")?;
                        serde_json::json!({"event": "endpoint_changed", "endpoint": endpoint})
                    }
                    WatchTaskEvent::Error(message) => {
                        serde_json::json!({"event": "error", "message": message})
                    }
                    WatchTaskEvent::Stopped => serde_json::json!({"event": "stopped"}),
                };
                println!("{}", value);
            }
            OutputFormat::Quiet => {
                if let WatchTaskEvent::Error(message) = event {
                    eprintln!("{}", message);
                }
            }
            OutputFormat::Human => {
                let now = Local::now().format("%H:%M:%S");
                match event {
                    WatchTaskEvent::Started { mappings } => {
                        println!("[{}] Watching {} mapping(s)", now, mappings)
                    }
                    WatchTaskEvent::BatchClosed { mapping, paths } => {
                        println!("[{}] {}: {} changed path(s)", now, mapping, paths)
                    }
                    WatchTaskEvent::CycleStarted { mappings, full } => println!(
                        "[{}] {} sync of {}",
                        now,
                        if *full { "Full" } else { "Incremental" },
                        mappings.join(", ")
                    ),
                    WatchTaskEvent::CycleFinished(result) => {
                        let summary = result.summary();
                        let mark = if result.success { "✓" } else { "✗" };
                        println!(
                            "[{}] {} {} transferred, {} conflict(s), {} failed ({} ms)",
                            now,
                            mark,
                            summary.transferred,
                            summary.conflicted,
                            summary.failed,
                            result.duration_ms
                        );
                        if let Some(ref err) = result.error {
                            println!("           {}", err.message);
                        }
                        for mapping in &result.mappings {
                            for failure in &mapping.failures {
                                println!(
                                    "           ✗ {}/{}: {}",
                                    mapping.name, failure.path, failure.reason
                                );
                            }
                        }
                    }
                    WatchTaskEvent::EndpointChanged(endpoint) => println!(
                        "[{}] Instance {} is now at {}",
                        now, endpoint.instance_id, endpoint.address
                    ),
                    WatchTaskEvent::Error(message) => println!("[{}] ✗ {}", now, message),
                    WatchTaskEvent::Stopped => println!("[{}] Stopped", now),
                }
            }
        }
        Ok(())
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json | OutputFormat::Quiet => {}
        }
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn check(ok: bool) -> &'static str {
    if ok {
        "✓"
    } else {
        "✗"
    }
}

/// Arrow for a planned transfer, `None` for non-transfers
fn action_arrow(action: SyncAction) -> Option<&'static str> {
    match action {
        SyncAction::CopyToRemote => Some("→"),
        SyncAction::CopyToLocal => Some("←"),
        SyncAction::Skip | SyncAction::FlagManual => None,
    }
}

fn reason_text(reason: ReasonCode) -> &'static str {
    match reason {
        ReasonCode::SizeMismatchSameMtime => "same mtime, different size",
        ReasonCode::ManualStrategy => "changed on both sides",
        _ => "needs review",
    }
}
