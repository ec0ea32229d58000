//! Data models for ec2-sync
//!
//! Defines the values that flow through a sync cycle: change events and the
//! batches they are folded into, per-file state pairs and the decisions made
//! about them, and the result reported once a cycle finishes.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Which way a cycle is allowed to move files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    /// Both directions, conflicts decided by the configured strategy
    Bidirectional,
    /// Local to remote only; remote-to-local actions are suppressed
    PushOnly,
    /// Remote to local only; local-to-remote actions are suppressed
    PullOnly,
}

impl SyncDirection {
    /// Whether an action is permitted under this direction
    pub fn allows(&self, action: SyncAction) -> bool {
        match (self, action) {
            (SyncDirection::PushOnly, SyncAction::CopyToLocal) => false,
            (SyncDirection::PullOnly, SyncAction::CopyToRemote) => false,
            _ => true,
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncDirection::Bidirectional => "bidirectional",
            SyncDirection::PushOnly => "push-only",
            SyncDirection::PullOnly => "pull-only",
        };
        f.write_str(s)
    }
}

/// Kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// A single filesystem change attributed to a mapping
///
/// Produced by the notification source and consumed by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Absolute path that changed
    pub path: PathBuf,
    /// What happened to it
    pub kind: ChangeKind,
    /// Whether the path is a directory
    pub is_dir: bool,
    /// When the change was observed
    pub timestamp: DateTime<Utc>,
    /// Name of the mapping whose local root contains the path
    pub mapping: String,
}

impl ChangeEvent {
    /// Create a file change event observed now
    pub fn new(mapping: impl Into<String>, path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            is_dir: false,
            timestamp: Utc::now(),
            mapping: mapping.into(),
        }
    }

    /// Mark the event as concerning a directory
    pub fn directory(mut self) -> Self {
        self.is_dir = true;
        self
    }
}

/// A coalesced set of changed paths for one mapping
#[derive(Debug, Clone)]
pub struct SyncBatch {
    /// Mapping the batch belongs to
    pub mapping: String,
    /// Affected paths, relative to the mapping's local root
    pub paths: BTreeSet<String>,
    /// When the first event of the batch arrived
    pub opened_at: Instant,
    /// When the batch was closed and handed off
    pub closed_at: Instant,
}

impl SyncBatch {
    /// Number of distinct affected paths
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether the batch has no paths
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// State of one file on one side of a mapping
///
/// Produced fresh for every decision; never cached across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    /// Path relative to the mapping root, `/`-separated
    pub path: String,
    /// Size in bytes (0 when absent)
    pub size: u64,
    /// Modification time in whole seconds since the Unix epoch (0 when absent)
    pub mtime: i64,
    /// Whether the file exists on this side
    pub exists: bool,
}

impl FileState {
    /// A file that exists with the given size and mtime
    pub fn present(path: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            path: path.into(),
            size,
            mtime,
            exists: true,
        }
    }

    /// A file that does not exist on this side
    pub fn absent(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            mtime: 0,
            exists: false,
        }
    }
}

/// What to do with a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncAction {
    /// Nothing to do
    Skip,
    /// Copy local to remote
    CopyToRemote,
    /// Copy remote to local
    CopyToLocal,
    /// Ambiguous; needs a human
    FlagManual,
}

impl SyncAction {
    /// Whether the action moves bytes
    pub fn is_transfer(&self) -> bool {
        matches!(self, SyncAction::CopyToRemote | SyncAction::CopyToLocal)
    }
}

/// Why a decision was made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    BothAbsent,
    LocalOnly,
    RemoteOnly,
    InSync,
    LocalNewer,
    RemoteNewer,
    LocalPreferred,
    RemotePreferred,
    SizeMismatchSameMtime,
    ManualStrategy,
}

/// Outcome of comparing one file's local and remote state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDecision {
    pub path: String,
    pub action: SyncAction,
    pub reason: ReasonCode,
}

/// Conflict resolution strategy for bidirectional sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Newer modification time wins
    #[default]
    Newer,
    /// Local always wins on any difference
    Local,
    /// Remote always wins on any difference
    Remote,
    /// Every difference is flagged for manual resolution
    Manual,
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newer" => Ok(ConflictStrategy::Newer),
            "local" => Ok(ConflictStrategy::Local),
            "remote" => Ok(ConflictStrategy::Remote),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(format!(
                "unknown conflict strategy '{}' (expected newer, local, remote or manual)",
                other
            )),
        }
    }
}

/// A file that could not be synced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: String,
    /// Error code from the sync taxonomy (e.g. `TransferFailed`)
    pub code: String,
    pub reason: String,
}

impl FileFailure {
    /// A transfer failure for one file
    pub fn transfer(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code: "TransferFailed".to_string(),
            reason: reason.into(),
        }
    }
}

/// Outcome of one mapping within a cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingResult {
    /// Mapping name
    pub name: String,
    pub transferred: usize,
    pub skipped: usize,
    pub conflicted: usize,
    pub failed: usize,
    /// Per-file failures with reasons
    pub failures: Vec<FileFailure>,
    /// Every decision made for this mapping (the plan, in dry-run)
    pub decisions: Vec<ConflictDecision>,
    /// Mapping-level error (unreachable endpoint, cancellation)
    pub error: Option<String>,
}

impl MappingResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Record a per-file failure
    pub fn record_failure(&mut self, failure: FileFailure) {
        self.failed += 1;
        self.failures.push(failure);
    }

    /// Whether the mapping finished without failures
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.error.is_none()
    }
}

/// Cycle-level error, flattened for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleError {
    pub code: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl From<&SyncError> for CycleError {
    fn from(err: &SyncError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            suggestion: err.recovery_suggestion().map(str::to_string),
        }
    }
}

/// Aggregate counts across all mappings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub mappings: usize,
    pub transferred: usize,
    pub skipped: usize,
    pub conflicted: usize,
    pub failed: usize,
}

/// Result of one sync cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub cycle_id: Uuid,
    pub direction: SyncDirection,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Endpoint resolution attempts made
    pub attempts: u32,
    /// Address the cycle ran against, if one was resolved
    pub endpoint: Option<String>,
    pub mappings: Vec<MappingResult>,
    /// Fatal or cycle-level error
    pub error: Option<CycleError>,
    pub success: bool,
}

impl SyncResult {
    /// Start an empty result for a new cycle
    pub fn begin(direction: SyncDirection, dry_run: bool) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            direction,
            dry_run,
            started_at: Utc::now(),
            duration_ms: 0,
            attempts: 0,
            endpoint: None,
            mappings: Vec::new(),
            error: None,
            success: false,
        }
    }

    /// Record a cycle-level error
    pub fn fail(&mut self, err: &SyncError) {
        self.error = Some(CycleError::from(err));
    }

    /// Compute the success flag and duration
    pub fn finish(mut self) -> Self {
        let elapsed = Utc::now() - self.started_at;
        self.duration_ms = elapsed.num_milliseconds().max(0) as u64;
        self.success = self.error.is_none() && self.mappings.iter().all(|m| m.is_success());
        self
    }

    /// Look up a mapping's result by name
    pub fn mapping(&self, name: &str) -> Option<&MappingResult> {
        self.mappings.iter().find(|m| m.name == name)
    }

    /// Aggregate counts
    pub fn summary(&self) -> ResultSummary {
        self.mappings
            .iter()
            .fold(ResultSummary::default(), |mut acc, m| {
                acc.mappings += 1;
                acc.transferred += m.transferred;
                acc.skipped += m.skipped;
                acc.conflicted += m.conflicted;
                acc.failed += m.failed;
                acc
            })
    }
}
