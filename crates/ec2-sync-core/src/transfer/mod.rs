//! Transfer mechanism
//!
//! The orchestrator never moves bytes itself. It asks a [`Transport`] for
//! remote file state and hands it one batched transfer per mapping and
//! direction.
//!
//! - `ssh`: ssh command construction and subprocess plumbing
//! - `rsync`: the rsync-over-ssh transport

pub mod rsync;
pub mod ssh;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::DirectoryMapping;
use crate::endpoint::Endpoint;
use crate::models::FileState;

pub use rsync::RsyncTransport;
pub use ssh::SshOptions;

/// Errors reported by a transport
#[derive(Error, Debug)]
pub enum TransferError {
    /// The endpoint refused or dropped the connection
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The remote call did not finish in time
    #[error("Timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The tool ran and reported an error
    #[error("Transfer tool failed (exit code {}): {message}", exit_code(.code))]
    Failed { code: Option<i32>, message: String },

    /// The tool could not be launched
    #[error("Failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// Whether the failure points at an unreachable or stale endpoint
    pub fn is_connectivity(&self) -> bool {
        matches!(self, TransferError::Connection(_) | TransferError::Timeout(_))
    }
}

fn exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Which way a transfer moves files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferDirection {
    ToRemote,
    ToLocal,
}

/// Per-file outcome of one batched transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub succeeded: Vec<String>,
    /// Path and reason
    pub failed: Vec<(String, String)>,
}

impl TransferReport {
    /// Every path succeeded
    pub fn all_succeeded(paths: &[String]) -> Self {
        Self {
            succeeded: paths.to_vec(),
            failed: Vec::new(),
        }
    }
}

/// Result of a connectivity probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub ssh_ok: bool,
    /// First line of `rsync --version` on the remote side
    pub remote_rsync: Option<String>,
}

/// Summary of a mapping's remote root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteDirInfo {
    pub exists: bool,
    pub file_count: usize,
    pub total_bytes: u64,
}

/// Moves files between a mapping's local and remote roots
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Stat remote files
    ///
    /// With `paths == None` the whole remote tree is listed. Otherwise only the
    /// named paths are checked. Missing files are left out of the result.
    async fn remote_states(
        &self,
        endpoint: &Endpoint,
        mapping: &DirectoryMapping,
        paths: Option<&[String]>,
    ) -> Result<Vec<FileState>, TransferError>;

    /// Copy the given relative paths in one invocation
    async fn transfer(
        &self,
        endpoint: &Endpoint,
        mapping: &DirectoryMapping,
        direction: TransferDirection,
        paths: &[String],
    ) -> Result<TransferReport, TransferError>;

    /// Check that the endpoint accepts connections and has the transfer tool
    async fn probe(&self, endpoint: &Endpoint) -> Result<ProbeReport, TransferError>;

    /// Whether the remote root exists, and how many files and bytes it holds
    async fn remote_dir_info(
        &self,
        endpoint: &Endpoint,
        mapping: &DirectoryMapping,
    ) -> Result<RemoteDirInfo, TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(TransferError::Connection("refused".into()).is_connectivity());
        assert!(TransferError::Timeout(Duration::from_secs(1)).is_connectivity());
        assert!(!TransferError::Failed {
            code: Some(23),
            message: "partial".into()
        }
        .is_connectivity());
    }

    #[test]
    fn test_failed_display() {
        let err = TransferError::Failed {
            code: Some(11),
            message: "error in file IO".into(),
        };
        assert_eq!(
            err.to_string(),
            "Transfer tool failed (exit code 11): error in file IO"
        );
        let err = TransferError::Failed {
            code: None,
            message: "killed".into(),
        };
        assert!(err.to_string().contains("exit code none"));
    }
}
