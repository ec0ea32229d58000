//! Sync error handling
//!
//! Provides the error taxonomy for a sync cycle with machine-readable codes
//! and recovery suggestions.
//!
//! Errors fall into three groups:
//! - fatal: the cycle stops immediately and is never retried
//! - retryable: the cycle is retried with backoff, then reported as failed
//! - per-file: recorded in the cycle result without aborting siblings

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::endpoint::ProviderError;
use crate::transfer::TransferError;

/// Errors that can occur while running a sync cycle
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration failed to load or validate
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),

    /// The configured instance does not exist (or was terminated)
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Credentials lack the permissions needed to describe or start the instance
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The instance did not reach `running` within the wait budget
    #[error("Instance '{instance_id}' did not reach 'running' within {}s", waited.as_secs())]
    InstanceStartTimeout {
        instance_id: String,
        waited: Duration,
    },

    /// The instance is running but has no usable address (or describe failed transiently)
    #[error("No reachable address for instance: {0}")]
    AddressUnavailable(String),

    /// The instance is stopped and auto-start is disabled
    #[error("Instance '{0}' is stopped and auto-start is disabled")]
    InstanceStopped(String),

    /// The remote endpoint refused or timed out a connection
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The transfer tool reported a failure
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// The cycle was cancelled before it could finish
    #[error("Sync cycle cancelled")]
    Cancelled,

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    /// Whether the cycle may be retried after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::InstanceStartTimeout { .. }
                | SyncError::AddressUnavailable(_)
                | SyncError::Connectivity(_)
        )
    }

    /// Whether the error aborts the whole cycle with no retry
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::ConfigInvalid(_)
                | SyncError::InstanceNotFound(_)
                | SyncError::PermissionDenied(_)
                | SyncError::InstanceStopped(_)
        )
    }

    /// Whether the error suggests the cached address is stale or unreachable
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Connectivity(_))
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::ConfigInvalid(_) => "ConfigInvalid",
            SyncError::InstanceNotFound(_) => "InstanceNotFound",
            SyncError::PermissionDenied(_) => "PermissionDenied",
            SyncError::InstanceStartTimeout { .. } => "InstanceStartTimeout",
            SyncError::AddressUnavailable(_) => "AddressUnavailable",
            SyncError::InstanceStopped(_) => "InstanceStopped",
            SyncError::Connectivity(_) => "Connectivity",
            SyncError::TransferFailed(_) => "TransferFailed",
            SyncError::Cancelled => "Cancelled",
            SyncError::Io(_) => "Io",
        }
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::ConfigInvalid(_) => {
                Some("Fix the configuration file and run `ec2-sync config validate`.")
            }
            SyncError::InstanceNotFound(_) => {
                Some("Check instance_id / instance_name and the region in the [instance] section.")
            }
            SyncError::PermissionDenied(_) => {
                Some("Ensure the AWS profile allows ec2:DescribeInstances and ec2:StartInstances, and that credentials are configured (`aws configure`).")
            }
            SyncError::InstanceStartTimeout { .. } => {
                Some("The instance is slow to boot. Try again, or raise instance.max_wait_secs.")
            }
            SyncError::AddressUnavailable(_) => {
                Some("Make sure the instance has a public IP (or set instance.address = \"private\").")
            }
            SyncError::InstanceStopped(_) => {
                Some("Start the instance manually or set instance.auto_start = true.")
            }
            SyncError::Connectivity(_) => {
                Some("Check security groups allow SSH and that the key file is correct. `ec2-sync doctor` runs a full connectivity check.")
            }
            _ => None,
        }
    }
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => SyncError::InstanceNotFound(msg),
            ProviderError::PermissionDenied(msg) => SyncError::PermissionDenied(msg),
            ProviderError::Unavailable(msg) => SyncError::AddressUnavailable(msg),
        }
    }
}

impl From<TransferError> for SyncError {
    fn from(err: TransferError) -> Self {
        if err.is_connectivity() {
            SyncError::Connectivity(err.to_string())
        } else {
            SyncError::TransferFailed(err.to_string())
        }
    }
}
