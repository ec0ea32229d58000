//! Instance lifecycle provider
//!
//! The resolver only needs two calls: describe the instance, and ask it to
//! start. [`AwsCliProvider`] implements them on top of the `aws` CLI.

use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::config::{AddressKind, InstanceConfig};

/// Errors reported by an instance provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The instance does not exist
    #[error("{0}")]
    NotFound(String),

    /// Credentials are missing or lack permissions
    #[error("{0}")]
    PermissionDenied(String),

    /// Throttling, network trouble, or any other transient failure
    #[error("{0}")]
    Unavailable(String),
}

/// Instance power state as observed from the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Pending,
    Running,
    Stopping,
    Stopped,
    /// `shutting-down` or `terminated`
    Terminated,
}

impl PowerState {
    /// Parse an EC2 state name
    pub fn from_ec2_name(name: &str) -> Self {
        match name {
            "running" => PowerState::Running,
            "stopping" => PowerState::Stopping,
            "stopped" => PowerState::Stopped,
            "shutting-down" | "terminated" => PowerState::Terminated,
            "pending" => PowerState::Pending,
            other => {
                tracing::warn!("Unknown instance state '{}', treating as pending", other);
                PowerState::Pending
            }
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::Pending => "pending",
            PowerState::Running => "running",
            PowerState::Stopping => "stopping",
            PowerState::Stopped => "stopped",
            PowerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Snapshot of one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub power_state: PowerState,
    /// Address to connect to, when one is assigned
    pub address: Option<String>,
    pub instance_type: Option<String>,
}

/// Describes and starts the remote instance
#[async_trait]
pub trait InstanceProvider: Send + Sync + 'static {
    /// Current state of the configured instance
    async fn describe(&self) -> Result<InstanceDescription, ProviderError>;

    /// Request that the instance start
    async fn start(&self, instance_id: &str) -> Result<(), ProviderError>;
}

/// Provider backed by the `aws` command-line tool
#[derive(Debug, Clone)]
pub struct AwsCliProvider {
    instance_id: Option<String>,
    instance_name: Option<String>,
    region: String,
    profile: String,
    address: AddressKind,
}

impl AwsCliProvider {
    pub fn new(config: &InstanceConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            instance_name: config.instance_name.clone(),
            region: config.region.clone(),
            profile: config.profile.clone(),
            address: config.address,
        }
    }

    /// Run `aws ec2 <args>` and return stdout
    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, ProviderError> {
        let output = Command::new("aws")
            .arg("ec2")
            .args(args)
            .args(["--region", self.region.as_str(), "--profile", self.profile.as_str()])
            .args(["--output", "json"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("failed to run aws CLI: {}", e)))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_stderr(stderr.trim()))
        }
    }

    fn select_address(&self, instance: &AwsInstance) -> Option<String> {
        let address = match self.address {
            AddressKind::Public => instance.public_ip_address.clone(),
            AddressKind::Private => instance.private_ip_address.clone(),
        };
        address.filter(|a| !a.is_empty())
    }
}

#[async_trait]
impl InstanceProvider for AwsCliProvider {
    async fn describe(&self) -> Result<InstanceDescription, ProviderError> {
        let stdout = match (&self.instance_id, &self.instance_name) {
            (Some(id), _) => {
                self.run(&["describe-instances", "--instance-ids", id.as_str()])
                    .await?
            }
            (None, Some(name)) => {
                let name_filter = format!("Name=tag:Name,Values={}", name);
                self.run(&[
                    "describe-instances",
                    "--filters",
                    name_filter.as_str(),
                    "Name=instance-state-name,Values=pending,running,stopping,stopped",
                ])
                .await?
            }
            (None, None) => {
                return Err(ProviderError::NotFound(
                    "no instance_id or instance_name configured".to_string(),
                ))
            }
        };

        let parsed: DescribeOutput = serde_json::from_slice(&stdout).map_err(|e| {
            ProviderError::Unavailable(format!("unexpected describe-instances output: {}", e))
        })?;

        let mut instances = parsed.reservations.into_iter().flat_map(|r| r.instances);
        let Some(instance) = instances.next() else {
            let target = self
                .instance_id
                .clone()
                .or_else(|| self.instance_name.as_ref().map(|n| format!("Name={}", n)))
                .unwrap_or_default();
            return Err(ProviderError::NotFound(format!("no instance matches {}", target)));
        };
        if instances.next().is_some() {
            tracing::warn!("Multiple instances match; using {}", instance.instance_id);
        }

        Ok(InstanceDescription {
            power_state: PowerState::from_ec2_name(&instance.state.name),
            address: self.select_address(&instance),
            instance_type: instance.instance_type.clone(),
            instance_id: instance.instance_id,
        })
    }

    async fn start(&self, instance_id: &str) -> Result<(), ProviderError> {
        self.run(&["start-instances", "--instance-ids", instance_id])
            .await
            .map(|_| ())
    }
}

/// Map aws CLI error output onto the provider taxonomy
fn classify_stderr(stderr: &str) -> ProviderError {
    const NOT_FOUND: &[&str] = &["InvalidInstanceID.NotFound", "InvalidInstanceID.Malformed"];
    const DENIED: &[&str] = &[
        "UnauthorizedOperation",
        "AuthFailure",
        "Unable to locate credentials",
        "InvalidClientTokenId",
        "ExpiredToken",
        "The config profile",
    ];

    let message = if stderr.is_empty() {
        "aws CLI failed without output".to_string()
    } else {
        stderr.to_string()
    };

    if NOT_FOUND.iter().any(|m| stderr.contains(m)) {
        ProviderError::NotFound(message)
    } else if DENIED.iter().any(|m| stderr.contains(m)) {
        ProviderError::PermissionDenied(message)
    } else {
        ProviderError::Unavailable(message)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<AwsInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsInstance {
    instance_id: String,
    state: AwsState,
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
    instance_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsState {
    name: String,
}
