//! Application configuration
//!
//! Configuration is loaded from:
//! 1. An explicit path (`--config`)
//! 2. `EC2SYNC_CONFIG`
//! 3. `./ec2-sync.toml`, then `~/.config/ec2-sync/config.toml`
//!
//! Environment variables (EC2SYNC_* prefix) take precedence over file values.
//! The engine treats a loaded configuration as an immutable snapshot; reloading
//! is the caller's job.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::RulePrecedence;
use crate::models::ConflictStrategy;

/// Environment variable prefix
const ENV_PREFIX: &str = "EC2SYNC";

/// File name searched for in the working directory
const LOCAL_CONFIG_FILE: &str = "ec2-sync.toml";

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No configuration file at the resolved location
    #[error("Configuration file not found: '{0}'")]
    NotFound(PathBuf),

    /// Failed to read the configuration file
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// TOML syntax or type error
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to write the configuration file
    #[error("Failed to write '{path}': {details}")]
    Write { path: PathBuf, details: String },

    /// One or more semantic validation errors
    #[error("{}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// A configured pairing of a local directory tree with a remote one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryMapping {
    /// Descriptive, unique name
    pub name: String,
    /// Local root directory
    pub local_path: PathBuf,
    /// Remote root directory on the instance
    pub remote_path: String,
    /// Whether this mapping takes part in sync
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Mapping-specific include globs
    #[serde(default)]
    pub include: Vec<String>,
    /// Mapping-specific exclude globs
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl DirectoryMapping {
    pub fn new(
        name: impl Into<String>,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            enabled: true,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// Which instance address to connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    #[default]
    Public,
    Private,
}

/// Remote instance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// EC2 instance ID
    pub instance_id: Option<String>,
    /// Value of the instance's `Name` tag (used when no ID is given)
    pub instance_name: Option<String>,
    pub region: String,
    pub profile: String,
    /// Start the instance when it is found stopped
    pub auto_start: bool,
    /// Maximum time to wait for the instance to reach `running`
    pub max_wait_secs: u64,
    /// Interval between state polls while waiting
    pub poll_interval_secs: u64,
    /// Bound on a single describe/start call
    pub call_timeout_secs: u64,
    pub address: AddressKind,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            instance_name: None,
            region: "us-east-1".to_string(),
            profile: "default".to_string(),
            auto_start: true,
            max_wait_secs: 600,
            poll_interval_secs: 10,
            call_timeout_secs: 30,
            address: AddressKind::Public,
        }
    }
}

impl InstanceConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Human-readable identifier for log messages
    pub fn label(&self) -> String {
        match (&self.instance_id, &self.instance_name) {
            (Some(id), _) => id.clone(),
            (None, Some(name)) => format!("Name={}", name),
            (None, None) => "(unset)".to_string(),
        }
    }
}

/// SSH connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    /// Private key; when unset, ssh falls back to its own defaults/agent
    pub key_file: Option<PathBuf>,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub strict_host_checking: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            key_file: None,
            port: 22,
            connect_timeout_secs: 10,
            strict_host_checking: false,
        }
    }
}

/// Transfer tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub compress: bool,
    pub partial: bool,
    /// KB/s, 0 for unlimited
    pub bandwidth_limit_kbps: u32,
    /// Bound on one transfer invocation
    pub timeout_secs: u64,
    /// Bound on one remote stat/listing call
    pub stat_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            compress: true,
            partial: true,
            bandwidth_limit_kbps: 0,
            timeout_secs: 3600,
            stat_timeout_secs: 60,
        }
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stat_timeout(&self) -> Duration {
        Duration::from_secs(self.stat_timeout_secs)
    }
}

/// Watch loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Debounce window
    pub delay_secs: u64,
    /// Minimum time between two triggered syncs of one mapping
    pub min_interval_secs: u64,
    /// Maximum time a batch may stay open under continuous writes
    pub max_batch_secs: u64,
    /// Close a batch as soon as it holds this many paths (0 disables)
    pub batch_size: usize,
    /// Run a full cycle when the watch loop starts
    pub initial_sync: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            delay_secs: 5,
            min_interval_secs: 30,
            max_batch_secs: 120,
            batch_size: 50,
            initial_sync: true,
        }
    }
}

/// Retry/backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Fraction of each delay randomized (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: 0.1,
        }
    }
}

/// Global ignore rules applied to every mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreRules {
    pub exclude: Vec<String>,
    pub include: Vec<String>,
    /// Also read `.gitignore`, `.ec2syncignore` and `~/.ec2syncignore`
    pub ignore_files: bool,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            exclude: [
                "*.log",
                "*.tmp",
                "__pycache__/",
                "*.pyc",
                "node_modules/",
                "*.swp",
                "*.swo",
                "Thumbs.db",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            include: Vec::new(),
            ignore_files: true,
        }
    }
}

/// What a targeted cycle reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileScope {
    /// Only the paths named by the batch
    #[default]
    Affected,
    /// The mapping's whole tree
    Full,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_project_name")]
    pub project_name: String,

    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    #[serde(default)]
    pub rule_precedence: RulePrecedence,

    #[serde(default)]
    pub reconcile: ReconcileScope,

    /// Mappings processed concurrently within one cycle
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Upper bound on one cycle in the watch loop
    #[serde(default = "default_cycle_timeout")]
    pub cycle_timeout_secs: u64,

    #[serde(default)]
    pub instance: InstanceConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub ignore: IgnoreRules,

    #[serde(default)]
    pub mappings: Vec<DirectoryMapping>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            conflict_strategy: ConflictStrategy::default(),
            rule_precedence: RulePrecedence::default(),
            reconcile: ReconcileScope::default(),
            max_concurrency: default_max_concurrency(),
            cycle_timeout_secs: default_cycle_timeout(),
            instance: InstanceConfig::default(),
            ssh: SshConfig::default(),
            transfer: TransferConfig::default(),
            watch: WatchConfig::default(),
            retry: RetryConfig::default(),
            ignore: IgnoreRules::default(),
            mappings: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration, honoring an optional explicit path
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (EC2SYNC_INSTANCE_ID, EC2SYNC_REGION, ...)
    /// 2. Config file (explicit path, EC2SYNC_CONFIG, or the search locations)
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = Self::config_file_path(explicit);
        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    ///
    /// Unlike defaults-only tools, a sync run needs mappings and an instance,
    /// so a missing file is an error.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.expand_paths();
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(toml_content)?;
        config.apply_env_overrides();
        config.expand_paths();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // EC2SYNC_INSTANCE_ID
        if let Ok(val) = std::env::var(format!("{}_INSTANCE_ID", ENV_PREFIX)) {
            self.instance.instance_id = if val.is_empty() { None } else { Some(val) };
        }

        // EC2SYNC_INSTANCE_NAME
        if let Ok(val) = std::env::var(format!("{}_INSTANCE_NAME", ENV_PREFIX)) {
            self.instance.instance_name = if val.is_empty() { None } else { Some(val) };
        }

        // EC2SYNC_REGION
        if let Ok(val) = std::env::var(format!("{}_REGION", ENV_PREFIX)) {
            if !val.is_empty() {
                self.instance.region = val;
            }
        }

        // EC2SYNC_PROFILE
        if let Ok(val) = std::env::var(format!("{}_PROFILE", ENV_PREFIX)) {
            if !val.is_empty() {
                self.instance.profile = val;
            }
        }

        // EC2SYNC_AUTO_START
        if let Ok(val) = std::env::var(format!("{}_AUTO_START", ENV_PREFIX)) {
            self.instance.auto_start = val.eq_ignore_ascii_case("true") || val == "1";
        }

        // EC2SYNC_CONFLICT_STRATEGY
        if let Ok(val) = std::env::var(format!("{}_CONFLICT_STRATEGY", ENV_PREFIX)) {
            match val.parse() {
                Ok(strategy) => self.conflict_strategy = strategy,
                Err(e) => tracing::warn!("Ignoring {}_CONFLICT_STRATEGY: {}", ENV_PREFIX, e),
            }
        }
    }

    /// Expand `~` in local paths and the SSH key
    fn expand_paths(&mut self) {
        for mapping in &mut self.mappings {
            mapping.local_path = expand_home(&mapping.local_path);
        }
        if let Some(key) = &self.ssh.key_file {
            self.ssh.key_file = Some(expand_home(key));
        }
    }

    /// Check semantic constraints, collecting every problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.instance.instance_id.is_none() && self.instance.instance_name.is_none() {
            errors.push("instance: either instance_id or instance_name must be set".to_string());
        }
        if !(60..=3600).contains(&self.instance.max_wait_secs) {
            errors.push("instance.max_wait_secs must be between 60 and 3600".to_string());
        }
        if self.instance.poll_interval_secs == 0 {
            errors.push("instance.poll_interval_secs must be greater than 0".to_string());
        }
        if self.ssh.port == 0 {
            errors.push("ssh.port must be between 1 and 65535".to_string());
        }
        if self.watch.delay_secs == 0 {
            errors.push("watch.delay_secs must be greater than 0".to_string());
        }
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.multiplier < 1.0 {
            errors.push("retry.multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            errors.push("retry.jitter must be between 0.0 and 1.0".to_string());
        }
        if self.max_concurrency == 0 {
            errors.push("max_concurrency must be at least 1".to_string());
        }

        if self.mappings.is_empty() {
            errors.push("at least one [[mappings]] entry must be provided".to_string());
        }
        let mut seen = HashSet::new();
        for (i, mapping) in self.mappings.iter().enumerate() {
            if mapping.name.trim().is_empty() {
                errors.push(format!("mappings[{}]: name must not be empty", i));
            } else if !seen.insert(mapping.name.as_str()) {
                errors.push(format!("mappings[{}]: duplicate name '{}'", i, mapping.name));
            }
            if mapping.local_path.as_os_str().is_empty() {
                errors.push(format!("mappings[{}]: local_path must not be empty", i));
            }
            if mapping.remote_path.trim().is_empty() {
                errors.push(format!("mappings[{}]: remote_path must not be empty", i));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Enabled mappings, in configuration order
    pub fn enabled_mappings(&self) -> impl Iterator<Item = &DirectoryMapping> {
        self.mappings.iter().filter(|m| m.enabled)
    }

    /// Find a mapping by name
    pub fn mapping(&self, name: &str) -> Option<&DirectoryMapping> {
        self.mappings.iter().find(|m| m.name == name)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    /// Save configuration to a file
    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |details: String| ConfigError::Write {
            path: path.to_path_buf(),
            details,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
            }
        }

        let content = toml::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| write_err(e.to_string()))
    }

    /// Resolve the config file path
    ///
    /// An explicit path wins, then EC2SYNC_CONFIG, then the first existing
    /// search location. When nothing exists, the user config location is
    /// returned so error messages point somewhere sensible.
    pub fn config_file_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return expand_home(path);
        }

        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return expand_home(Path::new(&path));
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return local;
        }

        user_config_path()
    }
}

/// Default per-user config location
fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ec2-sync")
        .join("config.toml")
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn default_true() -> bool {
    true
}

fn default_project_name() -> String {
    "ec2-sync".to_string()
}

fn default_max_concurrency() -> usize {
    4
}

fn default_cycle_timeout() -> u64 {
    1800
}
