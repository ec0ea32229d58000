//! ec2-sync Core Library
//!
//! This crate provides the core functionality for ec2-sync, which keeps local
//! directories in sync with a remote EC2 instance whose address changes every
//! time it starts.
//!
//! # Architecture
//!
//! - **Endpoint resolver**: the only owner of the instance address; starts the
//!   instance on demand and hands out generation-tagged endpoints
//! - **Change aggregator**: turns filesystem notifications into debounced,
//!   rate-limited batches per mapping
//! - **Orchestrator**: resolves, diffs, decides and transfers, one cycle at a
//!   time, isolating failures per mapping
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load(None)?;
//! let provider = Arc::new(AwsCliProvider::new(&config.instance));
//! let resolver = Arc::new(EndpointResolver::new(
//!     provider,
//!     ResolverSettings::from(&config.instance),
//!     RetryPolicy::from(&config.retry),
//! ));
//! let transport = Arc::new(RsyncTransport::from_config(&config));
//! let orchestrator = SyncOrchestrator::new(config, resolver, transport)?;
//!
//! let result = orchestrator
//!     .run_cycle(CycleRequest::full(SyncDirection::Bidirectional), &CancellationToken::new())
//!     .await;
//! ```
//!
//! # Modules
//!
//! - `orchestrator`: sync cycles (main entry point)
//! - `aggregator`: filesystem watching, batching and the watch loop
//! - `endpoint`: instance lifecycle provider and endpoint resolver
//! - `transfer`: rsync/ssh transport
//! - `conflict`: per-file decisions
//! - `filter`: include/exclude rules and ignore files
//! - `config`: application configuration

pub mod aggregator;
pub mod config;
pub mod conflict;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod local;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod status;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{Batcher, WatchCommand, WatchHandle, WatchOptions, WatchTaskEvent};
pub use config::{Config, ConfigError, DirectoryMapping};
pub use endpoint::{AwsCliProvider, Endpoint, EndpointResolver, InstanceProvider, ResolverSettings};
pub use error::SyncError;
pub use filter::{IgnoreMatcher, RulePrecedence};
pub use models::{
    ChangeEvent, ChangeKind, ConflictDecision, ConflictStrategy, FileState, MappingResult,
    SyncAction, SyncBatch, SyncDirection, SyncResult,
};
pub use orchestrator::{CycleRequest, CycleScope, SyncOrchestrator};
pub use retry::RetryPolicy;
pub use status::{ConnectivityReport, SyncStatus};
pub use transfer::{RsyncTransport, Transport};
