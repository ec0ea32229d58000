//! Change aggregation
//!
//! - `watcher`: filesystem notifications to [`ChangeEvent`](crate::models::ChangeEvent)s
//! - `batcher`: debounce, coalescing and rate limiting per mapping
//! - `task`: the watch loop that turns closed batches into sync cycles

pub mod batcher;
pub mod task;
pub mod watcher;

pub use batcher::{Batcher, WatchSettings};
pub use task::{
    spawn_watch_task, start_watching, WatchCommand, WatchHandle, WatchOptions, WatchStatus,
    WatchTaskEvent,
};
pub use watcher::{FsWatcher, MappingRoots};
