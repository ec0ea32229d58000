//! Debounce and batching state machine
//!
//! Pure: every method takes the current instant, so timing behaviour can be
//! driven by a simulated clock. The watch loop owns one [`Batcher`].
//!
//! A mapping's open batch closes once
//! - the debounce window passed with no new event, or
//! - it has been open for the maximum coalescing window, or
//! - it reached the batch-size cap,
//!
//! and, in every case, the minimum interval since that mapping's previous
//! trigger has elapsed and no sync for the mapping is still in flight.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::{Config, WatchConfig};
use crate::filter::IgnoreMatcher;
use crate::local::relative_path;
use crate::models::{ChangeEvent, SyncBatch};

/// Timing rules for closing batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSettings {
    /// Debounce window
    pub delay: Duration,
    /// Minimum time between two triggers of one mapping
    pub min_interval: Duration,
    /// Maximum time a batch may stay open
    pub max_batch_window: Duration,
    /// Close as soon as this many distinct paths are pending
    pub batch_size: Option<usize>,
}

impl From<&WatchConfig> for WatchSettings {
    fn from(config: &WatchConfig) -> Self {
        Self {
            delay: Duration::from_secs(config.delay_secs),
            min_interval: Duration::from_secs(config.min_interval_secs),
            max_batch_window: Duration::from_secs(config.max_batch_secs),
            batch_size: (config.batch_size > 0).then_some(config.batch_size),
        }
    }
}

#[derive(Debug)]
struct OpenBatch {
    paths: BTreeSet<String>,
    opened_at: Instant,
    last_event: Instant,
}

#[derive(Debug)]
struct Slot {
    root: PathBuf,
    matcher: IgnoreMatcher,
    open: Option<OpenBatch>,
    last_trigger: Option<Instant>,
    in_flight: bool,
}

/// Per-mapping batch accumulator
#[derive(Debug)]
pub struct Batcher {
    settings: WatchSettings,
    slots: BTreeMap<String, Slot>,
}

impl Batcher {
    pub fn new(settings: WatchSettings) -> Self {
        Self {
            settings,
            slots: BTreeMap::new(),
        }
    }

    /// Batcher for every enabled mapping in the configuration
    pub fn from_config(config: &Config) -> Self {
        let mut batcher = Self::new(WatchSettings::from(&config.watch));
        for mapping in config.enabled_mappings() {
            let matcher =
                IgnoreMatcher::for_mapping(&config.ignore, mapping, config.rule_precedence);
            batcher.add_mapping(&mapping.name, mapping.local_path.clone(), matcher);
        }
        batcher
    }

    pub fn add_mapping(&mut self, name: &str, root: PathBuf, matcher: IgnoreMatcher) {
        self.slots.insert(
            name.to_string(),
            Slot {
                root,
                matcher,
                open: None,
                last_trigger: None,
                in_flight: false,
            },
        );
    }

    /// Fold one event into its mapping's open batch
    ///
    /// Returns false when the event was dropped (unknown mapping, outside the
    /// root, or ignored).
    pub fn record(&mut self, event: &ChangeEvent, now: Instant) -> bool {
        let Some(slot) = self.slots.get_mut(&event.mapping) else {
            tracing::trace!("Dropping event for unknown mapping '{}'", event.mapping);
            return false;
        };
        let Some(rel) = relative_path(&slot.root, &event.path) else {
            tracing::trace!("Dropping event outside root: {}", event.path.display());
            return false;
        };
        if slot.matcher.should_ignore(&rel, event.is_dir) {
            return false;
        }

        let batch = slot.open.get_or_insert_with(|| OpenBatch {
            paths: BTreeSet::new(),
            opened_at: now,
            last_event: now,
        });
        batch.last_event = now;
        batch.paths.insert(rel);
        true
    }

    /// Put paths from a failed sync back into the mapping's open batch
    ///
    /// Paths are already relative and filtered. They close again under the
    /// usual debounce and cooldown rules. Returns how many were new.
    pub fn requeue<I>(&mut self, mapping: &str, paths: I, now: Instant) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let Some(slot) = self.slots.get_mut(mapping) else {
            return 0;
        };
        let mut paths = paths.into_iter().peekable();
        if paths.peek().is_none() {
            return 0;
        }

        let batch = slot.open.get_or_insert_with(|| OpenBatch {
            paths: BTreeSet::new(),
            opened_at: now,
            last_event: now,
        });
        batch.last_event = batch.last_event.max(now);
        let before = batch.paths.len();
        batch.paths.extend(paths);
        let added = batch.paths.len() - before;
        tracing::debug!(mapping, added, "Requeued paths after failed sync");
        added
    }

    /// Close and return every batch that is ready at `now`
    ///
    /// Each returned mapping is marked in flight until [`Batcher::complete`].
    pub fn take_ready(&mut self, now: Instant) -> Vec<SyncBatch> {
        let mut ready = Vec::new();
        for (name, slot) in self.slots.iter_mut() {
            let Some(ready_at) = ready_at(&self.settings, slot) else {
                continue;
            };
            if now < ready_at {
                continue;
            }
            let Some(open) = slot.open.take() else {
                continue;
            };
            slot.last_trigger = Some(now);
            slot.in_flight = true;
            tracing::debug!(mapping = %name, paths = open.paths.len(), "Batch closed");
            ready.push(SyncBatch {
                mapping: name.clone(),
                paths: open.paths,
                opened_at: open.opened_at,
                closed_at: now,
            });
        }
        ready
    }

    /// Earliest instant at which some batch may close
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter_map(|slot| ready_at(&self.settings, slot))
            .min()
    }

    /// Release a mapping after its triggered sync finished, failed or timed out
    pub fn complete(&mut self, mapping: &str) {
        if let Some(slot) = self.slots.get_mut(mapping) {
            slot.in_flight = false;
        }
    }

    /// Mark a mapping as synced by a cycle that no batch triggered
    pub fn mark_in_flight(&mut self, mapping: &str) {
        if let Some(slot) = self.slots.get_mut(mapping) {
            slot.in_flight = true;
        }
    }

    /// Distinct paths waiting in a mapping's open batch
    pub fn pending_paths(&self, mapping: &str) -> usize {
        self.slots
            .get(mapping)
            .and_then(|s| s.open.as_ref())
            .map_or(0, |b| b.paths.len())
    }

    /// Names of every tracked mapping
    pub fn mappings(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }
}

/// When the slot's open batch may close, if it has one and nothing is in flight
fn ready_at(settings: &WatchSettings, slot: &Slot) -> Option<Instant> {
    if slot.in_flight {
        return None;
    }
    let open = slot.open.as_ref()?;

    let size_hit = settings
        .batch_size
        .is_some_and(|cap| open.paths.len() >= cap);
    let eligible = if size_hit {
        open.opened_at
    } else {
        (open.last_event + settings.delay).min(open.opened_at + settings.max_batch_window)
    };

    Some(match slot.last_trigger {
        Some(last) => eligible.max(last + settings.min_interval),
        None => eligible,
    })
}
