//! Filesystem notification source
//!
//! Wraps a recursive `notify` watcher over every enabled mapping root and
//! turns raw notifications into [`ChangeEvent`]s tagged with their mapping.

use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::SyncError;
use crate::models::{ChangeEvent, ChangeKind};

/// Mapping roots, matched longest first
#[derive(Debug, Clone, Default)]
pub struct MappingRoots {
    roots: Vec<(String, PathBuf)>,
}

impl MappingRoots {
    pub fn new(roots: impl IntoIterator<Item = (String, PathBuf)>) -> Self {
        let mut roots: Vec<_> = roots.into_iter().collect();
        // Nested roots: the innermost one owns the path
        roots.sort_by(|a, b| b.1.components().count().cmp(&a.1.components().count()));
        Self { roots }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .enabled_mappings()
                .map(|m| (m.name.clone(), m.local_path.clone())),
        )
    }

    /// Mapping whose root contains `path`
    pub fn mapping_for(&self, path: &Path) -> Option<&str> {
        self.roots
            .iter()
            .find(|(_, root)| path.starts_with(root) && path != root)
            .map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.roots.iter().map(|(n, r)| (n.as_str(), r.as_path()))
    }
}

/// Keeps the OS watcher alive; dropping it stops notifications
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    roots: MappingRoots,
}

impl FsWatcher {
    /// Watch every root, sending translated events on `tx`
    ///
    /// Missing roots are created first so a fresh mapping can be watched.
    pub fn start(roots: MappingRoots, tx: mpsc::Sender<ChangeEvent>) -> Result<Self, SyncError> {
        let callback_roots = roots.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for change in translate(&event, &callback_roots) {
                        if tx.blocking_send(change).is_err() {
                            tracing::debug!("Change receiver dropped, discarding event");
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!("Filesystem watch error: {}", e),
            },
            notify::Config::default(),
        )
        .map_err(notify_error)?;

        for (name, root) in roots.iter() {
            std::fs::create_dir_all(root)?;
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(notify_error)?;
            tracing::info!(mapping = name, "Watching {}", root.display());
        }

        Ok(Self {
            _watcher: watcher,
            roots,
        })
    }

    pub fn roots(&self) -> &MappingRoots {
        &self.roots
    }
}

fn notify_error(e: notify::Error) -> SyncError {
    SyncError::Io(std::io::Error::other(e))
}

/// Translate one notification into change events
///
/// Paths outside every root are dropped. A rename becomes a delete of the old
/// path and a create of the new one.
pub fn translate(event: &Event, roots: &MappingRoots) -> Vec<ChangeEvent> {
    let mut changes = Vec::new();
    let mut push = |path: &Path, kind: ChangeKind, is_dir: bool| {
        if let Some(mapping) = roots.mapping_for(path) {
            let event = ChangeEvent::new(mapping, path, kind);
            changes.push(if is_dir { event.directory() } else { event });
        }
    };

    match &event.kind {
        EventKind::Create(kind) => {
            for path in &event.paths {
                let is_dir = match kind {
                    CreateKind::Folder => true,
                    CreateKind::File => false,
                    _ => path.is_dir(),
                };
                push(path, ChangeKind::Created, is_dir);
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
            (RenameMode::Both, [from, to]) => {
                push(from, ChangeKind::Deleted, false);
                push(to, ChangeKind::Created, to.is_dir());
            }
            (RenameMode::From, paths) => {
                for path in paths {
                    push(path, ChangeKind::Deleted, false);
                }
            }
            (RenameMode::To, paths) => {
                for path in paths {
                    push(path, ChangeKind::Created, path.is_dir());
                }
            }
            (_, paths) => {
                for path in paths {
                    if path.exists() {
                        push(path, ChangeKind::Created, path.is_dir());
                    } else {
                        push(path, ChangeKind::Deleted, false);
                    }
                }
            }
        },
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Metadata(_) | ModifyKind::Any) => {
            for path in &event.paths {
                push(path, ChangeKind::Modified, false);
            }
        }
        EventKind::Remove(kind) => {
            for path in &event.paths {
                push(path, ChangeKind::Deleted, matches!(kind, RemoveKind::Folder));
            }
        }
        _ => {}
    }

    changes
}
