//! Conflict resolution
//!
//! A pure decision function over a (local, remote) state pair. It never
//! touches the filesystem or the network.

use crate::models::{ConflictDecision, ConflictStrategy, FileState, ReasonCode, SyncAction};

/// Decide what to do with one path
///
/// One-sided presence always copies toward the missing side. The strategy
/// only applies when both sides exist and differ. Equal mtimes with different
/// sizes are flagged under every strategy.
pub fn decide(local: &FileState, remote: &FileState, strategy: ConflictStrategy) -> ConflictDecision {
    let path = if local.path.is_empty() {
        remote.path.clone()
    } else {
        local.path.clone()
    };

    let (action, reason) = classify(local, remote, strategy);
    ConflictDecision {
        path,
        action,
        reason,
    }
}

fn classify(
    local: &FileState,
    remote: &FileState,
    strategy: ConflictStrategy,
) -> (SyncAction, ReasonCode) {
    match (local.exists, remote.exists) {
        (false, false) => return (SyncAction::Skip, ReasonCode::BothAbsent),
        (true, false) => return (SyncAction::CopyToRemote, ReasonCode::LocalOnly),
        (false, true) => return (SyncAction::CopyToLocal, ReasonCode::RemoteOnly),
        (true, true) => {}
    }

    if local.mtime == remote.mtime {
        return if local.size == remote.size {
            (SyncAction::Skip, ReasonCode::InSync)
        } else {
            (SyncAction::FlagManual, ReasonCode::SizeMismatchSameMtime)
        };
    }

    match strategy {
        ConflictStrategy::Newer if local.mtime > remote.mtime => {
            (SyncAction::CopyToRemote, ReasonCode::LocalNewer)
        }
        ConflictStrategy::Newer => (SyncAction::CopyToLocal, ReasonCode::RemoteNewer),
        ConflictStrategy::Local => (SyncAction::CopyToRemote, ReasonCode::LocalPreferred),
        ConflictStrategy::Remote => (SyncAction::CopyToLocal, ReasonCode::RemotePreferred),
        ConflictStrategy::Manual => (SyncAction::FlagManual, ReasonCode::ManualStrategy),
    }
}
