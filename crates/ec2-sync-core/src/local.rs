//! Local tree walk and stat

use std::path::{Component, Path};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::filter::IgnoreMatcher;
use crate::models::FileState;

/// List every non-ignored file under `root`
///
/// A missing root yields an empty list. Unreadable entries are skipped with
/// a warning.
pub async fn scan(root: &Path, matcher: &IgnoreMatcher) -> Result<Vec<FileState>, SyncError> {
    let root = root.to_path_buf();
    let matcher = matcher.clone();
    tokio::task::spawn_blocking(move || scan_blocking(&root, &matcher))
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))
}

fn scan_blocking(root: &Path, matcher: &IgnoreMatcher) -> Vec<FileState> {
    if !root.is_dir() {
        tracing::debug!("Local root {} does not exist yet", root.display());
        return Vec::new();
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        // Skip hidden directories without descending into them
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    let mut states = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        if matcher.should_ignore(&rel, false) {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => {
                let mtime = mtime_secs(meta.modified().ok());
                states.push(FileState::present(rel, meta.len(), mtime));
            }
            Err(e) => tracing::warn!("Cannot stat {}: {}", entry.path().display(), e),
        }
    }
    states.sort_by(|a, b| a.path.cmp(&b.path));
    states
}

/// Stat one relative path
///
/// Directories and anything that cannot be read count as absent.
pub async fn local_state(root: &Path, rel: &str) -> FileState {
    match tokio::fs::metadata(root.join(rel)).await {
        Ok(meta) if meta.is_file() => {
            FileState::present(rel, meta.len(), mtime_secs(meta.modified().ok()))
        }
        _ => FileState::absent(rel),
    }
}

/// `/`-separated path of `path` relative to `root`
///
/// Returns `None` for paths outside the root and for the root itself.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(s) => segments.push(s.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Modification time in whole seconds since the Unix epoch
fn mtime_secs(modified: Option<SystemTime>) -> i64 {
    modified
        .map(|t| DateTime::<Utc>::from(t).timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IgnoreRules;
    use crate::filter::RulePrecedence;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_scan_respects_ignore_rules() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "src/main.rs", "fn main() {}");
        write(root, "src/.cache/blob", "x");
        write(root, ".env", "SECRET=1");
        write(root, "debug.log", "noise");
        write(root, "node_modules/pkg/index.js", "x");

        let matcher = IgnoreMatcher::new(
            &IgnoreRules::default(),
            &[],
            &[],
            RulePrecedence::IncludeWins,
        );
        let states = scan(root, &matcher).await.unwrap();
        let paths: Vec<&str> = states.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.rs"]);
        assert_eq!(states[0].size, 12);
        assert!(states[0].mtime > 0);
    }

    #[tokio::test]
    async fn test_scan_missing_root_is_empty() {
        let root = Path::new("/nonexistent/ec2-sync-root");
        let states = scan(root, &IgnoreMatcher::implicit_only()).await.unwrap();
        assert!(states.is_empty());
    }

    #[tokio::test]
    async fn test_local_state() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "a/b.txt", "hello");

        let state = local_state(temp_dir.path(), "a/b.txt").await;
        assert!(state.exists);
        assert_eq!(state.size, 5);

        assert!(!local_state(temp_dir.path(), "a/missing.txt").await.exists);
        // Directories are not sync units
        assert!(!local_state(temp_dir.path(), "a").await.exists);
    }

    #[test]
    fn test_relative_path() {
        let root = PathBuf::from("/home/me/app");
        assert_eq!(
            relative_path(&root, Path::new("/home/me/app/src/lib.rs")).as_deref(),
            Some("src/lib.rs")
        );
        assert_eq!(relative_path(&root, Path::new("/home/me/app")), None);
        assert_eq!(relative_path(&root, Path::new("/home/me/other/x")), None);
    }
}
