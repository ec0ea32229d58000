//! Ignore matcher
//!
//! Decides whether a path relative to a mapping root takes part in sync.
//! Rules are evaluated in order and the first match wins:
//!
//! 1. Directory events are always ignored; directories are never sync units.
//! 2. Any segment starting with `.` hides the whole path, whatever the
//!    include rules say.
//! 3. Gitignore-style rules from the config and from ignore files. A `!`
//!    negation re-admits a path outright. Otherwise include and exclude
//!    matches are combined according to [`RulePrecedence`]. No matching rule
//!    means allow.
//!
//! Malformed patterns are logged and never match, so a bad rule can only
//! let files through, never drop them.

use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;
use serde::{Deserialize, Serialize};

use crate::config::{DirectoryMapping, IgnoreRules};

/// Per-directory ignore file names, lowest priority first
const IGNORE_FILE_NAMES: &[&str] = &[".gitignore", ".ec2syncignore"];

/// Which rule list wins when include and exclude both match a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RulePrecedence {
    /// An include match re-admits an excluded path
    #[default]
    IncludeWins,
    /// An exclude match always hides the path
    ExcludeWins,
}

/// The rule that produced an ignore decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IgnoreRule {
    Directory,
    Hidden,
    Excluded,
    Included,
    Default,
}

/// One evaluated path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreDecision {
    pub path: String,
    pub ignored: bool,
    pub rule: IgnoreRule,
}

/// Compiled ignore rules for one mapping
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    include: Gitignore,
    exclude: Gitignore,
    precedence: RulePrecedence,
}

impl IgnoreMatcher {
    /// Compile global rules together with mapping-specific ones
    pub fn new(
        global: &IgnoreRules,
        mapping_include: &[String],
        mapping_exclude: &[String],
        precedence: RulePrecedence,
    ) -> Self {
        Self::build(
            Path::new(""),
            global,
            mapping_include,
            mapping_exclude,
            &[],
            precedence,
        )
    }

    /// Matcher for a configured mapping, including its ignore files
    pub fn for_mapping(
        global: &IgnoreRules,
        mapping: &DirectoryMapping,
        precedence: RulePrecedence,
    ) -> Self {
        let files = if global.ignore_files {
            ignore_files(&mapping.local_path)
        } else {
            Vec::new()
        };
        Self::build(
            &mapping.local_path,
            global,
            &mapping.include,
            &mapping.exclude,
            &files,
            precedence,
        )
    }

    /// Matcher with no glob rules; only the implicit rules apply
    pub fn implicit_only() -> Self {
        Self {
            include: Gitignore::empty(),
            exclude: Gitignore::empty(),
            precedence: RulePrecedence::default(),
        }
    }

    fn build(
        root: &Path,
        global: &IgnoreRules,
        mapping_include: &[String],
        mapping_exclude: &[String],
        files: &[PathBuf],
        precedence: RulePrecedence,
    ) -> Self {
        let mut include = GitignoreBuilder::new(root);
        add_lines(&mut include, global.include.iter().chain(mapping_include));

        // Later rules override earlier ones, so files come after the config
        let mut exclude = GitignoreBuilder::new(root);
        add_lines(&mut exclude, global.exclude.iter().chain(mapping_exclude));
        for file in files {
            if let Some(e) = exclude.add(file) {
                tracing::warn!("Problem reading ignore file {}: {}", file.display(), e);
            }
        }

        Self {
            include: finish(include),
            exclude: finish(exclude),
            precedence,
        }
    }

    /// Evaluate a `/`-separated path relative to the mapping root
    pub fn evaluate(&self, path: &str, is_dir: bool) -> IgnoreDecision {
        let path = normalize(path);
        let rule = self.classify(path, is_dir);
        let ignored = matches!(
            rule,
            IgnoreRule::Directory | IgnoreRule::Hidden | IgnoreRule::Excluded
        );
        tracing::trace!(path, ignored, ?rule, "ignore decision");
        IgnoreDecision {
            path: path.to_string(),
            ignored,
            rule,
        }
    }

    /// Whether the path should be left out of sync
    pub fn should_ignore(&self, path: &str, is_dir: bool) -> bool {
        self.evaluate(path, is_dir).ignored
    }

    fn classify(&self, path: &str, is_dir: bool) -> IgnoreRule {
        if is_dir {
            return IgnoreRule::Directory;
        }
        if is_hidden(path) {
            return IgnoreRule::Hidden;
        }
        if path.is_empty() {
            return IgnoreRule::Default;
        }

        let included = self
            .include
            .matched_path_or_any_parents(path, false)
            .is_ignore();
        let excluded = match self.exclude.matched_path_or_any_parents(path, false) {
            Match::Whitelist(_) => return IgnoreRule::Included,
            Match::Ignore(_) => true,
            Match::None => false,
        };
        match (self.precedence, included, excluded) {
            (RulePrecedence::IncludeWins, true, _) => IgnoreRule::Included,
            (RulePrecedence::ExcludeWins, _, true) => IgnoreRule::Excluded,
            (_, true, false) => IgnoreRule::Included,
            (_, false, true) => IgnoreRule::Excluded,
            _ => IgnoreRule::Default,
        }
    }
}

/// Ignore files that apply to a mapping root, lowest priority first
///
/// `~/.ec2syncignore` comes first, then `.gitignore` and `.ec2syncignore`
/// at the root. Files that do not exist are left out.
pub fn ignore_files(root: &Path) -> Vec<PathBuf> {
    let home = dirs::home_dir().map(|home| home.join(".ec2syncignore"));
    home.into_iter()
        .chain(IGNORE_FILE_NAMES.iter().map(|name| root.join(name)))
        .filter(|path| path.is_file())
        .collect()
}

/// Whether any segment of the path starts with a dot
fn is_hidden(path: &str) -> bool {
    path.split('/').any(|segment| segment.starts_with('.'))
}

fn normalize(path: &str) -> &str {
    let mut path = path;
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_start_matches('/')
}

fn add_lines<'a>(builder: &mut GitignoreBuilder, patterns: impl IntoIterator<Item = &'a String>) {
    for pattern in patterns {
        if let Err(e) = builder.add_line(None, pattern) {
            tracing::warn!("Skipping invalid ignore pattern '{}': {}", pattern, e);
        }
    }
}

fn finish(builder: GitignoreBuilder) -> Gitignore {
    builder.build().unwrap_or_else(|e| {
        tracing::warn!("Failed to compile ignore patterns: {}", e);
        Gitignore::empty()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn rules(exclude: &[&str], include: &[&str]) -> IgnoreRules {
        IgnoreRules {
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            include: include.iter().map(|s| s.to_string()).collect(),
            ignore_files: false,
        }
    }

    fn matcher(exclude: &[&str], include: &[&str]) -> IgnoreMatcher {
        IgnoreMatcher::new(&rules(exclude, include), &[], &[], RulePrecedence::IncludeWins)
    }

    #[test]
    fn test_directories_always_ignored() {
        let m = matcher(&[], &["**"]);
        let decision = m.evaluate("src", true);
        assert!(decision.ignored);
        assert_eq!(decision.rule, IgnoreRule::Directory);
    }

    #[test]
    fn test_hidden_segments_ignored_anywhere() {
        let m = matcher(&[], &[]);
        assert!(m.should_ignore(".env", false));
        assert!(m.should_ignore("src/.git/config", false));
        assert!(m.should_ignore("notes/.todo.md.swp", false));
        assert!(!m.should_ignore("src/main.rs", false));
    }

    #[test]
    fn test_hidden_beats_include() {
        let m = matcher(&[], &["**/.env", ".github/"]);
        assert_eq!(m.evaluate(".env", false).rule, IgnoreRule::Hidden);
        assert!(m.should_ignore(".github/workflows/ci.yml", false));
    }

    #[test]
    fn test_basename_pattern_matches_any_depth() {
        let m = matcher(&["*.log"], &[]);
        assert!(m.should_ignore("app.log", false));
        assert!(m.should_ignore("var/log/app.log", false));
        assert!(!m.should_ignore("app.log.txt", false));
    }

    #[test]
    fn test_directory_pattern_matches_contents() {
        let m = matcher(&["node_modules/", "__pycache__/"], &[]);
        assert!(m.should_ignore("node_modules/left-pad/index.js", false));
        assert!(m.should_ignore("web/node_modules/x.js", false));
        assert!(m.should_ignore("pkg/__pycache__/mod.cpython-311.pyc", false));
        // A file named like the directory is not matched
        assert!(!m.should_ignore("node_modules", false));
    }

    #[test]
    fn test_anchored_patterns() {
        let m = matcher(&["/build", "docs/generated/*.html"], &[]);
        assert!(m.should_ignore("build/out.bin", false));
        assert!(!m.should_ignore("src/build/out.bin", false));
        assert!(m.should_ignore("docs/generated/index.html", false));
        assert!(!m.should_ignore("docs/generated/deep/index.html", false));
    }

    #[test]
    fn test_include_wins_by_default() {
        let m = matcher(&["*.log"], &["keep.log"]);
        let decision = m.evaluate("logs/keep.log", false);
        assert!(!decision.ignored);
        assert_eq!(decision.rule, IgnoreRule::Included);
        assert!(m.should_ignore("logs/other.log", false));
    }

    #[test]
    fn test_exclude_wins_when_configured() {
        let m = IgnoreMatcher::new(
            &rules(&["*.log"], &["keep.log"]),
            &[],
            &[],
            RulePrecedence::ExcludeWins,
        );
        assert_eq!(m.evaluate("keep.log", false).rule, IgnoreRule::Excluded);
    }

    #[test]
    fn test_negation_readmits_path() {
        let m = IgnoreMatcher::new(
            &rules(&["*.log", "!audit.log"], &[]),
            &[],
            &[],
            RulePrecedence::ExcludeWins,
        );
        let decision = m.evaluate("var/audit.log", false);
        assert!(!decision.ignored);
        assert_eq!(decision.rule, IgnoreRule::Included);
        assert!(m.should_ignore("var/app.log", false));
    }

    #[test]
    fn test_later_pattern_overrides_negation() {
        let m = matcher(&["!audit.log", "*.log"], &[]);
        assert!(m.should_ignore("audit.log", false));
    }

    #[test]
    fn test_no_rules_default_allow() {
        let m = matcher(&["*.tmp"], &[]);
        let decision = m.evaluate("README.md", false);
        assert!(!decision.ignored);
        assert_eq!(decision.rule, IgnoreRule::Default);
    }

    #[test]
    fn test_mapping_rules_combine_with_global() {
        let mut mapping = DirectoryMapping::new("web", "/tmp/web", "/srv/web");
        mapping.exclude = vec!["dist/".into()];
        let m = IgnoreMatcher::for_mapping(
            &rules(&["*.tmp"], &[]),
            &mapping,
            RulePrecedence::IncludeWins,
        );
        assert!(m.should_ignore("dist/bundle.js", false));
        assert!(m.should_ignore("scratch.tmp", false));
        assert!(!m.should_ignore("src/app.ts", false));
    }

    #[test]
    fn test_ignore_files_loaded_from_mapping_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join(".gitignore"), "*.bak\ncoverage/\n").unwrap();
        fs::write(root.join(".ec2syncignore"), "# local rules\nsecrets/\n!important.bak\n")
            .unwrap();

        let mapping = DirectoryMapping::new("app", root.to_str().unwrap(), "/srv/app");
        let mut global = rules(&["*.tmp"], &[]);
        global.ignore_files = true;
        let m = IgnoreMatcher::for_mapping(&global, &mapping, RulePrecedence::IncludeWins);

        assert!(m.should_ignore("old.bak", false));
        assert!(m.should_ignore("coverage/index.html", false));
        assert!(m.should_ignore("secrets/key.pem", false));
        assert!(m.should_ignore("scratch.tmp", false));
        assert_eq!(m.evaluate("important.bak", false).rule, IgnoreRule::Included);
        assert!(!m.should_ignore("src/main.rs", false));
    }

    #[test]
    fn test_ignore_files_can_be_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join(".gitignore"), "*.bak\n").unwrap();

        let mapping = DirectoryMapping::new("app", root.to_str().unwrap(), "/srv/app");
        let m = IgnoreMatcher::for_mapping(&rules(&[], &[]), &mapping, RulePrecedence::IncludeWins);
        assert!(!m.should_ignore("old.bak", false));
    }

    #[test]
    fn test_ignore_files_order() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join(".ec2syncignore"), "*.bak\n").unwrap();
        fs::write(root.join(".gitignore"), "*.bak\n").unwrap();

        let files = ignore_files(root);
        let n = files.len();
        assert!(n >= 2);
        assert_eq!(files[n - 2], root.join(".gitignore"));
        assert_eq!(files[n - 1], root.join(".ec2syncignore"));
    }

    #[test]
    fn test_malformed_pattern_fails_open() {
        let m = matcher(&["[unclosed", "*.bak"], &[]);
        assert!(!m.should_ignore("[unclosed", false));
        assert!(!m.should_ignore("data.csv", false));
        // Valid patterns alongside still apply
        assert!(m.should_ignore("data.bak", false));
    }

    #[test]
    fn test_malformed_input_never_panics() {
        let m = matcher(&["*.log"], &[]);
        assert!(!m.should_ignore("", false));
        assert!(!m.should_ignore("//", false));
        assert!(!m.should_ignore("./src/main.rs", false));
        assert!(m.should_ignore("./x.log", false));
    }

    #[test]
    fn test_comment_and_blank_patterns_skipped() {
        let m = matcher(&["# comment", "   ", ""], &[]);
        assert!(!m.should_ignore("# comment", false));
        assert_eq!(m.evaluate("notes.txt", false).rule, IgnoreRule::Default);
    }
}
