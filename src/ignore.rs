//! Gitignore-style pattern matching for sync ignore rules, loaded from
//! `<sync_root>/.syncignore`. Symbolic links are always ignored regardless
//! of pattern match (sec 8 property 8).

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};

pub const SYNCIGNORE_FILE: &str = ".syncignore";

/// Patterns always applied, independent of `.syncignore` contents: VCS
/// metadata directories (and everything under them), OS artifacts, the
/// engine's own state directory, and common editor/office lock files.
const DEFAULT_PATTERNS: &[&str] = &[
    ".git",
    ".git/**",
    ".svn",
    ".svn/**",
    ".hg",
    ".hg/**",
    ".cryptosync",
    ".cryptosync/**",
    ".DS_Store",
    "Thumbs.db",
    "~*",
    ".~lock.*",
    "~*.tmp",
];

/// A wrapper around `GlobSet` for matching ignore patterns (gitignore-style).
///
/// The matcher stores the sync root path and automatically strips it from
/// absolute paths before matching against the patterns.
#[derive(Debug, Clone)]
pub struct IgnoreMatcher {
    globset: GlobSet,
    patterns: Vec<String>,
    sync_root: PathBuf,
}

impl IgnoreMatcher {
    /// Build an `IgnoreMatcher` from a list of gitignore-style patterns,
    /// plus the always-on defaults in [`DEFAULT_PATTERNS`].
    ///
    /// # Pattern syntax
    /// - `*.log` matches any file ending with `.log` anywhere in the tree.
    /// - `temp/` matches any directory named `temp` anywhere.
    /// - `/build` matches `build` only at the sync root level.
    /// - `docs/*.md` matches `.md` files in any `docs` directory.
    /// - `#comment` lines starting with `#` are treated as comments.
    pub fn new(patterns: &[String], sync_root: PathBuf) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() || pattern.starts_with('#') {
                continue;
            }
            builder.add(Self::compile(pattern)?);
        }

        for pattern in DEFAULT_PATTERNS {
            builder.add(Self::compile(pattern)?);
        }

        let globset = builder.build().context("failed to build ignore pattern matcher")?;

        Ok(Self {
            globset,
            patterns: patterns.to_vec(),
            sync_root,
        })
    }

    fn compile(pattern: &str) -> Result<Glob> {
        let glob_pattern = if pattern.contains('/') || pattern.contains('\\') {
            let normalized = pattern.replace('\\', "/");
            if let Some(stripped) = normalized.strip_prefix('/') {
                stripped.to_string()
            } else {
                format!("**/{normalized}")
            }
        } else {
            format!("**/{pattern}")
        };

        Glob::new(&glob_pattern).with_context(|| format!("invalid ignore pattern: {pattern}"))
    }

    /// Loads `<sync_root>/.syncignore` if present (missing file is not an
    /// error — it just means no user-supplied patterns).
    pub fn load(sync_root: PathBuf) -> Result<Self> {
        let syncignore_path = sync_root.join(SYNCIGNORE_FILE);
        let patterns = match std::fs::read_to_string(&syncignore_path) {
            Ok(content) => content.lines().map(|l| l.to_string()).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read {}", syncignore_path.display())
                });
            }
        };
        Self::new(&patterns, sync_root)
    }

    /// An absolute path is ignored if it matches a pattern or is a symlink.
    /// This is the entry point the watcher and scanner should use.
    pub fn is_ignored<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        if path.is_symlink() {
            return true;
        }
        self.is_match(path)
    }

    /// Check if an absolute path matches any of the ignore patterns (does
    /// not itself check for symlinks — see [`Self::is_ignored`]).
    pub fn is_match<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        let relative_path = match path.strip_prefix(&self.sync_root) {
            Ok(rel) => rel,
            Err(_) => return false,
        };
        let normalized = relative_path.to_string_lossy().replace('\\', "/");
        self.globset.is_match(&normalized)
    }

    pub fn is_match_relative<P: AsRef<Path>>(&self, relative_path: P) -> bool {
        let normalized = relative_path.as_ref().to_string_lossy().replace('\\', "/");
        self.globset.is_match(&normalized)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn sync_root(&self) -> &Path {
        &self.sync_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_pattern_matches_anywhere() {
        let sync_root = PathBuf::from("/home/user/sync");
        let patterns = vec!["*.log".to_string()];
        let matcher = IgnoreMatcher::new(&patterns, sync_root).unwrap();

        assert!(matcher.is_match("/home/user/sync/debug.log"));
        assert!(matcher.is_match("/home/user/sync/subdir/error.log"));
        assert!(!matcher.is_match("/home/user/sync/readme.txt"));
    }

    #[test]
    fn anchored_pattern_matches_only_at_root() {
        let sync_root = PathBuf::from("/home/user/sync");
        let patterns = vec!["/build".to_string()];
        let matcher = IgnoreMatcher::new(&patterns, sync_root).unwrap();

        assert!(matcher.is_match("/home/user/sync/build"));
        assert!(!matcher.is_match("/home/user/sync/src/build"));
    }

    #[test]
    fn vcs_metadata_is_ignored_by_default() {
        let sync_root = PathBuf::from("/home/user/sync");
        let matcher = IgnoreMatcher::new(&[], sync_root).unwrap();
        assert!(matcher.is_match("/home/user/sync/.git"));
        assert!(matcher.is_match("/home/user/sync/.git/HEAD"));
        assert!(matcher.is_match("/home/user/sync/.git/objects/ab/cdef"));
    }

    #[test]
    fn os_artifacts_and_state_dir_are_ignored_by_default() {
        let sync_root = PathBuf::from("/home/user/sync");
        let matcher = IgnoreMatcher::new(&[], sync_root).unwrap();
        assert!(matcher.is_match("/home/user/sync/.DS_Store"));
        assert!(matcher.is_match("/home/user/sync/docs/Thumbs.db"));
        assert!(matcher.is_match("/home/user/sync/.cryptosync"));
        assert!(matcher.is_match("/home/user/sync/.cryptosync/state.db"));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let sync_root = PathBuf::from("/home/user/sync");
        let patterns = vec![
            "# comment".to_string(),
            "".to_string(),
            "*.tmp".to_string(),
        ];
        let matcher = IgnoreMatcher::new(&patterns, sync_root).unwrap();
        assert!(matcher.is_match("/home/user/sync/file.tmp"));
    }

    #[test]
    fn missing_syncignore_file_yields_defaults_only() {
        let dir = tempfile::tempdir().unwrap();
        let matcher = IgnoreMatcher::load(dir.path().to_path_buf()).unwrap();
        assert!(matcher.is_match(dir.path().join(".git")));
    }

    #[test]
    fn syncignore_file_is_parsed_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".syncignore"), "*.bak\n# comment\nnode_modules\n").unwrap();
        let matcher = IgnoreMatcher::load(dir.path().to_path_buf()).unwrap();
        assert!(matcher.is_match(dir.path().join("a.bak")));
        assert!(matcher.is_match(dir.path().join("project/node_modules")));
    }
}
