//! Filesystem scanner for the clones root.
//!
//! The layout is exactly two levels deep: `<root>/<owner>/<repo>`. Names
//! found here are later joined back into paths for git and for deletion, so
//! every segment must pass [`is_safe_path_segment`] before it is reported.

use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use crate::config::RESERVED_NAMES;

/// A repository found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRepo {
    pub owner: String,
    pub repo: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPath {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub discovered: Vec<DiscoveredRepo>,
    pub skipped: Vec<SkippedPath>,
}

/// Non-empty, not `.`/`..`, no separators and no control characters.
pub fn is_safe_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Walk `<root>/<owner>/<repo>` and classify each repo candidate.
///
/// A missing root yields an empty result.
pub fn scan_clones_dir(root: &Path) -> ScanResult {
    let mut result = ScanResult::default();
    if !root.is_dir() {
        return result;
    }

    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(2)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() != 1 || is_owner_dir(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                result.skipped.push(SkippedPath {
                    path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
                    reason: format!("Unreadable: {}", e),
                });
                continue;
            }
        };
        if entry.depth() != 2 {
            continue;
        }

        let path = entry.path().to_path_buf();
        let Some(name) = entry.file_name().to_str() else {
            result.skipped.push(skip(path, "Unsafe path segment"));
            continue;
        };
        if is_hidden(name) {
            continue;
        }
        if !is_safe_path_segment(name) {
            result.skipped.push(skip(path, "Unsafe path segment"));
            continue;
        }
        if entry.path_is_symlink() {
            result.skipped.push(skip(path, "Symlink"));
            continue;
        }
        if !entry.file_type().is_dir() {
            result.skipped.push(skip(path, "Not a directory"));
            continue;
        }
        if std::fs::symlink_metadata(path.join(".git")).is_err() {
            result.skipped.push(skip(path, "No .git directory"));
            continue;
        }

        let owner = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        result.discovered.push(DiscoveredRepo {
            owner,
            repo: name.to_string(),
            local_path: path,
        });
    }

    result
}

fn is_owner_dir(entry: &DirEntry) -> bool {
    let Some(name) = entry.file_name().to_str() else {
        return false;
    };
    !is_hidden(name)
        && !RESERVED_NAMES.contains(&name)
        && is_safe_path_segment(name)
        && !entry.path_is_symlink()
        && entry.file_type().is_dir()
}

fn skip(path: PathBuf, reason: &str) -> SkippedPath {
    SkippedPath {
        path,
        reason: reason.to_string(),
    }
}

/// Whether `path` is a submodule/worktree checkout (`.git` is a file) or
/// sits inside another repository below `root`.
pub fn is_nested_repo(path: &Path, root: &Path) -> bool {
    if path.join(".git").is_file() {
        return true;
    }

    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if dir.join(".git").exists() {
            return true;
        }
        current = dir.parent();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn discovers_repos_and_skips_plain_dirs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("acme/widgets/.git")).unwrap();
        fs::create_dir_all(root.join("acme/nogit")).unwrap();
        fs::create_dir_all(root.join(".cache/thing/.git")).unwrap();
        fs::create_dir_all(root.join("acme/.hidden/.git")).unwrap();
        fs::write(root.join("registry.jsonl"), "").unwrap();

        let result = scan_clones_dir(root);
        assert_eq!(
            result.discovered,
            vec![DiscoveredRepo {
                owner: "acme".into(),
                repo: "widgets".into(),
                local_path: root.join("acme/widgets"),
            }]
        );
        assert_eq!(
            result.skipped,
            vec![SkippedPath {
                path: root.join("acme/nogit"),
                reason: "No .git directory".into(),
            }]
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        let outside = tmp.path().join("outside");
        fs::create_dir_all(outside.join("repo/.git")).unwrap();
        fs::create_dir_all(root.join("acme")).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("linked-owner")).unwrap();
        std::os::unix::fs::symlink(outside.join("repo"), root.join("acme/linked")).unwrap();

        let result = scan_clones_dir(&root);
        assert!(result.discovered.is_empty());
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].reason, "Symlink");
    }

    #[test]
    fn missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let result = scan_clones_dir(&tmp.path().join("absent"));
        assert!(result.discovered.is_empty());
        assert!(result.skipped.is_empty());
    }

    #[test]
    fn safe_segments() {
        assert!(is_safe_path_segment("widgets"));
        assert!(is_safe_path_segment("my.repo"));
        assert!(!is_safe_path_segment(""));
        assert!(!is_safe_path_segment("."));
        assert!(!is_safe_path_segment(".."));
        assert!(!is_safe_path_segment("a/b"));
        assert!(!is_safe_path_segment("a\\b"));
        assert!(!is_safe_path_segment("bad\nname"));
    }

    #[test]
    fn nested_repo_detection() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("acme/.git")).unwrap();
        fs::create_dir_all(root.join("acme/inner/.git")).unwrap();
        fs::create_dir_all(root.join("solo/repo/.git")).unwrap();
        fs::create_dir_all(root.join("solo/worktree")).unwrap();
        fs::write(root.join("solo/worktree/.git"), "gitdir: /elsewhere").unwrap();

        assert!(is_nested_repo(&root.join("acme/inner"), root));
        assert!(!is_nested_repo(&root.join("solo/repo"), root));
        assert!(is_nested_repo(&root.join("solo/worktree"), root));
    }
}
