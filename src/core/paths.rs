//! Ingestion path filtering.
//!
//! Decides which filesystem entries are eligible for ingestion. The checks
//! are ordered by precedence: excluded directory components, blocked
//! extensions, size cap, symlink escape, and finally the source/doc
//! extension allow-list (files only; directories recurse).

use std::path::{Component, Path};
use tracing::warn;

/// Directory names excluded from ingestion wherever they appear in a path.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "venv",
    "env",
    ".venv",
    "virtualenv",
    "node_modules",
    "bower_components",
    "jspm_packages",
    "site-packages",
    "dist",
    "build",
    ".next",
    ".nuxt",
    "target",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".cache",
    ".vscode",
    ".idea",
    ".tidepool",
];

/// Extensions never ingested (compiled artifacts and binary media).
pub const BLOCKED_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "class", "o", "so", "dylib", "dll", "exe", "bin", "png", "jpg", "jpeg", "gif",
    "webp", "ico", "pdf", "zip", "tar", "gz", "bz2", "xz", "7z", "mp3", "mp4", "mov", "avi",
    "woff", "woff2", "ttf", "eot",
];

/// Source and documentation extensions eligible for ingestion.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "py", "js", "jsx", "ts", "tsx", "go", "rs", "c", "h", "cpp", "cc", "hpp", "java", "kt",
    "swift", "rb", "php", "sh", "bash", "zsh", "md", "rst", "json", "yaml", "yml", "toml", "sql",
];

/// Lockfiles skipped once they exceed the size cap regardless of extension.
pub const LOCKFILE_NAMES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "poetry.lock",
    "Pipfile.lock",
    "composer.lock",
    "Gemfile.lock",
];

/// Why a candidate path was rejected. `Eligible` means ingest it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathVerdict {
    Eligible,
    ExcludedDir(String),
    BlockedExtension(String),
    TooLarge(u64),
    SymlinkEscape,
    ExtensionNotAllowed,
    Unreadable,
}

/// Per-project filter over candidate paths.
///
/// Pure with respect to its inputs: the same (root, candidate, metadata)
/// always yields the same verdict.
#[derive(Debug, Clone)]
pub struct PathFilter {
    root: std::path::PathBuf,
    max_file_bytes: u64,
}

impl PathFilter {
    pub fn new(root: &Path, max_file_bytes: u64) -> Self {
        PathFilter {
            root: root.to_path_buf(),
            max_file_bytes,
        }
    }

    /// Check whether any component of `path` names an excluded directory.
    pub fn has_excluded_component(path: &Path) -> Option<String> {
        for component in path.components() {
            if let Component::Normal(name) = component {
                let name = name.to_string_lossy();
                if EXCLUDED_DIRS.iter().any(|d| *d == name) {
                    return Some(name.into_owned());
                }
            }
        }
        None
    }

    fn extension_of(path: &Path) -> Option<String> {
        path.extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }

    /// Whether a directory should be descended into during a walk.
    /// Symlinked directories resolving outside the root are not followed.
    pub fn should_descend(&self, dir: &Path) -> bool {
        if Self::has_excluded_component(dir).is_some() {
            return false;
        }
        let is_symlink = std::fs::symlink_metadata(dir)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_symlink {
            let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
            return dir
                .canonicalize()
                .map(|resolved| resolved.starts_with(&root))
                .unwrap_or(false);
        }
        true
    }

    /// Full eligibility decision for a candidate file.
    ///
    /// Non-existent or unreadable paths yield `Unreadable`; callers log a
    /// warning and skip rather than failing the containing task.
    pub fn check_file(&self, path: &Path) -> PathVerdict {
        if let Some(dir) = Self::has_excluded_component(path) {
            return PathVerdict::ExcludedDir(dir);
        }

        let ext = Self::extension_of(path);
        if let Some(ext) = &ext {
            if BLOCKED_EXTENSIONS.iter().any(|b| *b == ext.as_str()) {
                return PathVerdict::BlockedExtension(ext.clone());
            }
        }

        let meta = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unreadable path");
                return PathVerdict::Unreadable;
            }
        };

        if meta.file_type().is_symlink() {
            // Symlinks are only ingestible when they resolve inside the root.
            let resolved = match path.canonicalize() {
                Ok(p) => p,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping broken symlink");
                    return PathVerdict::Unreadable;
                }
            };
            let root = match self.root.canonicalize() {
                Ok(p) => p,
                Err(_) => self.root.clone(),
            };
            if !resolved.starts_with(&root) {
                return PathVerdict::SymlinkEscape;
            }
        }

        let size = meta.len();
        let is_lockfile = path
            .file_name()
            .map(|n| LOCKFILE_NAMES.iter().any(|l| *l == n.to_string_lossy()))
            .unwrap_or(false);
        if size > self.max_file_bytes || (is_lockfile && size > self.max_file_bytes / 4) {
            return PathVerdict::TooLarge(size);
        }

        match ext {
            Some(ext) if ALLOWED_EXTENSIONS.iter().any(|a| *a == ext.as_str()) => {
                PathVerdict::Eligible
            }
            _ => PathVerdict::ExtensionNotAllowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn excluded_directories_win_over_allowed_extensions() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let filter = PathFilter::new(tmp.path(), 1024 * 1024);
        let nested = tmp.path().join("node_modules/pkg/index.js");
        fs::create_dir_all(nested.parent().unwrap()).unwrap();
        fs::write(&nested, "module.exports = 1;").unwrap();
        assert_eq!(
            filter.check_file(&nested),
            PathVerdict::ExcludedDir("node_modules".into())
        );
    }

    #[test]
    fn blocked_extension_rejected_before_stat() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let filter = PathFilter::new(tmp.path(), 1024 * 1024);
        // Never written to disk: the extension check must not require a stat.
        assert_eq!(
            filter.check_file(&tmp.path().join("lib.pyc")),
            PathVerdict::BlockedExtension("pyc".into())
        );
    }

    #[test]
    fn size_cap_applies() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let filter = PathFilter::new(tmp.path(), 16);
        let big = tmp.path().join("big.py");
        fs::write(&big, "x = 1\n".repeat(100)).unwrap();
        assert!(matches!(filter.check_file(&big), PathVerdict::TooLarge(_)));
    }

    #[test]
    fn allow_list_scopes_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let filter = PathFilter::new(tmp.path(), 1024 * 1024);
        let source = tmp.path().join("main.rs");
        fs::write(&source, "fn main() {}\n").unwrap();
        assert_eq!(filter.check_file(&source), PathVerdict::Eligible);

        let weird = tmp.path().join("data.parquet");
        fs::write(&weird, "...").unwrap();
        assert_eq!(filter.check_file(&weird), PathVerdict::ExtensionNotAllowed);
    }

    #[test]
    fn missing_file_is_unreadable_not_fatal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let filter = PathFilter::new(tmp.path(), 1024 * 1024);
        assert_eq!(
            filter.check_file(&tmp.path().join("ghost.py")),
            PathVerdict::Unreadable
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().expect("outside");
        let secret = outside.path().join("secret.py");
        fs::write(&secret, "password = 'x'\n").unwrap();

        let tmp = tempfile::tempdir().expect("tempdir");
        let filter = PathFilter::new(tmp.path(), 1024 * 1024);
        let link = tmp.path().join("escape.py");
        std::os::unix::fs::symlink(&secret, &link).unwrap();
        assert_eq!(filter.check_file(&link), PathVerdict::SymlinkEscape);
    }
}
