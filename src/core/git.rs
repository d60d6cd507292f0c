//! Git activity source.
//!
//! Reports commits and working-tree changes for a project root over a time
//! window, via the `git` binary. Absence of git, a non-repo root, or a
//! permission failure is not an error: drift analysis proceeds with empty
//! activity and an explicit note.

use std::path::Path;
use std::process::Command;
use tracing::warn;

const FIELD_SEP: char = '\u{1f}';

/// One commit inside the analysis window.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitInfo {
    pub hash: String,
    pub timestamp: i64,
    pub message: String,
    pub changed_paths: Vec<String>,
}

/// Activity snapshot for a window. `available == false` means git could not
/// be consulted at all (distinct from "no commits").
#[derive(Debug, Clone, Default)]
pub struct GitActivity {
    pub available: bool,
    pub commits: Vec<CommitInfo>,
    pub working_tree_changes: Vec<String>,
}

fn run_git(root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

/// Parse `git log --pretty=format:%H<US>%ct<US>%s --name-only` output.
fn parse_log(raw: &str) -> Vec<CommitInfo> {
    let mut commits = Vec::new();
    let mut current: Option<CommitInfo> = None;
    for line in raw.lines() {
        if line.contains(FIELD_SEP) {
            if let Some(done) = current.take() {
                commits.push(done);
            }
            let mut fields = line.splitn(3, FIELD_SEP);
            let hash = fields.next().unwrap_or_default().to_string();
            let timestamp = fields
                .next()
                .and_then(|t| t.parse::<i64>().ok())
                .unwrap_or_default();
            let message = fields.next().unwrap_or_default().to_string();
            current = Some(CommitInfo {
                hash,
                timestamp,
                message,
                changed_paths: Vec::new(),
            });
        } else if !line.trim().is_empty() {
            if let Some(commit) = current.as_mut() {
                commit.changed_paths.push(line.trim().to_string());
            }
        }
    }
    if let Some(done) = current.take() {
        commits.push(done);
    }
    commits
}

/// Collect commit and working-tree activity over the past `window_hours`.
///
/// Blocking (subprocess); callers on the async runtime use
/// `tokio::task::spawn_blocking`.
pub fn collect_activity(root: &Path, window_hours: u64) -> GitActivity {
    let since = format!("{window_hours} hours ago");
    let log = run_git(
        root,
        &[
            "log",
            "--since",
            &since,
            "--pretty=format:%H\u{1f}%ct\u{1f}%s",
            "--name-only",
        ],
    );
    let Some(log) = log else {
        warn!(root = %root.display(), "git activity unavailable");
        return GitActivity::default();
    };

    let commits = parse_log(&log);

    let working_tree_changes = run_git(root, &["status", "--porcelain"])
        .map(|raw| {
            raw.lines()
                .filter_map(|line| line.get(3..).map(str::to_string))
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default();

    GitActivity {
        available: true,
        commits,
        working_tree_changes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_groups_paths_under_commits() {
        let raw = format!(
            "aaa{s}1700000000{s}Add retrieval engine\nsrc/core/retrieval.rs\nsrc/lib.rs\n\nbbb{s}1700000100{s}Fix chunker offsets\nsrc/core/chunker.rs\n",
            s = FIELD_SEP
        );
        let commits = parse_log(&raw);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, "aaa");
        assert_eq!(commits[0].message, "Add retrieval engine");
        assert_eq!(
            commits[0].changed_paths,
            vec!["src/core/retrieval.rs", "src/lib.rs"]
        );
        assert_eq!(commits[1].timestamp, 1_700_000_100);
        assert_eq!(commits[1].changed_paths, vec!["src/core/chunker.rs"]);
    }

    #[test]
    fn parse_log_handles_empty_output() {
        assert!(parse_log("").is_empty());
    }

    #[test]
    fn non_repo_root_reports_unavailable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let activity = collect_activity(tmp.path(), 24);
        assert!(!activity.available);
        assert!(activity.commits.is_empty());
    }

    #[test]
    fn repo_with_commit_is_picked_up() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let git = |args: &[&str]| {
            Command::new("git")
                .arg("-C")
                .arg(root)
                .args(args)
                .output()
                .expect("git runs")
        };
        assert!(git(&["init", "-q"]).status.success());
        git(&["config", "user.email", "dev@example.com"]);
        git(&["config", "user.name", "Dev"]);
        std::fs::write(root.join("db.rs"), "// mongo driver\n").unwrap();
        git(&["add", "."]);
        assert!(git(&["commit", "-q", "-m", "Add MongoDB driver"]).status.success());

        let activity = collect_activity(root, 24);
        assert!(activity.available);
        assert_eq!(activity.commits.len(), 1);
        assert_eq!(activity.commits[0].message, "Add MongoDB driver");
        assert_eq!(activity.commits[0].changed_paths, vec!["db.rs"]);
    }
}
