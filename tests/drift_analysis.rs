//! Drift analysis: contradiction flagging, vacuous alignment, and
//! determinism.

mod common;

use async_trait::async_trait;
use common::{test_config_with_dim, EchoGenerator, TEST_APPROVAL_KEY};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use tempfile::tempdir;
use tidepool::api::AppState;
use tidepool::core::drift::DriftStatus;
use tidepool::core::embed::Embedder;
use tidepool::core::error::TidepoolError;

const DIM: usize = 8;

/// Embedder that projects texts onto a handful of topic axes. Texts about
/// the same topic are identical vectors; unrelated texts are orthogonal,
/// which makes similarity arithmetic exact in assertions.
struct TopicEmbedder;

const TOPICS: &[(&str, usize)] = &[
    ("mongo", 0),
    ("postgres", 1),
    ("storage", 2),
    ("websocket", 3),
    ("cache", 4),
];

#[async_trait]
impl Embedder for TopicEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TidepoolError> {
        Ok(texts
            .iter()
            .map(|text| {
                let lower = text.to_lowercase();
                let mut v = vec![0.0f32; DIM];
                for (topic, axis) in TOPICS {
                    if lower.contains(topic) {
                        v[*axis] = 1.0;
                    }
                }
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for x in &mut v {
                        *x /= norm;
                    }
                }
                v
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

fn git(root: &Path, args: &[&str]) {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_repo(root: &Path) {
    fs::create_dir_all(root).unwrap();
    git(root, &["init", "-q"]);
    git(root, &["config", "user.email", "dev@example.com"]);
    git(root, &["config", "user.name", "Dev"]);
}

fn state() -> (tempfile::TempDir, Arc<AppState>) {
    let tmp = tempdir().expect("tempdir");
    let config = test_config_with_dim(&tmp.path().join("data"), DIM);
    let state = AppState::build(config, Arc::new(TopicEmbedder), Arc::new(EchoGenerator))
        .expect("state");
    (tmp, state)
}

async fn approved_plan(state: &AppState, project_id: &str, title: &str, content: &str) -> String {
    let record = state
        .sacred
        .create_plan(project_id, title, content)
        .await
        .expect("create plan");
    state
        .sacred
        .approve_plan(
            &record.plan_id,
            &record.verification_code,
            TEST_APPROVAL_KEY,
            "reviewer",
        )
        .expect("approve plan");
    record.plan_id
}

#[tokio::test]
async fn contradicting_commit_is_flagged() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    init_repo(&repo);
    fs::create_dir_all(repo.join("db")).unwrap();
    fs::write(repo.join("db/mongo.go"), "package db\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "Add MongoDB driver"]);

    let project = state
        .projects
        .create("Drifting", &repo, "")
        .expect("project");
    let plan_id = approved_plan(
        &state,
        &project.project_id,
        "DB choice",
        "Use PostgreSQL for storage.\n\nNever use MongoDB.\n",
    )
    .await;

    let analysis = state
        .drift
        .analyze(&project.project_id, 24)
        .await
        .expect("analyze");

    assert!(matches!(
        analysis.status,
        DriftStatus::ModerateDrift | DriftStatus::CriticalViolation
    ));
    assert!(!analysis.violations.is_empty());
    assert!(analysis.violations.iter().any(|v| v.plan_id == plan_id));
    assert!(analysis
        .violations
        .iter()
        .any(|v| v.evidence.contains("mongo.go") || v.evidence.len() == 40));
    assert!(!analysis.recommendations.is_empty());
    assert!(analysis.alignment_score < 1.0);
    assert_eq!(
        analysis
            .plan_adherence
            .iter()
            .filter(|p| p.plan_id == plan_id)
            .count(),
        1
    );
}

#[tokio::test]
async fn aligned_activity_stays_aligned() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    init_repo(&repo);
    fs::create_dir_all(repo.join("store")).unwrap();
    fs::write(repo.join("store/postgres.rs"), "// postgres storage\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "Wire postgres storage layer"]);

    let project = state.projects.create("Aligned", &repo, "").expect("project");
    approved_plan(
        &state,
        &project.project_id,
        "DB choice",
        "Use Postgres for storage.\n",
    )
    .await;

    let analysis = state
        .drift
        .analyze(&project.project_id, 24)
        .await
        .expect("analyze");
    assert_eq!(analysis.status, DriftStatus::Aligned);
    assert!(analysis.violations.is_empty());
    assert!(analysis.alignment_score >= 0.8);
}

#[tokio::test]
async fn missing_git_activity_is_vacuously_aligned() {
    let (tmp, state) = state();
    let plain_dir = tmp.path().join("not-a-repo");
    fs::create_dir_all(&plain_dir).unwrap();
    let project = state
        .projects
        .create("NoGit", &plain_dir, "")
        .expect("project");
    approved_plan(
        &state,
        &project.project_id,
        "DB choice",
        "Use Postgres for storage.\n",
    )
    .await;

    let analysis = state
        .drift
        .analyze(&project.project_id, 24)
        .await
        .expect("analyze");
    assert_eq!(analysis.status, DriftStatus::Aligned);
    assert_eq!(analysis.alignment_score, 1.0);
    assert!(analysis.violations.is_empty());
    assert!(analysis
        .notes
        .iter()
        .any(|n| n.contains("unavailable") || n.contains("no development activity")));
}

#[tokio::test]
async fn no_approved_plans_is_vacuously_aligned() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    init_repo(&repo);
    let project = state.projects.create("NoPlans", &repo, "").expect("project");

    let analysis = state
        .drift
        .analyze(&project.project_id, 24)
        .await
        .expect("analyze");
    assert_eq!(analysis.status, DriftStatus::Aligned);
    assert_eq!(analysis.alignment_score, 1.0);
    assert!(analysis.notes.iter().any(|n| n.contains("no approved plans")));
}

#[tokio::test]
async fn analysis_is_deterministic_for_identical_inputs() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    init_repo(&repo);
    fs::create_dir_all(repo.join("db")).unwrap();
    fs::write(repo.join("db/mongo.go"), "package db\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-q", "-m", "Add MongoDB driver"]);

    let project = state.projects.create("Det", &repo, "").expect("project");
    approved_plan(
        &state,
        &project.project_id,
        "DB choice",
        "Use PostgreSQL for storage.\n\nNever use MongoDB.\n",
    )
    .await;

    let first = state
        .drift
        .analyze(&project.project_id, 24)
        .await
        .expect("first analyze");
    let second = state
        .drift
        .analyze(&project.project_id, 24)
        .await
        .expect("second analyze");

    assert_eq!(first.status, second.status);
    assert_eq!(first.violations.len(), second.violations.len());
    for (a, b) in first.violations.iter().zip(&second.violations) {
        assert_eq!(a.plan_id, b.plan_id);
        assert_eq!(a.evidence, b.evidence);
        assert_eq!(a.severity, b.severity);
    }
    assert!((first.alignment_score - second.alignment_score).abs() < 0.02);
}

#[tokio::test]
async fn drift_window_sees_recent_queries() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    init_repo(&repo);
    let project = state.projects.create("Queries", &repo, "").expect("project");
    approved_plan(
        &state,
        &project.project_id,
        "Cache policy",
        "Use the cache for hot reads.\n",
    )
    .await;

    // A logged retrieval query becomes drift input even with no commits.
    let _ = state
        .retrieval
        .query(&project.project_id, "how does the cache work", Some(3))
        .await
        .expect("query");

    let analysis = state
        .drift
        .analyze(&project.project_id, 24)
        .await
        .expect("analyze");
    // The cache-topic query matches the cache plan: aligned, not vacuous.
    assert_eq!(analysis.status, DriftStatus::Aligned);
    assert!(!analysis.plan_adherence.is_empty());
    assert!(analysis.plan_adherence[0].score > 0.9);
    assert!(analysis
        .notes
        .iter()
        .all(|n| !n.contains("no development activity")));
}
