//! Ingest and query pipelines: filtering, idempotent re-ingest, atomic
//! replacement, query boundaries, generation fallback, and task workers.

mod common;

use common::{test_config, EchoGenerator, FailingGenerator, HashEmbedder, TEST_DIM};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tidepool::api::AppState;
use tidepool::core::error::TidepoolError;
use tidepool::core::tasks::{TaskKind, TaskState};

fn sample_repo(root: &Path) {
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(
        root.join("src/a.py"),
        "def add(x, y):\n    \"\"\"Adds two numbers together.\"\"\"\n    return x + y\n",
    )
    .unwrap();
    fs::write(root.join("README.md"), "# Sample\n\nA tiny fixture repo.\n").unwrap();
    // Everything below must be filtered out.
    fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
    fs::write(root.join("node_modules/pkg/index.js"), "module.exports = 1;\n").unwrap();
    fs::write(root.join("src/junk.pyc"), [0u8, 1, 2, 3]).unwrap();
}

fn state() -> (tempfile::TempDir, Arc<AppState>) {
    let tmp = tempdir().expect("tempdir");
    let config = test_config(&tmp.path().join("data"));
    let state = AppState::build(
        config,
        Arc::new(HashEmbedder::new(TEST_DIM)),
        Arc::new(EchoGenerator),
    )
    .expect("state");
    (tmp, state)
}

async fn wait_for_terminal(state: &AppState, task_id: &str) -> TaskState {
    for _ in 0..300 {
        let record = state.tasks.get(task_id).expect("task exists");
        if record.state.is_terminal() {
            return record.state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} never reached a terminal state");
}

#[tokio::test]
async fn directory_ingest_filters_and_counts() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    sample_repo(&repo);

    let cancel = AtomicBool::new(false);
    let mut updates: Vec<(usize, usize)> = Vec::new();
    let mut progress = |done: usize, total: usize, _current: &str| {
        updates.push((done, total));
    };
    let report = state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut progress)
        .await
        .expect("ingest");

    assert_eq!(report.files_indexed, 2);
    assert_eq!(report.files_failed, 0);
    assert!(report.chunks_written >= 2);
    // Excluded paths never entered the pipeline (filtered during the walk).
    let (chunks, sources) = state.retrieval.stats("proj_r1").expect("stats");
    assert_eq!(sources, 2);
    assert_eq!(chunks, report.chunks_written);
    assert!(!updates.is_empty());
    assert_eq!(updates.last().unwrap().0, updates.last().unwrap().1);
}

#[tokio::test]
async fn reingest_unchanged_is_a_no_op() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    sample_repo(&repo);
    let cancel = AtomicBool::new(false);

    let first = state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut |_, _, _| {})
        .await
        .expect("first ingest");
    let (chunks_before, _) = state.retrieval.stats("proj_r1").unwrap();

    let second = state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut |_, _, _| {})
        .await
        .expect("second ingest");
    assert_eq!(second.files_indexed, 0);
    assert_eq!(second.files_unchanged, 2);
    assert_eq!(second.chunks_written, 0);
    let (chunks_after, _) = state.retrieval.stats("proj_r1").unwrap();
    assert_eq!(chunks_before, chunks_after);
    assert_eq!(first.files_indexed, 2);
}

#[tokio::test]
async fn changed_file_replaces_prior_generation() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    sample_repo(&repo);
    let cancel = AtomicBool::new(false);
    state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut |_, _, _| {})
        .await
        .expect("ingest");

    fs::write(
        repo.join("src/a.py"),
        "def multiply(x, y):\n    \"\"\"Multiplies two numbers.\"\"\"\n    return x * y\n",
    )
    .unwrap();
    let report = state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut |_, _, _| {})
        .await
        .expect("re-ingest");
    assert_eq!(report.files_indexed, 1);
    assert_eq!(report.files_unchanged, 1);

    // Still two sources; the old a.py chunks are gone.
    let (_, sources) = state.retrieval.stats("proj_r1").unwrap();
    assert_eq!(sources, 2);
    let response = state
        .retrieval
        .query("proj_r1", "multiplies two numbers", Some(3))
        .await
        .expect("query");
    assert!(response.results[0].source_path.ends_with("a.py"));
    assert!(response.results[0].content.contains("multiply"));
}

#[tokio::test]
async fn ingest_of_fully_excluded_tree_completes_empty() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    fs::create_dir_all(repo.join("node_modules/x")).unwrap();
    fs::write(repo.join("node_modules/x/i.js"), "1\n").unwrap();

    let cancel = AtomicBool::new(false);
    let report = state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut |_, _, _| {})
        .await
        .expect("ingest");
    assert_eq!(report.files_indexed, 0);
    assert_eq!(report.chunks_written, 0);
    let (chunks, _) = state.retrieval.stats("proj_r1").unwrap();
    assert_eq!(chunks, 0);
}

#[tokio::test]
async fn query_boundaries_and_empty_collection() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    sample_repo(&repo);

    // k = 0 is invalid input.
    let err = state
        .retrieval
        .query("proj_r1", "anything", Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, TidepoolError::InvalidInput(_)));

    // Empty collection: structured no-content response, not an error.
    let response = state
        .retrieval
        .query("proj_r1", "anything", None)
        .await
        .expect("query empty");
    assert!(response.results.is_empty());
    assert!(response.note.as_deref().unwrap().contains("no indexed content"));

    let cancel = AtomicBool::new(false);
    state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut |_, _, _| {})
        .await
        .expect("ingest");

    // Oversized k silently clamps.
    let response = state
        .retrieval
        .query("proj_r1", "adds two numbers", Some(500))
        .await
        .expect("query");
    assert!(response.results.len() <= 20);
    assert!(response.results[0].source_path.ends_with("a.py"));

    // Every stored entry carries source_path metadata (collection invariant).
    for hit in &response.results {
        assert!(hit.metadata.get("source_path").is_some());
    }
}

#[tokio::test]
async fn generation_failure_returns_grounding_chunks() {
    let tmp = tempdir().expect("tempdir");
    let config = test_config(&tmp.path().join("data"));
    let state = AppState::build(
        config,
        Arc::new(HashEmbedder::new(TEST_DIM)),
        Arc::new(FailingGenerator),
    )
    .expect("state");
    let repo = tmp.path().join("repo");
    sample_repo(&repo);
    let cancel = AtomicBool::new(false);
    state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut |_, _, _| {})
        .await
        .expect("ingest");

    let answer = state
        .retrieval
        .query_with_generation("proj_r1", "adds two numbers", Some(3))
        .await
        .expect("query_llm");
    assert!(answer.answer.is_none());
    assert!(answer.note.as_deref().unwrap().contains("generation unavailable"));
    assert!(answer.context_used > 0);
    assert!(answer.sources.iter().any(|s| s.ends_with("a.py")));
}

#[tokio::test]
async fn generation_success_cites_sources() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    sample_repo(&repo);
    let cancel = AtomicBool::new(false);
    state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut |_, _, _| {})
        .await
        .expect("ingest");

    let answer = state
        .retrieval
        .query_with_generation("proj_r1", "adds two numbers", Some(3))
        .await
        .expect("query_llm");
    assert_eq!(
        answer.answer.as_deref(),
        Some("Grounded answer to: adds two numbers")
    );
    assert!(answer.context_used > 0);
    assert!(!answer.sources.is_empty());
}

#[tokio::test]
async fn task_worker_completes_with_events() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    sample_repo(&repo);
    let mut bus_rx = state.bus.subscribe();

    let record = Arc::clone(&state.tasks).spawn_ingest(
        Arc::clone(&state.retrieval),
        TaskKind::Ingest,
        "proj_r1",
        repo.clone(),
    );
    assert_eq!(record.state, TaskState::Queued);

    let terminal = wait_for_terminal(&state, &record.task_id).await;
    assert_eq!(terminal, TaskState::Completed);
    let finished = state.tasks.get(&record.task_id).unwrap();
    assert_eq!(finished.progress, 100.0);
    assert_eq!(finished.counters.files_indexed, 2);
    assert!(finished.counters.chunks_written >= 2);

    // An indexing_complete frame reached the bus.
    let mut saw_complete = false;
    while let Ok(event) =
        tokio::time::timeout(Duration::from_secs(2), bus_rx.recv()).await
    {
        if let Ok(event) = event {
            if event.event == "indexing_complete" {
                assert_eq!(event.payload["task_id"], finished.task_id);
                assert_eq!(event.payload["files"], 2);
                saw_complete = true;
                break;
            }
        }
    }
    assert!(saw_complete);
}

#[tokio::test]
async fn cancellation_lands_between_files() {
    let tmp = tempdir().expect("tempdir");
    let config = test_config(&tmp.path().join("data"));
    // ~25 ms per embedded batch makes the 60-file ingest take over a second,
    // leaving plenty of room for the cancel to land mid-run.
    let state = AppState::build(
        config,
        Arc::new(HashEmbedder::slow(TEST_DIM, Duration::from_millis(25))),
        Arc::new(EchoGenerator),
    )
    .expect("state");

    let repo = tmp.path().join("repo");
    fs::create_dir_all(&repo).unwrap();
    for i in 0..60 {
        fs::write(
            repo.join(format!("file_{i:03}.py")),
            format!("value_{i} = {i}\n"),
        )
        .unwrap();
    }

    let record = Arc::clone(&state.tasks).spawn_ingest(
        Arc::clone(&state.retrieval),
        TaskKind::Ingest,
        "proj_r1",
        repo,
    );
    tokio::time::sleep(Duration::from_millis(120)).await;
    state.tasks.cancel(&record.task_id).expect("cancel");

    let terminal = wait_for_terminal(&state, &record.task_id).await;
    assert_eq!(terminal, TaskState::Cancelled);
    let finished = state.tasks.get(&record.task_id).unwrap();
    assert!(finished.error.as_deref().unwrap().contains("cancelled"));
    assert!(finished.progress < 100.0);
}

#[tokio::test]
async fn single_file_ingest_via_task_path() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    sample_repo(&repo);
    let file: PathBuf = repo.join("src/a.py");

    let record = Arc::clone(&state.tasks).spawn_ingest(
        Arc::clone(&state.retrieval),
        TaskKind::Ingest,
        "proj_r1",
        file,
    );
    let terminal = wait_for_terminal(&state, &record.task_id).await;
    assert_eq!(terminal, TaskState::Completed);
    let finished = state.tasks.get(&record.task_id).unwrap();
    assert_eq!(finished.counters.files_indexed, 1);

    let (_, sources) = state.retrieval.stats("proj_r1").unwrap();
    assert_eq!(sources, 1);
}

#[tokio::test]
async fn secrets_never_reach_the_collection() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    fs::create_dir_all(&repo).unwrap();
    fs::write(
        repo.join("settings.py"),
        "API_KEY = \"sk-abc123def456ghi789jklmno\"\nDEBUG = False\n",
    )
    .unwrap();

    let cancel = AtomicBool::new(false);
    state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut |_, _, _| {})
        .await
        .expect("ingest");

    let response = state
        .retrieval
        .query("proj_r1", "API KEY DEBUG settings", Some(5))
        .await
        .expect("query");
    assert!(!response.results.is_empty());
    for hit in &response.results {
        assert!(!hit.content.contains("sk-abc123"));
        assert!(hit.content.contains("[REDACTED]"));
    }
}

#[tokio::test]
async fn concurrent_queries_never_see_a_half_replaced_file() {
    let (tmp, state) = state();
    let repo = tmp.path().join("repo");
    fs::create_dir_all(&repo).unwrap();

    // Multi-chunk file so a torn replace would be observable.
    let body_a = format!("# generation alpha\n\n{}", "alpha paragraph text. ".repeat(80));
    let body_b = format!("# generation beta\n\n{}", "beta paragraph text. ".repeat(80));
    let target = repo.join("notes.md");
    fs::write(&target, &body_a).unwrap();

    let cancel = AtomicBool::new(false);
    state
        .retrieval
        .ingest_dir("proj_r1", &repo, &cancel, &mut |_, _, _| {})
        .await
        .expect("seed ingest");

    let writer_state = Arc::clone(&state);
    let writer_target = target.clone();
    let writer = tokio::spawn(async move {
        let cancel = AtomicBool::new(false);
        for round in 0..10 {
            let body = if round % 2 == 0 { &body_b } else { &body_a };
            fs::write(&writer_target, body).unwrap();
            writer_state
                .retrieval
                .ingest_dir(
                    "proj_r1",
                    writer_target.parent().unwrap(),
                    &cancel,
                    &mut |_, _, _| {},
                )
                .await
                .expect("rewrite ingest");
        }
    });

    // Every query snapshot must come from exactly one generation: all
    // chunks of the file share one content hash.
    for _ in 0..30 {
        let response = state
            .retrieval
            .query("proj_r1", "paragraph text generation", Some(20))
            .await
            .expect("query");
        let hashes: std::collections::HashSet<&str> = response
            .results
            .iter()
            .filter(|hit| hit.source_path.ends_with("notes.md"))
            .filter_map(|hit| hit.metadata.get("content_hash").and_then(|v| v.as_str()))
            .collect();
        assert!(hashes.len() <= 1, "query observed a mixed generation");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    writer.await.expect("writer task");
}
