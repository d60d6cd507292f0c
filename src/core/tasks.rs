//! Asynchronous indexing task registry.
//!
//! Owns task records for the process lifetime. Creation returns immediately
//! with a queued record; a dedicated worker drives each task through
//! queued → running → completed | failed | cancelled, bounded by a global
//! concurrency semaphore. Progress updates throttle event emission to one
//! per 200 ms per task. Cancellation is a flag the worker polls between
//! files, so it lands within one file's processing time.

use crate::core::error::TidepoolError;
use crate::core::events::{
    EventBus, TOPIC_INDEXING_COMPLETE, TOPIC_INDEXING_ERROR, TOPIC_INDEXING_PROGRESS,
};
use crate::core::retrieval::{IngestReport, RetrievalEngine};
use crate::core::time;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info};

pub const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Ingest,
    Reindex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Task record as returned by `GET /tasks/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub kind: TaskKind,
    pub project_id: String,
    pub state: TaskState,
    /// Percent complete in [0, 100].
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub counters: IngestReport,
}

struct TaskEntry {
    record: TaskRecord,
    cancel: Arc<AtomicBool>,
    last_emit: Instant,
}

fn percent(processed: usize, total: usize) -> f32 {
    if total == 0 {
        100.0
    } else {
        (processed as f32 / total as f32 * 100.0).clamp(0.0, 100.0)
    }
}

/// Exclusive owner of task records.
pub struct TaskRegistry {
    tasks: Mutex<FxHashMap<String, TaskEntry>>,
    permits: Arc<Semaphore>,
    bus: Arc<EventBus>,
}

impl TaskRegistry {
    pub fn new(max_concurrency: usize, bus: Arc<EventBus>) -> Self {
        TaskRegistry {
            tasks: Mutex::new(FxHashMap::default()),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            bus,
        }
    }

    /// Register a queued task and hand back its record immediately.
    pub fn create(&self, kind: TaskKind, project_id: &str) -> TaskRecord {
        let record = TaskRecord {
            task_id: time::short_id("task"),
            kind,
            project_id: project_id.to_string(),
            state: TaskState::Queued,
            progress: 0.0,
            current_item: None,
            created_at: time::now_iso(),
            started_at: None,
            finished_at: None,
            error: None,
            counters: IngestReport::default(),
        };
        let entry = TaskEntry {
            record: record.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            last_emit: Instant::now()
                .checked_sub(PROGRESS_EMIT_INTERVAL)
                .unwrap_or_else(Instant::now),
        };
        self.tasks
            .lock()
            .expect("task registry lock")
            .insert(record.task_id.clone(), entry);
        record
    }

    pub fn get(&self, task_id: &str) -> Result<TaskRecord, TidepoolError> {
        self.tasks
            .lock()
            .expect("task registry lock")
            .get(task_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| TidepoolError::NotFound(format!("task {task_id}")))
    }

    /// Request cancellation. Terminal tasks are returned unchanged.
    pub fn cancel(&self, task_id: &str) -> Result<TaskRecord, TidepoolError> {
        let tasks = self.tasks.lock().expect("task registry lock");
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| TidepoolError::NotFound(format!("task {task_id}")))?;
        if !entry.record.state.is_terminal() {
            entry
                .cancel
                .store(true, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(entry.record.clone())
    }

    fn with_entry<R>(&self, task_id: &str, f: impl FnOnce(&mut TaskEntry) -> R) -> Option<R> {
        let mut tasks = self.tasks.lock().expect("task registry lock");
        tasks.get_mut(task_id).map(f)
    }

    fn mark_running(&self, task_id: &str) {
        self.with_entry(task_id, |entry| {
            entry.record.state = TaskState::Running;
            entry.record.started_at = Some(time::now_iso());
        });
    }

    /// Record progress; emit `indexing_progress` at most every 200 ms.
    fn update_progress(&self, task_id: &str, processed: usize, total: usize, current: &str) {
        let emitted = self.with_entry(task_id, |entry| {
            entry.record.progress = percent(processed, total);
            entry.record.current_item = if current.is_empty() {
                None
            } else {
                Some(current.to_string())
            };
            if entry.last_emit.elapsed() >= PROGRESS_EMIT_INTERVAL || processed == total {
                entry.last_emit = Instant::now();
                Some((entry.record.project_id.clone(), entry.record.progress))
            } else {
                None
            }
        });
        if let Some(Some((project_id, progress))) = emitted {
            self.bus.publish(
                TOPIC_INDEXING_PROGRESS,
                json!({
                    "project_id": project_id,
                    "task_id": task_id,
                    "progress": progress,
                    "current_file": current,
                }),
            );
        }
    }

    fn finish(&self, task_id: &str, outcome: Result<IngestReport, TidepoolError>) {
        let event = self.with_entry(task_id, |entry| {
            entry.record.finished_at = Some(time::now_iso());
            entry.record.current_item = None;
            match outcome {
                Ok(report) => {
                    entry.record.state = TaskState::Completed;
                    entry.record.progress = 100.0;
                    entry.record.counters = report.clone();
                    Ok((entry.record.project_id.clone(), report))
                }
                Err(TidepoolError::Cancelled(reason)) => {
                    entry.record.state = TaskState::Cancelled;
                    entry.record.error = Some(reason);
                    Err(None)
                }
                Err(err) => {
                    entry.record.state = TaskState::Failed;
                    entry.record.error = Some(err.to_string());
                    Err(Some((entry.record.project_id.clone(), err.to_string())))
                }
            }
        });
        match event {
            Some(Ok((project_id, report))) => {
                info!(task_id, %project_id, files = report.files_indexed, "ingest task completed");
                self.bus.publish(
                    TOPIC_INDEXING_COMPLETE,
                    json!({
                        "project_id": project_id,
                        "task_id": task_id,
                        "files": report.files_indexed + report.files_unchanged,
                        "chunks": report.chunks_written,
                    }),
                );
            }
            Some(Err(Some((project_id, message)))) => {
                error!(task_id, %project_id, %message, "ingest task failed");
                self.bus.publish(
                    TOPIC_INDEXING_ERROR,
                    json!({
                        "project_id": project_id,
                        "task_id": task_id,
                        "error": message,
                    }),
                );
            }
            _ => {}
        }
    }

    /// Spawn a worker that ingests `root` into `project_id`'s collection.
    ///
    /// Returns the queued record immediately. The worker acquires a permit
    /// from the global concurrency cap before moving to `running`, traps
    /// every error into the task record, and never propagates out of the
    /// spawned task.
    pub fn spawn_ingest(
        self: Arc<Self>,
        engine: Arc<RetrievalEngine>,
        kind: TaskKind,
        project_id: &str,
        root: PathBuf,
    ) -> TaskRecord {
        let record = self.create(kind, project_id);
        let registry = self;
        let task_id = record.task_id.clone();
        let project_id = project_id.to_string();
        let cancel = registry
            .with_entry(&task_id, |entry| Arc::clone(&entry.cancel))
            .expect("entry just inserted");

        tokio::spawn(async move {
            let permit = match Arc::clone(&registry.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    registry.finish(
                        &task_id,
                        Err(TidepoolError::Internal("task semaphore closed".into())),
                    );
                    return;
                }
            };
            registry.mark_running(&task_id);

            let progress_registry = Arc::clone(&registry);
            let progress_task_id = task_id.clone();
            let mut on_progress = move |processed: usize, total: usize, current: &str| {
                progress_registry.update_progress(&progress_task_id, processed, total, current);
            };

            let outcome = engine
                .ingest_path(&project_id, &root, &cancel, &mut on_progress)
                .await;
            registry.finish(&task_id, outcome);
            drop(permit);
        });
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<TaskRegistry> {
        Arc::new(TaskRegistry::new(2, Arc::new(EventBus::new(64))))
    }

    #[test]
    fn percent_handles_empty_totals() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(5, 10), 50.0);
        assert_eq!(percent(10, 10), 100.0);
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let registry = registry();
        let record = registry.create(TaskKind::Ingest, "proj_1");
        assert_eq!(record.state, TaskState::Queued);
        assert_eq!(record.progress, 0.0);

        let fetched = registry.get(&record.task_id).expect("get");
        assert_eq!(fetched.task_id, record.task_id);
        assert!(registry.get("task_missing").is_err());
    }

    #[tokio::test]
    async fn cancel_flags_non_terminal_tasks() {
        let registry = registry();
        let record = registry.create(TaskKind::Ingest, "proj_1");
        let cancelled = registry.cancel(&record.task_id).expect("cancel");
        assert_eq!(cancelled.state, TaskState::Queued);
        let flagged = registry
            .with_entry(&record.task_id, |e| {
                e.cancel.load(std::sync::atomic::Ordering::Relaxed)
            })
            .unwrap();
        assert!(flagged);
    }

    #[tokio::test]
    async fn finish_records_failure_and_emits_error() {
        let registry = registry();
        let bus_rx = &mut registry.bus.subscribe();
        let record = registry.create(TaskKind::Ingest, "proj_1");
        registry.finish(
            &record.task_id,
            Err(TidepoolError::Internal("collection unavailable".into())),
        );
        let fetched = registry.get(&record.task_id).unwrap();
        assert_eq!(fetched.state, TaskState::Failed);
        assert!(fetched.error.as_deref().unwrap().contains("collection"));

        let event = bus_rx.recv().await.expect("error event");
        assert_eq!(event.event, TOPIC_INDEXING_ERROR);
        assert_eq!(event.payload["task_id"], record.task_id);
    }

    #[tokio::test]
    async fn finish_completed_sets_progress_100() {
        let registry = registry();
        let record = registry.create(TaskKind::Ingest, "proj_1");
        let report = IngestReport {
            files_indexed: 2,
            chunks_written: 5,
            ..IngestReport::default()
        };
        registry.finish(&record.task_id, Ok(report));
        let fetched = registry.get(&record.task_id).unwrap();
        assert_eq!(fetched.state, TaskState::Completed);
        assert_eq!(fetched.progress, 100.0);
        assert_eq!(fetched.counters.chunks_written, 5);
    }
}
