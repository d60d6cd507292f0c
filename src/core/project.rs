//! Project registry.
//!
//! Exclusive owner of project, decision, objective, and development-event
//! records. Projects persist as one human-readable JSON file each under
//! `<data_root>/projects/`; unknown keys in a record survive rewrite, and a
//! malformed file is logged and skipped rather than crashing a listing.
//! Development events append to a `<project_id>.events.jsonl` sidecar.
//!
//! The focused-project selector lives in `focus.json`. At most one project
//! is focused at a time; focus changes are serialised under the registry
//! lock and written in a single file replace.

use crate::core::error::TidepoolError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub const FOCUS_FILE: &str = "focus.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Paused,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A tracked decision. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub text: String,
    pub reasoning: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub alternatives: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Objective {
    pub objective_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Priority,
    pub status: ObjectiveStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Project record as persisted. Unknown keys round-trip through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub root_path: PathBuf,
    pub status: ProjectStatus,
    #[serde(default)]
    pub description: String,
    pub created_at: String,
    pub last_active: String,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub objectives: Vec<Objective>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

/// Append-only per-project development event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevelopmentEvent {
    pub event_id: String,
    pub ts: String,
    pub event_type: String,
    pub severity: EventSeverity,
    #[serde(default)]
    pub payload: JsonMap<String, JsonValue>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FocusRecord {
    focused_project: Option<String>,
}

/// Exclusive owner of the project table.
pub struct ProjectRegistry {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl ProjectRegistry {
    pub fn new(dir: &Path) -> Result<Self, TidepoolError> {
        fs::create_dir_all(dir)?;
        Ok(ProjectRegistry {
            dir: dir.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn record_path(&self, project_id: &str) -> PathBuf {
        self.dir.join(format!("{project_id}.json"))
    }

    fn events_path(&self, project_id: &str) -> PathBuf {
        self.dir.join(format!("{project_id}.events.jsonl"))
    }

    fn write_record(&self, project: &Project) -> Result<(), TidepoolError> {
        let bytes = serde_json::to_vec_pretty(project)?;
        fs::write(self.record_path(&project.project_id), bytes)?;
        Ok(())
    }

    fn read_record(&self, project_id: &str) -> Result<Project, TidepoolError> {
        let path = self.record_path(project_id);
        if !path.exists() {
            return Err(TidepoolError::NotFound(format!("project {project_id}")));
        }
        let raw = fs::read(&path)?;
        serde_json::from_slice(&raw).map_err(|e| {
            TidepoolError::Integrity(format!("project record {project_id} is malformed: {e}"))
        })
    }

    fn read_focus(&self) -> FocusRecord {
        let path = self.dir.join(FOCUS_FILE);
        match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => FocusRecord::default(),
        }
    }

    fn write_focus(&self, record: &FocusRecord) -> Result<(), TidepoolError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(self.dir.join(FOCUS_FILE), bytes)?;
        Ok(())
    }

    /// Create a project. The root path must exist at creation time (it may
    /// later become invalid; the project then remains, flagged by callers).
    pub fn create(
        &self,
        name: &str,
        root_path: &Path,
        description: &str,
    ) -> Result<Project, TidepoolError> {
        if name.trim().is_empty() {
            return Err(TidepoolError::InvalidInput("project name is empty".into()));
        }
        if !root_path.is_absolute() {
            return Err(TidepoolError::InvalidInput(format!(
                "root_path must be absolute: {}",
                root_path.display()
            )));
        }
        if !root_path.exists() {
            return Err(TidepoolError::InvalidInput(format!(
                "root_path does not exist: {}",
                root_path.display()
            )));
        }
        let _guard = self.lock.lock().expect("registry lock");
        let now = time::now_iso();
        let project = Project {
            project_id: time::short_id("proj"),
            name: name.trim().to_string(),
            root_path: root_path.to_path_buf(),
            status: ProjectStatus::Active,
            description: description.to_string(),
            created_at: now.clone(),
            last_active: now,
            decisions: Vec::new(),
            objectives: Vec::new(),
            extra: JsonMap::new(),
        };
        self.write_record(&project)?;
        Ok(project)
    }

    /// List all readable project records, sorted by id. Malformed files are
    /// logged and skipped.
    pub fn list(&self) -> Result<Vec<Project>, TidepoolError> {
        let _guard = self.lock.lock().expect("registry lock");
        let mut projects = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") || name == FOCUS_FILE {
                continue;
            }
            let raw = match fs::read(&path) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable project record");
                    continue;
                }
            };
            match serde_json::from_slice::<Project>(&raw) {
                Ok(project) => projects.push(project),
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping malformed project record");
                }
            }
        }
        projects.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(projects)
    }

    pub fn get(&self, project_id: &str) -> Result<Project, TidepoolError> {
        let _guard = self.lock.lock().expect("registry lock");
        self.read_record(project_id)
    }

    /// The focused project id, if the selector points at a live project.
    pub fn focused(&self) -> Option<String> {
        let _guard = self.lock.lock().expect("registry lock");
        let focus = self.read_focus();
        focus
            .focused_project
            .filter(|id| self.record_path(id).exists())
    }

    /// Focus a project. Returns `true` when focus actually changed (callers
    /// emit `focus_changed` only then, so focusing the focused project is a
    /// no-op with no event).
    pub fn focus(&self, project_id: &str) -> Result<bool, TidepoolError> {
        let _guard = self.lock.lock().expect("registry lock");
        let project = self.read_record(project_id)?;
        if project.status == ProjectStatus::Archived {
            return Err(TidepoolError::StateConflict(format!(
                "project {project_id} is archived and cannot be focused"
            )));
        }
        let current = self.read_focus();
        if current.focused_project.as_deref() == Some(project_id) {
            return Ok(false);
        }
        self.write_focus(&FocusRecord {
            focused_project: Some(project_id.to_string()),
        })?;
        Ok(true)
    }

    fn transition(
        &self,
        project_id: &str,
        from: &[ProjectStatus],
        to: ProjectStatus,
    ) -> Result<Project, TidepoolError> {
        let _guard = self.lock.lock().expect("registry lock");
        let mut project = self.read_record(project_id)?;
        if !from.contains(&project.status) {
            return Err(TidepoolError::StateConflict(format!(
                "project {project_id} is {:?} and cannot become {:?}",
                project.status, to
            )));
        }
        project.status = to;
        project.last_active = time::now_iso();
        self.write_record(&project)?;
        if to == ProjectStatus::Archived {
            let focus = self.read_focus();
            if focus.focused_project.as_deref() == Some(project_id) {
                self.write_focus(&FocusRecord::default())?;
            }
        }
        Ok(project)
    }

    pub fn pause(&self, project_id: &str) -> Result<Project, TidepoolError> {
        self.transition(project_id, &[ProjectStatus::Active], ProjectStatus::Paused)
    }

    pub fn resume(&self, project_id: &str) -> Result<Project, TidepoolError> {
        self.transition(project_id, &[ProjectStatus::Paused], ProjectStatus::Active)
    }

    pub fn archive(&self, project_id: &str) -> Result<Project, TidepoolError> {
        self.transition(
            project_id,
            &[ProjectStatus::Active, ProjectStatus::Paused],
            ProjectStatus::Archived,
        )
    }

    /// Delete a project record and its events. Returns the removed record so
    /// the caller can drop the project's collections.
    pub fn delete(&self, project_id: &str) -> Result<Project, TidepoolError> {
        let _guard = self.lock.lock().expect("registry lock");
        let project = self.read_record(project_id)?;
        fs::remove_file(self.record_path(project_id))?;
        let events = self.events_path(project_id);
        if events.exists() {
            fs::remove_file(events)?;
        }
        let focus = self.read_focus();
        if focus.focused_project.as_deref() == Some(project_id) {
            self.write_focus(&FocusRecord::default())?;
        }
        Ok(project)
    }

    /// Record a decision. Tags must not contain commas (they are stored
    /// comma-joined in vector metadata).
    pub fn add_decision(
        &self,
        project_id: &str,
        text: &str,
        reasoning: &str,
        tags: &[String],
        alternatives: &[String],
    ) -> Result<Decision, TidepoolError> {
        if text.trim().is_empty() {
            return Err(TidepoolError::InvalidInput("decision text is empty".into()));
        }
        if let Some(bad) = tags.iter().find(|t| t.contains(',')) {
            return Err(TidepoolError::InvalidInput(format!(
                "tag '{bad}' contains a comma"
            )));
        }
        let _guard = self.lock.lock().expect("registry lock");
        let mut project = self.read_record(project_id)?;
        let decision = Decision {
            decision_id: time::short_id("dec"),
            text: text.trim().to_string(),
            reasoning: reasoning.to_string(),
            tags: tags.to_vec(),
            alternatives: alternatives.to_vec(),
            created_at: time::now_iso(),
        };
        project.decisions.push(decision.clone());
        project.last_active = time::now_iso();
        self.write_record(&project)?;
        Ok(decision)
    }

    pub fn add_objective(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        priority: Priority,
    ) -> Result<Objective, TidepoolError> {
        if title.trim().is_empty() {
            return Err(TidepoolError::InvalidInput("objective title is empty".into()));
        }
        let _guard = self.lock.lock().expect("registry lock");
        let mut project = self.read_record(project_id)?;
        let objective = Objective {
            objective_id: time::short_id("obj"),
            title: title.trim().to_string(),
            description: description.to_string(),
            priority,
            status: ObjectiveStatus::Pending,
            created_at: time::now_iso(),
            completed_at: None,
        };
        project.objectives.push(objective.clone());
        project.last_active = time::now_iso();
        self.write_record(&project)?;
        Ok(objective)
    }

    /// Objectives move pending → completed, once.
    pub fn complete_objective(
        &self,
        project_id: &str,
        objective_id: &str,
    ) -> Result<Objective, TidepoolError> {
        let _guard = self.lock.lock().expect("registry lock");
        let mut project = self.read_record(project_id)?;
        let objective = project
            .objectives
            .iter_mut()
            .find(|o| o.objective_id == objective_id)
            .ok_or_else(|| TidepoolError::NotFound(format!("objective {objective_id}")))?;
        if objective.status == ObjectiveStatus::Completed {
            return Err(TidepoolError::StateConflict(format!(
                "objective {objective_id} is already completed"
            )));
        }
        objective.status = ObjectiveStatus::Completed;
        objective.completed_at = Some(time::now_iso());
        let done = objective.clone();
        project.last_active = time::now_iso();
        self.write_record(&project)?;
        Ok(done)
    }

    /// Append a development event to the project's event log.
    pub fn record_event(
        &self,
        project_id: &str,
        event_type: &str,
        severity: EventSeverity,
        payload: JsonMap<String, JsonValue>,
    ) -> Result<DevelopmentEvent, TidepoolError> {
        let _guard = self.lock.lock().expect("registry lock");
        // Ensure the project exists before appending.
        self.read_record(project_id)?;
        let event = DevelopmentEvent {
            event_id: time::new_event_id(),
            ts: time::now_iso(),
            event_type: event_type.to_string(),
            severity,
            payload,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(project_id))?;
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(event)
    }

    /// Most recent development events, newest last, capped at `limit`.
    pub fn recent_events(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<DevelopmentEvent>, TidepoolError> {
        let _guard = self.lock.lock().expect("registry lock");
        let path = self.events_path(project_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DevelopmentEvent>(&line) {
                Ok(event) => events.push(event),
                Err(err) => warn!(project_id, %err, "skipping malformed event line"),
            }
        }
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }

    /// Refresh a project's last-active timestamp (queries and ingests).
    pub fn touch(&self, project_id: &str) -> Result<(), TidepoolError> {
        let _guard = self.lock.lock().expect("registry lock");
        let mut project = self.read_record(project_id)?;
        project.last_active = time::now_iso();
        self.write_record(&project)
    }
}
