//! Sacred plan store.
//!
//! Exclusive owner of plan records and the approval state machine. Plans are
//! content-addressed (SHA-256 over canonical bytes) and stored twice: as a
//! discrete record plus canonical content file under
//! `<data_root>/sacred_plans/`, and as an embedded chunk set in the
//! project's `sacred_*` collection. Approval takes two factors (the
//! deterministic verification code derived at creation, plus the out-of-band
//! approval key) and makes a plan's content immutable.
//!
//! Approval and supersession rewrite chunk metadata in the collection. The
//! record write and metadata rewrite are bracketed by a pending-commit
//! marker; `reconcile_pending` re-applies the rewrite at startup if a crash
//! left a marker behind.

use crate::core::chunker::{self, Chunker, ManifestEntry};
use crate::core::embed::Embedder;
use crate::core::error::TidepoolError;
use crate::core::time;
use crate::core::vector::{sacred_collection, VectorEntry, VectorStore};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

pub const PLAN_SCHEMA_VERSION: u32 = 1;

/// Approval method recorded on success.
pub const APPROVAL_METHOD_TWO_FACTOR: &str = "two_factor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    PendingApproval,
    Approved,
    Superseded,
    Archived,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::PendingApproval => "pending_approval",
            PlanStatus::Approved => "approved",
            PlanStatus::Superseded => "superseded",
            PlanStatus::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<PlanStatus> {
        match raw {
            "draft" => Some(PlanStatus::Draft),
            "pending_approval" => Some(PlanStatus::PendingApproval),
            "approved" => Some(PlanStatus::Approved),
            "superseded" => Some(PlanStatus::Superseded),
            "archived" => Some(PlanStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approver: String,
    pub approved_at: String,
    pub method: String,
}

/// Persisted plan record (metadata only; content lives in the sidecar file
/// and the sacred collection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRecord {
    pub schema_version: u32,
    pub plan_id: String,
    pub project_id: String,
    pub title: String,
    pub content_hash: String,
    pub verification_code: String,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    pub created_at: String,
    pub chunk_manifest: Vec<ManifestEntry>,
}

/// A plan with its reconstructed content.
#[derive(Debug, Clone)]
pub struct PlanWithContent {
    pub record: PlanRecord,
    pub content: String,
}

/// One sacred query hit.
#[derive(Debug, Clone, Serialize)]
pub struct SacredHit {
    pub plan_id: String,
    pub title: String,
    pub chunk: String,
    pub ordinal: usize,
    pub score: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingCommit {
    plan_id: String,
    set_status: String,
}

/// Aggregated governance metrics for `/analytics/sacred`.
#[derive(Debug, Serialize)]
pub struct SacredAnalytics {
    pub total_plans: usize,
    pub by_status: JsonMap<String, JsonValue>,
    pub created_in_window: usize,
    pub approved_in_window: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_approval_latency_secs: Option<f64>,
    pub projects: Vec<ProjectPlanCounts>,
    pub timeframe_hours: u64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ProjectPlanCounts {
    pub project_id: String,
    pub total: usize,
    pub approved: usize,
}

/// Constant-time byte comparison; length difference folds into the result.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = (a.len() ^ b.len()) as u8;
    let n = a.len().min(b.len());
    for i in 0..n {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

/// Deterministic first approval factor: twelve hash hex chars plus the UTC
/// creation date. Stable across restarts.
pub fn derive_verification_code(content_hash: &str, created_epoch: i64) -> String {
    format!(
        "{}-{}",
        &content_hash[..12.min(content_hash.len())],
        time::date_token(created_epoch)
    )
}

/// Exclusive owner of sacred plans.
pub struct SacredStore {
    dir: PathBuf,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    approval_key: String,
    chunker: Chunker,
    plan_locks: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
}

impl SacredStore {
    pub fn new(
        dir: &Path,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        approval_key: &str,
        chunker: Chunker,
    ) -> Result<Self, TidepoolError> {
        fs::create_dir_all(dir)?;
        Ok(SacredStore {
            dir: dir.to_path_buf(),
            vectors,
            embedder,
            approval_key: approval_key.to_string(),
            chunker,
            plan_locks: Mutex::new(FxHashMap::default()),
        })
    }

    fn record_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.json"))
    }

    fn content_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.content"))
    }

    fn pending_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.pending"))
    }

    fn plan_lock(&self, plan_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.plan_locks.lock().expect("plan lock table");
        locks
            .entry(plan_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load_record(&self, plan_id: &str) -> Result<PlanRecord, TidepoolError> {
        let path = self.record_path(plan_id);
        if !path.exists() {
            return Err(TidepoolError::NotFound(format!("plan {plan_id}")));
        }
        let raw = fs::read(&path)?;
        // Peek at the schema version before committing to the full shape;
        // records written by a newer Tidepool must be refused, not guessed at.
        let probe: JsonValue = serde_json::from_slice(&raw)?;
        let version = probe
            .get("schema_version")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0) as u32;
        if version > PLAN_SCHEMA_VERSION {
            return Err(TidepoolError::Integrity(format!(
                "plan {plan_id} has schema version {version}; this build reads up to {PLAN_SCHEMA_VERSION}"
            )));
        }
        serde_json::from_slice(&raw)
            .map_err(|e| TidepoolError::Integrity(format!("plan record {plan_id} is malformed: {e}")))
    }

    fn save_record(&self, record: &PlanRecord) -> Result<(), TidepoolError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        fs::write(self.record_path(&record.plan_id), bytes)?;
        Ok(())
    }

    fn scan_records(&self) -> Result<Vec<PlanRecord>, TidepoolError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(plan_id) = name.strip_suffix(".json") else {
                continue;
            };
            match self.load_record(plan_id) {
                Ok(record) => records.push(record),
                Err(err) => warn!(plan_id, %err, "skipping unreadable plan record"),
            }
        }
        records.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));
        Ok(records)
    }

    /// Create a draft plan from canonicalised content.
    ///
    /// Fails `AlreadyExists` when the content hash collides with a live
    /// (non-archived, non-superseded) plan in the same project.
    pub async fn create_plan(
        &self,
        project_id: &str,
        title: &str,
        content: &str,
    ) -> Result<PlanRecord, TidepoolError> {
        if title.trim().is_empty() {
            return Err(TidepoolError::InvalidInput("plan title is empty".into()));
        }
        let canonical = chunker::canonicalize(content);
        if canonical.trim().is_empty() {
            return Err(TidepoolError::InvalidInput("plan content is empty".into()));
        }
        let content_hash = chunker::sha256_hex(&canonical);

        for existing in self.scan_records()? {
            let live = matches!(
                existing.status,
                PlanStatus::Draft | PlanStatus::PendingApproval | PlanStatus::Approved
            );
            if live && existing.project_id == project_id && existing.content_hash == content_hash {
                return Err(TidepoolError::AlreadyExists(format!(
                    "plan {} already holds this content",
                    existing.plan_id
                )));
            }
        }

        let plan_id = time::short_id("plan");
        let created_epoch = time::now_epoch() as i64;
        let verification_code = derive_verification_code(&content_hash, created_epoch);
        let (chunks, manifest) = self.chunker.chunk_with_manifest(&canonical);

        // Embed before touching any persistent state; the long call must not
        // sit inside the store's critical sections.
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let collection = self.vectors.open(&sacred_collection(project_id))?;
        let entries: Vec<VectorEntry> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                let mut metadata = JsonMap::new();
                metadata.insert("plan_id".into(), JsonValue::String(plan_id.clone()));
                metadata.insert("ordinal".into(), JsonValue::from(chunk.ordinal));
                metadata.insert("status".into(), JsonValue::String("draft".into()));
                metadata.insert("type".into(), JsonValue::String("sacred_plan".into()));
                metadata.insert("title".into(), JsonValue::String(title.trim().to_string()));
                VectorEntry {
                    id: format!("{plan_id}:{}", chunk.ordinal),
                    source_path: plan_id.clone(),
                    ordinal: chunk.ordinal,
                    content: chunk.text.clone(),
                    embedding,
                    metadata,
                    content_hash: chunk.hash.clone(),
                }
            })
            .collect();

        fs::write(self.content_path(&plan_id), canonical.as_bytes())?;
        if let Err(err) = collection.insert(&entries) {
            let _ = fs::remove_file(self.content_path(&plan_id));
            return Err(err);
        }

        let record = PlanRecord {
            schema_version: PLAN_SCHEMA_VERSION,
            plan_id: plan_id.clone(),
            project_id: project_id.to_string(),
            title: title.trim().to_string(),
            content_hash,
            verification_code,
            status: PlanStatus::Draft,
            approval: None,
            supersedes: None,
            created_at: time::epoch_to_iso(created_epoch),
            chunk_manifest: manifest,
        };
        if let Err(err) = self.save_record(&record) {
            let _ = collection.delete_source(&plan_id);
            let _ = fs::remove_file(self.content_path(&plan_id));
            return Err(err);
        }
        info!(%plan_id, project_id, "created sacred plan");
        Ok(record)
    }

    /// List plan metadata for a project. Archived plans are excluded unless
    /// asked for explicitly.
    pub fn list_plans(
        &self,
        project_id: &str,
        status_filter: Option<PlanStatus>,
    ) -> Result<Vec<PlanRecord>, TidepoolError> {
        Ok(self
            .scan_records()?
            .into_iter()
            .filter(|r| r.project_id == project_id)
            .filter(|r| match status_filter {
                Some(status) => r.status == status,
                None => r.status != PlanStatus::Archived,
            })
            .collect())
    }

    /// Fetch a plan with content reassembled from its collection chunks.
    ///
    /// The reconstructed bytes must hash to the stored content hash; a
    /// mismatch is an integrity fault for this plan and is never repaired
    /// silently.
    pub fn get_plan(&self, plan_id: &str) -> Result<PlanWithContent, TidepoolError> {
        let record = self.load_record(plan_id)?;
        let collection = self
            .vectors
            .open(&sacred_collection(&record.project_id))?;
        let mut stored = collection.entries_where("plan_id", plan_id)?;
        stored.sort_by_key(|e| e.ordinal);

        let mut parts: Vec<(ManifestEntry, String)> = Vec::with_capacity(stored.len());
        for entry in &record.chunk_manifest {
            let chunk = stored
                .iter()
                .find(|s| s.ordinal == entry.ordinal)
                .ok_or_else(|| {
                    TidepoolError::Integrity(format!(
                        "plan {plan_id} is missing chunk {} in its collection",
                        entry.ordinal
                    ))
                })?;
            parts.push((entry.clone(), chunk.content.clone()));
        }
        let content = chunker::reconstruct(&parts)?;
        let reconstructed_hash = chunker::sha256_hex(&content);
        if reconstructed_hash != record.content_hash {
            error!(
                plan_id,
                expected = %record.content_hash,
                actual = %reconstructed_hash,
                "plan content failed hash validation"
            );
            return Err(TidepoolError::Integrity(format!(
                "plan {plan_id} content hash mismatch"
            )));
        }
        Ok(PlanWithContent { record, content })
    }

    /// draft → pending_approval.
    pub fn submit_for_approval(&self, plan_id: &str) -> Result<PlanRecord, TidepoolError> {
        let lock = self.plan_lock(plan_id);
        let _guard = lock.lock().expect("plan lock");
        let mut record = self.load_record(plan_id)?;
        match record.status {
            PlanStatus::Draft => {}
            PlanStatus::Approved => {
                return Err(TidepoolError::Immutable(format!(
                    "plan {plan_id} is approved"
                )))
            }
            other => {
                return Err(TidepoolError::StateConflict(format!(
                    "plan {plan_id} is {} and cannot be submitted",
                    other.as_str()
                )))
            }
        }
        record.status = PlanStatus::PendingApproval;
        self.save_record(&record)?;
        Ok(record)
    }

    /// Two-factor approval. Both factors must match (constant-time, no
    /// short-circuit); on success the record and every chunk's metadata move
    /// to `approved` as one logical transaction.
    pub fn approve_plan(
        &self,
        plan_id: &str,
        verification_code: &str,
        secondary_key: &str,
        approver: &str,
    ) -> Result<PlanRecord, TidepoolError> {
        if approver.trim().is_empty() {
            return Err(TidepoolError::InvalidInput("approver is empty".into()));
        }
        let lock = self.plan_lock(plan_id);
        let _guard = lock.lock().expect("plan lock");
        let mut record = self.load_record(plan_id)?;
        match record.status {
            PlanStatus::Draft | PlanStatus::PendingApproval => {}
            PlanStatus::Approved => {
                return Err(TidepoolError::Immutable(format!(
                    "plan {plan_id} is already approved"
                )))
            }
            other => {
                return Err(TidepoolError::StateConflict(format!(
                    "plan {plan_id} is {} and cannot be approved",
                    other.as_str()
                )))
            }
        }

        let code_ok = constant_time_eq(verification_code, &record.verification_code);
        let key_ok = constant_time_eq(secondary_key, &self.approval_key);
        if !(code_ok & key_ok) {
            return Err(TidepoolError::VerificationFailed(
                "approval factors do not match".into(),
            ));
        }

        self.write_pending(plan_id, PlanStatus::Approved)?;
        record.status = PlanStatus::Approved;
        record.approval = Some(ApprovalRecord {
            approver: approver.trim().to_string(),
            approved_at: time::now_iso(),
            method: APPROVAL_METHOD_TWO_FACTOR.to_string(),
        });
        self.save_record(&record)?;
        self.apply_chunk_status(&record.project_id, plan_id, PlanStatus::Approved)?;
        self.clear_pending(plan_id)?;
        info!(plan_id, approver, "approved sacred plan");
        Ok(record)
    }

    /// Mark `old` superseded by `new`. Both must be approved; the
    /// `supersedes` chain stays acyclic.
    pub fn supersede(&self, old_plan_id: &str, new_plan_id: &str) -> Result<(), TidepoolError> {
        if old_plan_id == new_plan_id {
            return Err(TidepoolError::InvalidInput(
                "a plan cannot supersede itself".into(),
            ));
        }
        let lock = self.plan_lock(old_plan_id);
        let _guard = lock.lock().expect("plan lock");
        let mut old = self.load_record(old_plan_id)?;
        let mut new = self.load_record(new_plan_id)?;
        if old.status != PlanStatus::Approved {
            return Err(TidepoolError::StateConflict(format!(
                "plan {old_plan_id} is {} and cannot be superseded",
                old.status.as_str()
            )));
        }
        if new.status != PlanStatus::Approved {
            return Err(TidepoolError::StateConflict(format!(
                "plan {new_plan_id} is {} and cannot supersede",
                new.status.as_str()
            )));
        }

        // Walk the chain from `old`; finding `new` would close a cycle.
        let mut seen = HashSet::new();
        let mut cursor = old.supersedes.clone();
        while let Some(next_id) = cursor {
            if next_id == new_plan_id {
                return Err(TidepoolError::StateConflict(
                    "supersession would create a cycle".into(),
                ));
            }
            if !seen.insert(next_id.clone()) {
                return Err(TidepoolError::Integrity(
                    "supersedes chain already contains a cycle".into(),
                ));
            }
            cursor = self.load_record(&next_id)?.supersedes;
        }

        self.write_pending(old_plan_id, PlanStatus::Superseded)?;
        old.status = PlanStatus::Superseded;
        self.save_record(&old)?;
        self.apply_chunk_status(&old.project_id, old_plan_id, PlanStatus::Superseded)?;
        self.clear_pending(old_plan_id)?;

        new.supersedes = Some(old_plan_id.to_string());
        self.save_record(&new)?;
        info!(old_plan_id, new_plan_id, "superseded sacred plan");
        Ok(())
    }

    /// Move a non-terminal plan to `archived`; it drops out of default
    /// listings and retrieval.
    pub fn archive_plan(&self, plan_id: &str) -> Result<PlanRecord, TidepoolError> {
        let lock = self.plan_lock(plan_id);
        let _guard = lock.lock().expect("plan lock");
        let mut record = self.load_record(plan_id)?;
        match record.status {
            PlanStatus::Draft | PlanStatus::PendingApproval | PlanStatus::Approved => {}
            other => {
                return Err(TidepoolError::StateConflict(format!(
                    "plan {plan_id} is {} and cannot be archived",
                    other.as_str()
                )))
            }
        }
        self.write_pending(plan_id, PlanStatus::Archived)?;
        record.status = PlanStatus::Archived;
        self.save_record(&record)?;
        self.apply_chunk_status(&record.project_id, plan_id, PlanStatus::Archived)?;
        self.clear_pending(plan_id)?;
        Ok(record)
    }

    /// Semantic search across a project's approved plan chunks.
    pub async fn query_plans(
        &self,
        project_id: &str,
        query_text: &str,
        k: usize,
    ) -> Result<Vec<SacredHit>, TidepoolError> {
        if query_text.trim().is_empty() {
            return Err(TidepoolError::InvalidInput("query is empty".into()));
        }
        let name = sacred_collection(project_id);
        if !self.vectors.exists(&name) {
            return Ok(Vec::new());
        }
        let query = self
            .embedder
            .embed(&[query_text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TidepoolError::DependencyUnavailable("empty embedding batch".into()))?;
        let collection = self.vectors.open(&name)?;
        let hits = collection.search(&query, k, Some(("status", "approved")))?;
        Ok(hits
            .into_iter()
            .map(|hit| SacredHit {
                plan_id: hit.source_path.clone(),
                title: hit
                    .metadata
                    .get("title")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                chunk: hit.content,
                ordinal: hit.ordinal,
                score: hit.score,
            })
            .collect())
    }

    /// Approved, non-superseded plans with reconstructed content. Plans that
    /// fail reconstruction are excluded with a warning (collected into
    /// `warnings`), not fatal to the caller.
    pub fn approved_plans(
        &self,
        project_id: &str,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<PlanWithContent>, TidepoolError> {
        let mut plans = Vec::new();
        for record in self.list_plans(project_id, Some(PlanStatus::Approved))? {
            match self.get_plan(&record.plan_id) {
                Ok(plan) => plans.push(plan),
                Err(err) => {
                    warn!(plan_id = %record.plan_id, %err, "excluding plan from drift analysis");
                    warnings.push(format!(
                        "plan {} excluded: {err}",
                        record.plan_id
                    ));
                }
            }
        }
        Ok(plans)
    }

    /// Stored chunk vectors for a project's approved plans, ordinal-ordered.
    pub fn approved_chunks(
        &self,
        project_id: &str,
    ) -> Result<Vec<crate::core::vector::StoredEntry>, TidepoolError> {
        let name = sacred_collection(project_id);
        if !self.vectors.exists(&name) {
            return Ok(Vec::new());
        }
        let collection = self.vectors.open(&name)?;
        let mut entries = collection.entries_where("status", "approved")?;
        entries.sort_by(|a, b| {
            a.source_path
                .cmp(&b.source_path)
                .then(a.ordinal.cmp(&b.ordinal))
        });
        Ok(entries)
    }

    fn write_pending(&self, plan_id: &str, status: PlanStatus) -> Result<(), TidepoolError> {
        let marker = PendingCommit {
            plan_id: plan_id.to_string(),
            set_status: status.as_str().to_string(),
        };
        fs::write(
            self.pending_path(plan_id),
            serde_json::to_vec_pretty(&marker)?,
        )?;
        Ok(())
    }

    fn clear_pending(&self, plan_id: &str) -> Result<(), TidepoolError> {
        let path = self.pending_path(plan_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn apply_chunk_status(
        &self,
        project_id: &str,
        plan_id: &str,
        status: PlanStatus,
    ) -> Result<(), TidepoolError> {
        let collection = self.vectors.open(&sacred_collection(project_id))?;
        collection.rewrite_metadata("plan_id", plan_id, "status", status.as_str())?;
        Ok(())
    }

    /// Startup reconciliation: re-apply chunk-metadata rewrites for any
    /// pending-commit marker left by a crash mid-transition.
    pub fn reconcile_pending(&self) -> Result<usize, TidepoolError> {
        let mut reconciled = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(plan_id) = name.strip_suffix(".pending") else {
                continue;
            };
            let raw = fs::read(entry.path())?;
            let marker: PendingCommit = match serde_json::from_slice(&raw) {
                Ok(marker) => marker,
                Err(err) => {
                    warn!(plan_id, %err, "removing unreadable pending marker");
                    fs::remove_file(entry.path())?;
                    continue;
                }
            };
            let Some(status) = PlanStatus::parse(&marker.set_status) else {
                warn!(plan_id, status = %marker.set_status, "removing invalid pending marker");
                fs::remove_file(entry.path())?;
                continue;
            };
            match self.load_record(&marker.plan_id) {
                Ok(record) if record.status == status => {
                    self.apply_chunk_status(&record.project_id, &marker.plan_id, status)?;
                    info!(plan_id = %marker.plan_id, status = status.as_str(), "reconciled pending commit");
                    reconciled += 1;
                }
                Ok(_) | Err(_) => {
                    // Record never reached the target state; the prior status
                    // stands and the marker is stale.
                    warn!(plan_id = %marker.plan_id, "discarding stale pending marker");
                }
            }
            fs::remove_file(entry.path())?;
        }
        Ok(reconciled)
    }

    /// Aggregated plan metrics over a trailing window.
    pub fn analytics(
        &self,
        timeframe_hours: u64,
        project_filter: Option<&str>,
    ) -> Result<SacredAnalytics, TidepoolError> {
        let cutoff = time::now_epoch() as i64 - (timeframe_hours as i64) * 3600;
        let parse_epoch = |iso: &str| {
            chrono::DateTime::parse_from_rfc3339(iso)
                .map(|dt| dt.timestamp())
                .unwrap_or(0)
        };

        let records: Vec<PlanRecord> = self
            .scan_records()?
            .into_iter()
            .filter(|r| project_filter.is_none_or(|p| r.project_id == p))
            .collect();

        let mut by_status = JsonMap::new();
        let mut created_in_window = 0;
        let mut approved_in_window = 0;
        let mut latencies = Vec::new();
        let mut per_project: FxHashMap<String, (usize, usize)> = FxHashMap::default();

        for record in &records {
            let key = record.status.as_str().to_string();
            let count = by_status.get(&key).and_then(JsonValue::as_u64).unwrap_or(0);
            by_status.insert(key, JsonValue::from(count + 1));

            let created = parse_epoch(&record.created_at);
            if created >= cutoff {
                created_in_window += 1;
            }
            let counts = per_project.entry(record.project_id.clone()).or_default();
            counts.0 += 1;
            if let Some(approval) = &record.approval {
                counts.1 += 1;
                let approved = parse_epoch(&approval.approved_at);
                if approved >= cutoff {
                    approved_in_window += 1;
                }
                if approved >= created {
                    latencies.push((approved - created) as f64);
                }
            }
        }

        let mut projects: Vec<ProjectPlanCounts> = per_project
            .into_iter()
            .map(|(project_id, (total, approved))| ProjectPlanCounts {
                project_id,
                total,
                approved,
            })
            .collect();
        projects.sort_by(|a, b| a.project_id.cmp(&b.project_id));

        let avg_approval_latency_secs = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        Ok(SacredAnalytics {
            total_plans: records.len(),
            by_status,
            created_in_window,
            approved_in_window,
            avg_approval_latency_secs,
            projects,
            timeframe_hours,
            timestamp: time::now_iso(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_behaves() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc", "abc123"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn verification_code_is_deterministic() {
        let hash = "deadbeefcafe0123456789";
        let a = derive_verification_code(hash, 1_785_542_400);
        let b = derive_verification_code(hash, 1_785_542_400);
        assert_eq!(a, b);
        assert_eq!(a, "deadbeefcafe-20260801");
        // A different creation date yields a different code for the same hash.
        assert_ne!(a, derive_verification_code(hash, 0));
    }

    #[test]
    fn plan_status_round_trips() {
        for status in [
            PlanStatus::Draft,
            PlanStatus::PendingApproval,
            PlanStatus::Approved,
            PlanStatus::Superseded,
            PlanStatus::Archived,
        ] {
            assert_eq!(PlanStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PlanStatus::parse("blessed"), None);
    }

    #[test]
    fn record_serialization_includes_schema_version() {
        let record = PlanRecord {
            schema_version: PLAN_SCHEMA_VERSION,
            plan_id: "plan_1".into(),
            project_id: "proj_1".into(),
            title: "DB choice".into(),
            content_hash: "abc".into(),
            verification_code: "abc-20260801".into(),
            status: PlanStatus::Draft,
            approval: None,
            supersedes: None,
            created_at: time::now_iso(),
            chunk_manifest: vec![],
        };
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["status"], "draft");
        assert!(value.get("approval").is_none());
    }
}
