//! Drift detection.
//!
//! Correlates recent development signals (git commits, changed paths,
//! working-tree state, logged retrieval queries) with the semantic content
//! of approved sacred plans, and scores how well development tracks the
//! approved architecture.
//!
//! Scoring is deterministic for identical inputs: no randomness, stable
//! iteration orders, similarity ties broken on (plan_id, ordinal).
//!
//! Violation detection separates a plan's *directives* ("must not",
//! "never", "forbidden" sentences) from its positive content: an activity
//! item is flagged when it is semantically far from every plan's positive
//! content (below the floor) yet close to a directive (above the ceiling).
//! Comparing against the full plan text instead would let the directive's
//! own wording mask the contradiction it forbids.

use crate::core::chunker;
use crate::core::embed::Embedder;
use crate::core::error::TidepoolError;
use crate::core::git::{self, GitActivity};
use crate::core::project::ProjectRegistry;
use crate::core::retrieval::RetrievalEngine;
use crate::core::sacred::SacredStore;
use crate::core::time;
use crate::core::vector::cosine;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::info;

pub const DEFAULT_WINDOW_HOURS: u64 = 24;

/// Alignment classification thresholds.
pub const ALIGNED_THRESHOLD: f32 = 0.80;
pub const MINOR_DRIFT_THRESHOLD: f32 = 0.60;
pub const MODERATE_DRIFT_THRESHOLD: f32 = 0.40;

/// Violation detection bounds.
pub const VIOLATION_FLOOR: f32 = 0.25;
pub const VIOLATION_CEILING: f32 = 0.55;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Aligned,
    MinorDrift,
    ModerateDrift,
    CriticalViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub plan_id: String,
    /// Commit hash, path, or query that triggered the flag.
    pub evidence: String,
    pub severity: ViolationSeverity,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanAdherence {
    pub plan_id: String,
    pub title: String,
    pub score: f32,
}

/// Full analysis result served by `GET /sacred/drift/{project_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct DriftAnalysis {
    pub project_id: String,
    pub window_hours: u64,
    pub alignment_score: f32,
    pub status: DriftStatus,
    pub violations: Vec<Violation>,
    pub recommendations: Vec<String>,
    pub plan_adherence: Vec<PlanAdherence>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivityKind {
    Commit,
    Path,
    Query,
}

struct ActivityItem {
    kind: ActivityKind,
    text: String,
    evidence: String,
    epoch: i64,
    /// Cache key; commit messages cache by commit hash.
    cache_key: String,
}

fn forbidden_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(must not|never|forbidden|do not|don't)\b").expect("pattern compiles")
    })
}

/// Split plan prose into sentences on terminators and line breaks.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    for line in text.lines() {
        let mut current = String::new();
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            if matches!(c, '.' | '!' | '?')
                && chars.peek().map(|n| n.is_whitespace()).unwrap_or(true)
            {
                let trimmed = current.trim();
                if trimmed.len() > 3 {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
        let trimmed = current.trim();
        if trimmed.len() > 3 {
            sentences.push(trimmed.to_string());
        }
    }
    sentences
}

fn classify(alignment: f32) -> DriftStatus {
    if alignment >= ALIGNED_THRESHOLD {
        DriftStatus::Aligned
    } else if alignment >= MINOR_DRIFT_THRESHOLD {
        DriftStatus::MinorDrift
    } else if alignment >= MODERATE_DRIFT_THRESHOLD {
        DriftStatus::ModerateDrift
    } else {
        DriftStatus::CriticalViolation
    }
}

fn vacuous(project_id: &str, window_hours: u64, notes: Vec<String>) -> DriftAnalysis {
    DriftAnalysis {
        project_id: project_id.to_string(),
        window_hours,
        alignment_score: 1.0,
        status: DriftStatus::Aligned,
        violations: Vec::new(),
        recommendations: Vec::new(),
        plan_adherence: Vec::new(),
        notes,
        timestamp: time::now_iso(),
    }
}

/// Computes plan-vs-activity alignment for a project.
pub struct DriftEngine {
    sacred: Arc<SacredStore>,
    retrieval: Arc<RetrievalEngine>,
    projects: Arc<ProjectRegistry>,
    embedder: Arc<dyn Embedder>,
    /// Weight of commit-message items; changed-path items get the rest.
    commit_path_ratio: f32,
    embedding_cache: Mutex<FxHashMap<String, Vec<f32>>>,
}

impl DriftEngine {
    pub fn new(
        sacred: Arc<SacredStore>,
        retrieval: Arc<RetrievalEngine>,
        projects: Arc<ProjectRegistry>,
        embedder: Arc<dyn Embedder>,
        commit_path_ratio: f32,
    ) -> Self {
        DriftEngine {
            sacred,
            retrieval,
            projects,
            embedder,
            commit_path_ratio,
            embedding_cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Embed `texts`, reusing the cache keyed by the parallel `keys`.
    async fn embed_cached(
        &self,
        keys: &[String],
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, TidepoolError> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut missing_texts = Vec::new();
        let mut missing_slots = Vec::new();
        {
            let cache = self.embedding_cache.lock().expect("drift cache lock");
            for (i, key) in keys.iter().enumerate() {
                match cache.get(key) {
                    Some(vector) => out[i] = Some(vector.clone()),
                    None => {
                        missing_slots.push(i);
                        missing_texts.push(texts[i].clone());
                    }
                }
            }
        }
        if !missing_texts.is_empty() {
            let embedded = self.embedder.embed(&missing_texts).await?;
            let mut cache = self.embedding_cache.lock().expect("drift cache lock");
            for (slot, vector) in missing_slots.into_iter().zip(embedded) {
                cache.insert(keys[slot].clone(), vector.clone());
                out[slot] = Some(vector);
            }
        }
        Ok(out.into_iter().map(|v| v.expect("slot filled")).collect())
    }

    /// Run the full analysis over the trailing `window_hours`.
    pub async fn analyze(
        &self,
        project_id: &str,
        window_hours: u64,
    ) -> Result<DriftAnalysis, TidepoolError> {
        let window_hours = if window_hours == 0 {
            DEFAULT_WINDOW_HOURS
        } else {
            window_hours
        };
        let project = self.projects.get(project_id)?;
        let mut notes = Vec::new();

        let plans = self.sacred.approved_plans(project_id, &mut notes)?;
        if plans.is_empty() {
            notes.push("no approved plans; alignment is vacuously 1.0".into());
            return Ok(vacuous(project_id, window_hours, notes));
        }
        let chunks = self.sacred.approved_chunks(project_id)?;

        let root = project.root_path.clone();
        let activity = tokio::task::spawn_blocking(move || git::collect_activity(&root, window_hours))
            .await
            .map_err(|e| TidepoolError::Internal(format!("git activity task: {e}")))?;
        if !activity.available {
            notes.push("git activity unavailable for project root".into());
        }

        let now = time::now_epoch() as i64;
        let window_secs = (window_hours as i64) * 3600;
        let items = self.build_items(&activity, project_id, window_secs, now);
        if items.is_empty() {
            notes.push("no development activity in window; alignment is vacuously 1.0".into());
            return Ok(vacuous(project_id, window_hours, notes));
        }

        // One batched embedding round for every signal in play.
        let item_keys: Vec<String> = items.iter().map(|i| i.cache_key.clone()).collect();
        let item_texts: Vec<String> = items.iter().map(|i| i.text.clone()).collect();
        let item_vectors = self.embed_cached(&item_keys, &item_texts).await?;

        // Plan sentences, separated into directives and positive content.
        let mut directive_sentences: Vec<(String, String)> = Vec::new(); // (plan_id, sentence)
        let mut positive_sentences: Vec<String> = Vec::new();
        for plan in &plans {
            for sentence in split_sentences(&plan.content) {
                if forbidden_re().is_match(&sentence) {
                    directive_sentences.push((plan.record.plan_id.clone(), sentence));
                } else {
                    positive_sentences.push(sentence);
                }
            }
        }
        let directive_keys: Vec<String> = directive_sentences
            .iter()
            .map(|(_, s)| chunker::sha256_hex(s))
            .collect();
        let directive_texts: Vec<String> =
            directive_sentences.iter().map(|(_, s)| s.clone()).collect();
        let directive_vectors = self.embed_cached(&directive_keys, &directive_texts).await?;

        let positive_keys: Vec<String> =
            positive_sentences.iter().map(|s| chunker::sha256_hex(s)).collect();
        let positive_vectors = self.embed_cached(&positive_keys, &positive_sentences).await?;

        // Per-plan adherence: recency-weighted mean of each item's best
        // similarity to the plan's stored chunk embeddings.
        let mut plan_adherence = Vec::new();
        for plan in &plans {
            let plan_id = &plan.record.plan_id;
            let plan_chunks: Vec<&crate::core::vector::StoredEntry> = chunks
                .iter()
                .filter(|c| &c.source_path == plan_id)
                .collect();
            if plan_chunks.is_empty() {
                continue;
            }
            let mut weighted = 0.0f32;
            let mut weights = 0.0f32;
            for (item, vector) in items.iter().zip(&item_vectors) {
                let best = plan_chunks
                    .iter()
                    .map(|c| cosine(vector, &c.embedding))
                    .fold(0.0f32, f32::max);
                let age = (now - item.epoch).clamp(0, window_secs) as f32;
                let recency = 1.0 - age / window_secs.max(1) as f32;
                let class_weight = match item.kind {
                    ActivityKind::Commit | ActivityKind::Query => self.commit_path_ratio,
                    ActivityKind::Path => 1.0 - self.commit_path_ratio,
                };
                let weight = (recency * class_weight).max(0.01);
                weighted += best * weight;
                weights += weight;
            }
            plan_adherence.push(PlanAdherence {
                plan_id: plan_id.clone(),
                title: plan.record.title.clone(),
                score: if weights > 0.0 { weighted / weights } else { 1.0 },
            });
        }
        plan_adherence.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));

        let alignment = if plan_adherence.is_empty() {
            1.0
        } else {
            plan_adherence.iter().map(|p| p.score).sum::<f32>() / plan_adherence.len() as f32
        };

        let violations = self.detect_violations(
            &items,
            &item_vectors,
            &directive_sentences,
            &directive_vectors,
            &positive_vectors,
            now,
            window_secs,
        );

        let mut status = classify(alignment);
        // Violations override a benign mean: a direct contradiction is at
        // least moderate drift, and repeated or fresh high-severity hits are
        // critical.
        if !violations.is_empty() && status < DriftStatus::ModerateDrift {
            status = DriftStatus::ModerateDrift;
        }
        let high_count = violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::High)
            .count();
        if high_count >= 2 || (high_count >= 1 && alignment < MINOR_DRIFT_THRESHOLD) {
            status = DriftStatus::CriticalViolation;
        }

        let recommendations =
            build_recommendations(status, alignment, &violations, &plan_adherence);

        info!(
            project_id,
            alignment = f64::from(alignment),
            ?status,
            violations = violations.len(),
            "drift analysis complete"
        );
        Ok(DriftAnalysis {
            project_id: project_id.to_string(),
            window_hours,
            alignment_score: alignment,
            status,
            violations,
            recommendations,
            plan_adherence,
            notes,
            timestamp: time::now_iso(),
        })
    }

    fn build_items(
        &self,
        activity: &GitActivity,
        project_id: &str,
        window_secs: i64,
        now: i64,
    ) -> Vec<ActivityItem> {
        let mut items = Vec::new();
        for commit in &activity.commits {
            items.push(ActivityItem {
                kind: ActivityKind::Commit,
                text: commit.message.clone(),
                evidence: commit.hash.clone(),
                epoch: commit.timestamp,
                cache_key: format!("commit:{}", commit.hash),
            });
            for path in &commit.changed_paths {
                items.push(ActivityItem {
                    kind: ActivityKind::Path,
                    text: path.replace(['/', '_', '-'], " "),
                    evidence: path.clone(),
                    epoch: commit.timestamp,
                    cache_key: format!("path:{path}"),
                });
            }
        }
        for path in &activity.working_tree_changes {
            items.push(ActivityItem {
                kind: ActivityKind::Path,
                text: path.replace(['/', '_', '-'], " "),
                evidence: path.clone(),
                epoch: now,
                cache_key: format!("path:{path}"),
            });
        }
        for query in self.retrieval.recent_queries(project_id, window_secs) {
            items.push(ActivityItem {
                kind: ActivityKind::Query,
                text: query.question.clone(),
                evidence: format!("query: {}", query.question),
                epoch: query.epoch,
                cache_key: format!("query:{}", chunker::sha256_hex(&query.question)),
            });
        }
        items
    }

    #[allow(clippy::too_many_arguments)]
    fn detect_violations(
        &self,
        items: &[ActivityItem],
        item_vectors: &[Vec<f32>],
        directives: &[(String, String)],
        directive_vectors: &[Vec<f32>],
        positive_vectors: &[Vec<f32>],
        now: i64,
        window_secs: i64,
    ) -> Vec<Violation> {
        if directives.is_empty() {
            return Vec::new();
        }
        let mut violations = Vec::new();
        for (item, vector) in items.iter().zip(item_vectors) {
            let positive_max = positive_vectors
                .iter()
                .map(|v| cosine(vector, v))
                .fold(0.0f32, f32::max);
            if positive_max >= VIOLATION_FLOOR {
                continue;
            }
            // Best directive; strict comparison keeps the first (lowest
            // plan_id, lowest ordinal) winner on ties.
            let mut best: Option<(usize, f32)> = None;
            for (idx, dv) in directive_vectors.iter().enumerate() {
                let sim = cosine(vector, dv);
                if best.map(|(_, s)| sim > s).unwrap_or(true) {
                    best = Some((idx, sim));
                }
            }
            let Some((idx, directive_max)) = best else {
                continue;
            };
            if directive_max <= VIOLATION_CEILING {
                continue;
            }

            let age = (now - item.epoch).clamp(0, window_secs) as f32;
            let recency = 1.0 - age / window_secs.max(1) as f32;
            let margin = (VIOLATION_FLOOR - positive_max) + (directive_max - VIOLATION_CEILING);
            let severity = if margin >= 0.4 && recency >= 0.5 {
                ViolationSeverity::High
            } else if margin >= 0.2 {
                ViolationSeverity::Medium
            } else {
                ViolationSeverity::Low
            };
            let (plan_id, sentence) = &directives[idx];
            violations.push(Violation {
                plan_id: plan_id.clone(),
                evidence: item.evidence.clone(),
                severity,
                detail: format!("conflicts with directive: {sentence}"),
            });
        }
        violations.sort_by(|a, b| {
            a.plan_id
                .cmp(&b.plan_id)
                .then_with(|| a.evidence.cmp(&b.evidence))
        });
        violations.dedup_by(|a, b| a.plan_id == b.plan_id && a.evidence == b.evidence);
        violations
    }
}

fn build_recommendations(
    status: DriftStatus,
    alignment: f32,
    violations: &[Violation],
    adherence: &[PlanAdherence],
) -> Vec<String> {
    let mut recommendations = Vec::new();
    let high_count = violations
        .iter()
        .filter(|v| v.severity == ViolationSeverity::High)
        .count();
    if status == DriftStatus::CriticalViolation && high_count >= 1 {
        recommendations
            .push("Halt and review: recent activity directly contradicts approved plans.".into());
    }
    for violation in violations.iter().take(5) {
        recommendations.push(format!(
            "Review '{}' against plan {} ({:?} severity).",
            violation.evidence, violation.plan_id, violation.severity
        ));
    }
    if matches!(
        status,
        DriftStatus::ModerateDrift | DriftStatus::CriticalViolation
    ) {
        for plan in adherence.iter().filter(|p| p.score < MODERATE_DRIFT_THRESHOLD) {
            recommendations.push(format!(
                "Revisit plan '{}' ({}): recent activity has diverged from it.",
                plan.title, plan.plan_id
            ));
        }
    }
    if recommendations.is_empty() {
        if alignment >= ALIGNED_THRESHOLD {
            recommendations.push("Development is aligned with approved plans.".into());
        } else {
            recommendations.push(
                "Alignment is slipping; compare recent commits with the approved plans.".into(),
            );
        }
    }
    recommendations
}
