//! Retrieval engine: per-project ingest and query pipelines.
//!
//! Exclusive owner of chunk and vector-entry lifecycles; nothing else
//! writes to `project_*` collections. Ingestion runs path filter → bounded
//! read → secret redaction → chunking → batched embedding → atomic
//! replace-by-source-path. Queries embed the question and return top-k
//! chunks; `query_with_generation` layers the generation client on top and
//! always returns its grounding chunks, even when generation fails.

use crate::core::chunker::{self, Chunker};
use crate::core::embed::Embedder;
use crate::core::error::TidepoolError;
use crate::core::generate::Generator;
use crate::core::paths::{PathFilter, PathVerdict};
use crate::core::redact;
use crate::core::time;
use crate::core::vector::{project_collection, VectorEntry, VectorStore};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

/// Default and maximum `k` for queries.
pub const DEFAULT_TOP_K: usize = 5;
pub const MAX_TOP_K: usize = 20;

/// Progress cadence for directory ingestion.
pub const PROGRESS_EVERY_FILES: usize = 10;
pub const PROGRESS_EVERY_SECS: u64 = 1;

const ANSWER_PREAMBLE: &str = "You are answering a question about a software project. \
Ground your answer strictly in the context excerpts below; if they do not contain \
the answer, say so. Cite file paths when relevant.";

const ANSWER_MAX_TOKENS: usize = 1024;

/// Outcome for a single file presented to the ingest pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Filtered out before reading; reason retained for logging.
    Skipped(String),
    /// Content hash matched the stored generation; no writes performed.
    Unchanged,
    /// Replaced the stored generation with this many chunks.
    Indexed(usize),
}

/// Counters for a directory ingest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub chunks_written: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

/// One retrieval hit returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHit {
    pub content: String,
    pub source_path: String,
    pub ordinal: usize,
    pub score: f32,
    pub metadata: JsonValue,
}

/// Raw retrieval response.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub results: Vec<QueryHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub timestamp: String,
}

/// Retrieval-plus-generation response.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedAnswer {
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub sources: Vec<String>,
    pub context_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub timestamp: String,
}

/// A logged developer query, consumed by drift analysis.
#[derive(Debug, Clone)]
pub struct LoggedQuery {
    pub epoch: i64,
    pub question: String,
}

/// Best-effort language tag from a file extension, stored in chunk metadata.
pub fn language_for_extension(ext: &str) -> &'static str {
    match ext {
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "rs" => "rust",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "java" => "java",
        "kt" => "kotlin",
        "swift" => "swift",
        "rb" => "ruby",
        "php" => "php",
        "sh" | "bash" | "zsh" => "shell",
        "md" => "markdown",
        "rst" => "restructuredtext",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "sql" => "sql",
        _ => "text",
    }
}

/// Source identity stored with each chunk: relative to the project root
/// where possible, otherwise the absolute path.
pub fn source_identity(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn build_prompt(question: &str, hits: &[QueryHit]) -> String {
    let mut prompt = String::from(ANSWER_PREAMBLE);
    prompt.push_str("\n\n");
    for hit in hits {
        prompt.push_str(&format!("[{}]\n{}\n---\n", hit.source_path, hit.content));
    }
    prompt.push_str("\nQuestion: ");
    prompt.push_str(question);
    prompt
}

/// Owns ingest and query for `project_*` collections.
pub struct RetrievalEngine {
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    chunker: Chunker,
    max_file_bytes: u64,
    query_log_capacity: usize,
    query_log: Mutex<FxHashMap<String, VecDeque<LoggedQuery>>>,
}

impl RetrievalEngine {
    pub fn new(
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        chunker: Chunker,
        max_file_bytes: u64,
        query_log_capacity: usize,
    ) -> Self {
        RetrievalEngine {
            vectors,
            embedder,
            generator,
            chunker,
            max_file_bytes,
            query_log_capacity,
            query_log: Mutex::new(FxHashMap::default()),
        }
    }

    /// Ingest one file into the project's collection.
    ///
    /// Re-ingestion of unchanged content is a no-op; changed content
    /// replaces the prior generation atomically.
    pub async fn ingest_file(
        &self,
        project_id: &str,
        root: &Path,
        path: &Path,
    ) -> Result<FileOutcome, TidepoolError> {
        let filter = PathFilter::new(root, self.max_file_bytes);
        match filter.check_file(path) {
            PathVerdict::Eligible => {}
            verdict => return Ok(FileOutcome::Skipped(format!("{verdict:?}"))),
        }

        let bytes = std::fs::read(path)?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let content = redact::redact(&content);
        let file_hash = chunker::sha256_hex(&content);
        let source = source_identity(root, path);

        let collection = self.vectors.open(&project_collection(project_id))?;
        if collection.source_hash(&source)?.as_deref() == Some(file_hash.as_str()) {
            debug!(project_id, %source, "file unchanged; skipping re-ingest");
            return Ok(FileOutcome::Unchanged);
        }

        let chunks = self.chunker.chunk(&content);
        if chunks.is_empty() {
            collection.delete_source(&source)?;
            return Ok(FileOutcome::Indexed(0));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        // The long embedding call happens before the collection writer lock.
        let embeddings = self.embedder.embed(&texts).await?;

        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let language = path
            .extension()
            .map(|e| language_for_extension(&e.to_string_lossy().to_lowercase()))
            .unwrap_or("text");

        let entries: Vec<VectorEntry> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                let mut metadata = JsonMap::new();
                metadata.insert("source_path".into(), JsonValue::String(source.clone()));
                metadata.insert("ordinal".into(), JsonValue::from(chunk.ordinal));
                metadata.insert("content_hash".into(), JsonValue::String(file_hash.clone()));
                metadata.insert("mtime".into(), JsonValue::from(mtime));
                metadata.insert("language".into(), JsonValue::String(language.into()));
                VectorEntry {
                    id: format!("{source}:{}", chunk.ordinal),
                    source_path: source.clone(),
                    ordinal: chunk.ordinal,
                    content: chunk.text.clone(),
                    embedding,
                    metadata,
                    content_hash: file_hash.clone(),
                }
            })
            .collect();

        let written = entries.len();
        collection.replace_source(&source, &entries)?;
        Ok(FileOutcome::Indexed(written))
    }

    /// Collect ingestible files under `root`, depth-first, name-sorted for
    /// deterministic ordering.
    pub fn collect_files(&self, root: &Path) -> Result<Vec<std::path::PathBuf>, TidepoolError> {
        let filter = PathFilter::new(root, self.max_file_bytes);
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(dir = %dir.display(), %err, "skipping unreadable directory");
                    continue;
                }
            };
            let mut children: Vec<std::path::PathBuf> =
                entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
            children.sort();
            for child in children {
                if child.is_dir() {
                    if filter.should_descend(&child) {
                        pending.push(child);
                    }
                } else if filter.check_file(&child) == PathVerdict::Eligible {
                    files.push(child);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Ingest a directory tree, streaming progress and honouring
    /// cancellation between files.
    ///
    /// File-level failures are recorded and skipped; only a collection-level
    /// failure aborts the ingest. Progress fires every
    /// [`PROGRESS_EVERY_FILES`] files or [`PROGRESS_EVERY_SECS`] seconds,
    /// whichever comes first.
    pub async fn ingest_dir(
        &self,
        project_id: &str,
        root: &Path,
        cancel: &AtomicBool,
        progress: &mut (dyn FnMut(usize, usize, &str) + Send),
    ) -> Result<IngestReport, TidepoolError> {
        if !root.is_dir() {
            return Err(TidepoolError::InvalidInput(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        // Open (and thereby create) the collection up front: an ingest of an
        // entirely-excluded tree still completes with zero chunks.
        self.vectors.open(&project_collection(project_id))?;

        let files = self.collect_files(root)?;
        let total = files.len();
        let mut report = IngestReport::default();
        let mut last_emit = Instant::now();

        for (index, path) in files.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                return Err(TidepoolError::Cancelled(format!(
                    "ingest cancelled after {index} of {total} files"
                )));
            }
            let display_name = source_identity(root, path);
            match self.ingest_file(project_id, root, path).await {
                Ok(FileOutcome::Indexed(chunks)) => {
                    report.files_indexed += 1;
                    report.chunks_written += chunks;
                }
                Ok(FileOutcome::Unchanged) => report.files_unchanged += 1,
                Ok(FileOutcome::Skipped(_)) => report.files_skipped += 1,
                Err(err) => {
                    warn!(project_id, file = %display_name, %err, "file ingest failed");
                    report.files_failed += 1;
                    if report.failures.len() < 8 {
                        report.failures.push(format!("{display_name}: {err}"));
                    }
                }
            }
            let processed = index + 1;
            if processed % PROGRESS_EVERY_FILES == 0
                || last_emit.elapsed().as_secs() >= PROGRESS_EVERY_SECS
                || processed == total
            {
                progress(processed, total, &display_name);
                last_emit = Instant::now();
            }
        }
        if total == 0 {
            progress(0, 0, "");
        }
        Ok(report)
    }

    /// Ingest a file or a directory tree; the task worker entry point.
    ///
    /// A single file reports progress as its own one-item tree.
    pub async fn ingest_path(
        &self,
        project_id: &str,
        path: &Path,
        cancel: &AtomicBool,
        progress: &mut (dyn FnMut(usize, usize, &str) + Send),
    ) -> Result<IngestReport, TidepoolError> {
        if path.is_dir() {
            return self.ingest_dir(project_id, path, cancel, progress).await;
        }
        if !path.is_file() {
            return Err(TidepoolError::InvalidInput(format!(
                "{} is neither a file nor a directory",
                path.display()
            )));
        }
        let root = path.parent().unwrap_or(path);
        self.vectors.open(&project_collection(project_id))?;
        let mut report = IngestReport::default();
        let display = source_identity(root, path);
        match self.ingest_file(project_id, root, path).await {
            Ok(FileOutcome::Indexed(chunks)) => {
                report.files_indexed = 1;
                report.chunks_written = chunks;
            }
            Ok(FileOutcome::Unchanged) => report.files_unchanged = 1,
            Ok(FileOutcome::Skipped(_)) => report.files_skipped = 1,
            Err(err) => {
                report.files_failed = 1;
                report.failures.push(format!("{display}: {err}"));
            }
        }
        progress(1, 1, &display);
        Ok(report)
    }

    fn validate_k(k: Option<usize>) -> Result<usize, TidepoolError> {
        match k {
            Some(0) => Err(TidepoolError::InvalidInput("k must be positive".into())),
            Some(k) => Ok(k.min(MAX_TOP_K)),
            None => Ok(DEFAULT_TOP_K),
        }
    }

    /// Raw top-k retrieval over a project's collection.
    pub async fn query(
        &self,
        project_id: &str,
        question: &str,
        k: Option<usize>,
    ) -> Result<QueryResponse, TidepoolError> {
        let k = Self::validate_k(k)?;
        if question.trim().is_empty() {
            return Err(TidepoolError::InvalidInput("question is empty".into()));
        }
        // Log before the content check so drift sees what developers are
        // asking about even on not-yet-indexed projects.
        self.log_query(project_id, question);

        let collection = self.vectors.open(&project_collection(project_id))?;
        if collection.count()? == 0 {
            return Ok(QueryResponse {
                results: Vec::new(),
                note: Some("no indexed content for this project".into()),
                timestamp: time::now_iso(),
            });
        }

        let query = self
            .embedder
            .embed(&[question.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TidepoolError::DependencyUnavailable("empty embedding batch".into()))?;
        let hits = collection.search(&query, k, None)?;

        Ok(QueryResponse {
            results: hits
                .into_iter()
                .map(|hit| QueryHit {
                    content: hit.content,
                    source_path: hit.source_path,
                    ordinal: hit.ordinal,
                    score: hit.score,
                    metadata: hit.metadata,
                })
                .collect(),
            note: None,
            timestamp: time::now_iso(),
        })
    }

    /// Retrieval plus generation. Never returns a synthesized answer without
    /// grounding chunks; if generation fails the chunks come back with an
    /// explanatory note instead.
    pub async fn query_with_generation(
        &self,
        project_id: &str,
        question: &str,
        k: Option<usize>,
    ) -> Result<GeneratedAnswer, TidepoolError> {
        let retrieved = self.query(project_id, question, k).await?;
        if retrieved.results.is_empty() {
            return Ok(GeneratedAnswer {
                question: question.to_string(),
                answer: None,
                sources: Vec::new(),
                context_used: 0,
                note: retrieved.note,
                timestamp: time::now_iso(),
            });
        }

        let mut sources: Vec<String> = Vec::new();
        for hit in &retrieved.results {
            if !sources.contains(&hit.source_path) {
                sources.push(hit.source_path.clone());
            }
        }

        let prompt = build_prompt(question, &retrieved.results);
        match self.generator.generate(&prompt, ANSWER_MAX_TOKENS).await {
            Ok(answer) => Ok(GeneratedAnswer {
                question: question.to_string(),
                answer: Some(answer),
                sources,
                context_used: retrieved.results.len(),
                note: None,
                timestamp: time::now_iso(),
            }),
            Err(err) => {
                warn!(project_id, %err, "generation failed; returning raw context");
                Ok(GeneratedAnswer {
                    question: question.to_string(),
                    answer: None,
                    sources,
                    context_used: retrieved.results.len(),
                    note: Some(format!(
                        "generation unavailable ({err}); raw context returned"
                    )),
                    timestamp: time::now_iso(),
                })
            }
        }
    }

    fn log_query(&self, project_id: &str, question: &str) {
        let mut log = self.query_log.lock().expect("query log lock");
        let ring = log.entry(project_id.to_string()).or_default();
        ring.push_back(LoggedQuery {
            epoch: time::now_epoch() as i64,
            question: question.to_string(),
        });
        while ring.len() > self.query_log_capacity {
            ring.pop_front();
        }
    }

    /// Queries logged for a project within the trailing window.
    pub fn recent_queries(&self, project_id: &str, window_secs: i64) -> Vec<LoggedQuery> {
        let cutoff = time::now_epoch() as i64 - window_secs;
        let log = self.query_log.lock().expect("query log lock");
        log.get(project_id)
            .map(|ring| {
                ring.iter()
                    .filter(|q| q.epoch >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Chunk and source counts for a project's collection (zero if absent).
    pub fn stats(&self, project_id: &str) -> Result<(usize, usize), TidepoolError> {
        let name = project_collection(project_id);
        if !self.vectors.exists(&name) {
            return Ok((0, 0));
        }
        let collection = self.vectors.open(&name)?;
        Ok((collection.count()?, collection.source_count()?))
    }
}
