//! Per-collection vector storage and similarity search.
//!
//! One SQLite database per collection under `<data_root>/vector_store/`,
//! with embeddings stored as JSON arrays and cosine similarity computed
//! in-process. Collections record their embedding dimension at creation and
//! every later insert must match it: swapping embedding models silently
//! corrupts a collection, so a mismatch is an integrity fault, not a retry.
//!
//! Metadata values are restricted to JSON primitives. Tag lists are stored
//! as a single comma-delimited string, never arrays.

use crate::core::db;
use crate::core::error::TidepoolError;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashMap;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Collection name for a project's source chunks.
pub fn project_collection(project_id: &str) -> String {
    format!("project_{project_id}")
}

/// Collection name for a project's sacred-plan chunks.
pub fn sacred_collection(project_id: &str) -> String {
    format!("sacred_{project_id}")
}

/// One vector plus its chunk payload and primitive-valued metadata.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub id: String,
    pub source_path: String,
    pub ordinal: usize,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: JsonMap<String, JsonValue>,
    pub content_hash: String,
}

/// A stored row read back out of a collection.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub id: String,
    pub source_path: String,
    pub ordinal: usize,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: JsonValue,
    pub content_hash: String,
}

/// Similarity search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub source_path: String,
    pub ordinal: usize,
    pub content: String,
    pub metadata: JsonValue,
    pub score: f32,
}

/// Cosine similarity; zero vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn validate_metadata(metadata: &JsonMap<String, JsonValue>) -> Result<(), TidepoolError> {
    for (key, value) in metadata {
        if value.is_array() || value.is_object() {
            return Err(TidepoolError::InvalidInput(format!(
                "metadata value for '{key}' must be a primitive; join lists with commas"
            )));
        }
    }
    Ok(())
}

/// One open collection: a SQLite handle plus its recorded dimension.
///
/// The connection mutex doubles as the per-collection writer lock; it is
/// held only around the delete+insert transaction, never across embedding
/// calls.
pub struct Collection {
    name: String,
    dimension: usize,
    conn: Mutex<Connection>,
}

impl Collection {
    fn open(dir: &Path, name: &str, expected_dim: usize) -> Result<Self, TidepoolError> {
        fs::create_dir_all(dir)?;
        let conn = db::db_connect(&dir.join(schemas::VECTOR_DB_NAME))?;
        conn.execute(schemas::VECTOR_DB_SCHEMA_META, [])?;
        conn.execute(schemas::VECTOR_DB_SCHEMA_VECTORS, [])?;
        conn.execute(schemas::VECTOR_DB_INDEX_SOURCE, [])?;

        let recorded: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![schemas::META_KEY_DIMENSION],
                |row| row.get(0),
            )
            .optional()?;
        let dimension = match recorded {
            Some(raw) => {
                let dim: usize = raw.parse().map_err(|_| {
                    TidepoolError::Integrity(format!(
                        "collection {name} has invalid recorded dimension '{raw}'"
                    ))
                })?;
                if dim != expected_dim {
                    return Err(TidepoolError::Integrity(format!(
                        "dimension mismatch: collection {name} was created with dimension {dim}, configured {expected_dim}"
                    )));
                }
                dim
            }
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES (?1, ?2)",
                    params![schemas::META_KEY_DIMENSION, expected_dim.to_string()],
                )?;
                expected_dim
            }
        };

        Ok(Collection {
            name: name.to_string(),
            dimension,
            conn: Mutex::new(conn),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn check_entries(&self, entries: &[VectorEntry]) -> Result<(), TidepoolError> {
        for entry in entries {
            if entry.embedding.len() != self.dimension {
                return Err(TidepoolError::Integrity(format!(
                    "dimension mismatch: entry {} has dimension {}, collection {} expects {}",
                    entry.id,
                    entry.embedding.len(),
                    self.name,
                    self.dimension
                )));
            }
            validate_metadata(&entry.metadata)?;
        }
        Ok(())
    }

    fn insert_tx(tx: &rusqlite::Transaction<'_>, entry: &VectorEntry) -> Result<(), TidepoolError> {
        tx.execute(
            "INSERT OR REPLACE INTO vectors
                 (id, source_path, ordinal, content, embedding, metadata, content_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id,
                entry.source_path,
                entry.ordinal as i64,
                entry.content,
                serde_json::to_string(&entry.embedding)?,
                serde_json::to_string(&JsonValue::Object(entry.metadata.clone()))?,
                entry.content_hash,
                time::now_iso(),
            ],
        )?;
        Ok(())
    }

    /// Insert entries, ordinal order, single transaction.
    pub fn insert(&self, entries: &[VectorEntry]) -> Result<(), TidepoolError> {
        self.check_entries(entries)?;
        let mut conn = self.conn.lock().expect("collection lock");
        let tx = conn.transaction()?;
        for entry in entries {
            Self::insert_tx(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Atomically replace all entries for `source_path` with `entries`.
    /// Concurrent readers see either the full old set or the full new set.
    pub fn replace_source(
        &self,
        source_path: &str,
        entries: &[VectorEntry],
    ) -> Result<(), TidepoolError> {
        self.check_entries(entries)?;
        let mut conn = self.conn.lock().expect("collection lock");
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM vectors WHERE source_path = ?1",
            params![source_path],
        )?;
        for entry in entries {
            Self::insert_tx(&tx, entry)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_source(&self, source_path: &str) -> Result<usize, TidepoolError> {
        let conn = self.conn.lock().expect("collection lock");
        let deleted = conn.execute(
            "DELETE FROM vectors WHERE source_path = ?1",
            params![source_path],
        )?;
        Ok(deleted)
    }

    /// Stored content hash for a source path, if any entries exist.
    pub fn source_hash(&self, source_path: &str) -> Result<Option<String>, TidepoolError> {
        let conn = self.conn.lock().expect("collection lock");
        let hash = conn
            .query_row(
                "SELECT content_hash FROM vectors WHERE source_path = ?1 ORDER BY ordinal LIMIT 1",
                params![source_path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    pub fn count(&self) -> Result<usize, TidepoolError> {
        let conn = self.conn.lock().expect("collection lock");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn source_count(&self) -> Result<usize, TidepoolError> {
        let conn = self.conn.lock().expect("collection lock");
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT source_path) FROM vectors",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(StoredEntry, String)> {
        Ok((
            StoredEntry {
                id: row.get(0)?,
                source_path: row.get(1)?,
                ordinal: row.get::<_, i64>(2)? as usize,
                content: row.get(3)?,
                embedding: Vec::new(),
                metadata: JsonValue::Null,
                content_hash: row.get(6)?,
            },
            row.get::<_, String>(4)?,
        ))
    }

    fn load_all(&self) -> Result<Vec<StoredEntry>, TidepoolError> {
        let conn = self.conn.lock().expect("collection lock");
        let mut stmt = conn.prepare(
            "SELECT id, source_path, ordinal, content, embedding, metadata, content_hash
             FROM vectors ORDER BY source_path, ordinal",
        )?;
        let rows = stmt.query_map([], |row| {
            let (entry, embedding_raw) = Self::row_to_entry(row)?;
            let metadata_raw: String = row.get(5)?;
            Ok((entry, embedding_raw, metadata_raw))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (mut entry, embedding_raw, metadata_raw) = row?;
            entry.embedding = serde_json::from_str(&embedding_raw)?;
            entry.metadata = serde_json::from_str(&metadata_raw)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// All entries whose metadata field `key` equals `value`.
    pub fn entries_where(&self, key: &str, value: &str) -> Result<Vec<StoredEntry>, TidepoolError> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|e| e.metadata.get(key).and_then(JsonValue::as_str) == Some(value))
            .collect())
    }

    /// Top-k cosine search, optionally filtered on a metadata field.
    ///
    /// Ordering is deterministic: score descending, ties broken on
    /// (source_path, ordinal).
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<(&str, &str)>,
    ) -> Result<Vec<SearchHit>, TidepoolError> {
        if query.len() != self.dimension {
            return Err(TidepoolError::Integrity(format!(
                "dimension mismatch: query has dimension {}, collection {} expects {}",
                query.len(),
                self.name,
                self.dimension
            )));
        }
        let mut hits: Vec<SearchHit> = self
            .load_all()?
            .into_iter()
            .filter(|entry| match filter {
                Some((key, value)) => {
                    entry.metadata.get(key).and_then(JsonValue::as_str) == Some(value)
                }
                None => true,
            })
            .map(|entry| SearchHit {
                score: cosine(query, &entry.embedding),
                id: entry.id,
                source_path: entry.source_path,
                ordinal: entry.ordinal,
                content: entry.content,
                metadata: entry.metadata,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source_path.cmp(&b.source_path))
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Rewrite one metadata field on every entry matching `(match_key,
    /// match_value)`, in a single transaction.
    pub fn rewrite_metadata(
        &self,
        match_key: &str,
        match_value: &str,
        set_key: &str,
        set_value: &str,
    ) -> Result<usize, TidepoolError> {
        let mut conn = self.conn.lock().expect("collection lock");
        let tx = conn.transaction()?;
        let mut updates: Vec<(String, String)> = Vec::new();
        {
            let mut stmt = tx.prepare("SELECT id, metadata FROM vectors")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, metadata_raw) = row?;
                let mut metadata: JsonValue = serde_json::from_str(&metadata_raw)?;
                if metadata.get(match_key).and_then(JsonValue::as_str) != Some(match_value) {
                    continue;
                }
                if let Some(obj) = metadata.as_object_mut() {
                    obj.insert(set_key.to_string(), JsonValue::String(set_value.to_string()));
                }
                updates.push((id, serde_json::to_string(&metadata)?));
            }
        }
        let rewritten = updates.len();
        for (id, metadata) in updates {
            tx.execute(
                "UPDATE vectors SET metadata = ?1 WHERE id = ?2",
                params![metadata, id],
            )?;
        }
        tx.commit()?;
        Ok(rewritten)
    }
}

/// Owner of every collection under the data root.
pub struct VectorStore {
    root: PathBuf,
    dimension: usize,
    collections: Mutex<FxHashMap<String, Arc<Collection>>>,
}

impl VectorStore {
    pub fn new(root: &Path, dimension: usize) -> Result<Self, TidepoolError> {
        fs::create_dir_all(root)?;
        Ok(VectorStore {
            root: root.to_path_buf(),
            dimension,
            collections: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Open (creating if necessary) the named collection. Idempotent.
    pub fn open(&self, name: &str) -> Result<Arc<Collection>, TidepoolError> {
        let mut collections = self.collections.lock().expect("store lock");
        if let Some(existing) = collections.get(name) {
            return Ok(existing.clone());
        }
        let collection = Arc::new(Collection::open(
            &self.root.join(name),
            name,
            self.dimension,
        )?);
        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    /// Whether the collection exists on disk without creating it.
    pub fn exists(&self, name: &str) -> bool {
        self.root.join(name).join(schemas::VECTOR_DB_NAME).exists()
    }

    /// Remove a collection's subtree entirely. Used by project deletion.
    pub fn drop_collection(&self, name: &str) -> Result<(), TidepoolError> {
        self.collections.lock().expect("store lock").remove(name);
        let dir = self.root.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, source: &str, ordinal: usize, embedding: Vec<f32>) -> VectorEntry {
        let mut metadata = JsonMap::new();
        metadata.insert("source_path".into(), JsonValue::String(source.into()));
        metadata.insert("ordinal".into(), JsonValue::from(ordinal));
        VectorEntry {
            id: id.to_string(),
            source_path: source.to_string(),
            ordinal,
            content: format!("content {id}"),
            embedding,
            metadata,
            content_hash: "h".to_string(),
        }
    }

    fn store() -> (tempfile::TempDir, VectorStore) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = VectorStore::new(tmp.path(), 3).expect("store");
        (tmp, store)
    }

    #[test]
    fn open_is_idempotent_and_records_dimension() {
        let (_tmp, store) = store();
        let a = store.open("project_p1").expect("open");
        let b = store.open("project_p1").expect("reopen");
        assert_eq!(a.dimension(), 3);
        assert_eq!(b.name(), "project_p1");
        assert!(store.exists("project_p1"));
        assert!(!store.exists("project_p2"));
    }

    #[test]
    fn dimension_mismatch_rejected_on_insert_and_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = VectorStore::new(tmp.path(), 3).expect("store");
        let coll = store.open("project_p1").expect("open");
        let bad = entry("v1", "a.py", 0, vec![1.0, 0.0]);
        let err = coll.insert(&[bad]).unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));

        // Reopening with a different configured dimension is an integrity fault.
        let other = VectorStore::new(tmp.path(), 8).expect("store");
        assert!(other.open("project_p1").is_err());
    }

    #[test]
    fn metadata_arrays_are_rejected() {
        let (_tmp, store) = store();
        let coll = store.open("project_p1").expect("open");
        let mut bad = entry("v1", "a.py", 0, vec![1.0, 0.0, 0.0]);
        bad.metadata
            .insert("tags".into(), serde_json::json!(["a", "b"]));
        let err = coll.insert(&[bad]).unwrap_err();
        assert!(err.to_string().contains("primitive"));
    }

    #[test]
    fn search_orders_by_score_with_deterministic_ties() {
        let (_tmp, store) = store();
        let coll = store.open("project_p1").expect("open");
        coll.insert(&[
            entry("v1", "a.py", 0, vec![1.0, 0.0, 0.0]),
            entry("v2", "b.py", 0, vec![0.0, 1.0, 0.0]),
            // Same direction as v1: identical score, later path breaks tie.
            entry("v3", "c.py", 0, vec![2.0, 0.0, 0.0]),
        ])
        .expect("insert");

        let hits = coll.search(&[1.0, 0.0, 0.0], 10, None).expect("search");
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].source_path, "a.py");
        assert_eq!(hits[1].source_path, "c.py");
        assert!(hits[0].score > 0.99 && hits[1].score > 0.99);
        assert!(hits[2].score < 0.01);
    }

    #[test]
    fn replace_source_is_atomic_and_idempotent() {
        let (_tmp, store) = store();
        let coll = store.open("project_p1").expect("open");
        coll.replace_source(
            "a.py",
            &[
                entry("v1", "a.py", 0, vec![1.0, 0.0, 0.0]),
                entry("v2", "a.py", 1, vec![0.0, 1.0, 0.0]),
            ],
        )
        .expect("first ingest");
        assert_eq!(coll.count().unwrap(), 2);

        coll.replace_source("a.py", &[entry("v9", "a.py", 0, vec![0.0, 0.0, 1.0])])
            .expect("replace");
        assert_eq!(coll.count().unwrap(), 1);
        assert_eq!(coll.source_hash("a.py").unwrap().as_deref(), Some("h"));
        assert_eq!(coll.source_count().unwrap(), 1);
    }

    #[test]
    fn metadata_filter_and_rewrite() {
        let (_tmp, store) = store();
        let coll = store.open("sacred_p1").expect("open");
        let mut e1 = entry("c1", "plan_1", 0, vec![1.0, 0.0, 0.0]);
        e1.metadata
            .insert("plan_id".into(), JsonValue::String("plan_1".into()));
        e1.metadata
            .insert("status".into(), JsonValue::String("draft".into()));
        let mut e2 = entry("c2", "plan_2", 0, vec![0.9, 0.1, 0.0]);
        e2.metadata
            .insert("plan_id".into(), JsonValue::String("plan_2".into()));
        e2.metadata
            .insert("status".into(), JsonValue::String("approved".into()));
        coll.insert(&[e1, e2]).expect("insert");

        let approved = coll
            .search(&[1.0, 0.0, 0.0], 10, Some(("status", "approved")))
            .expect("search");
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].source_path, "plan_2");

        let rewritten = coll
            .rewrite_metadata("plan_id", "plan_1", "status", "approved")
            .expect("rewrite");
        assert_eq!(rewritten, 1);
        let approved = coll
            .search(&[1.0, 0.0, 0.0], 10, Some(("status", "approved")))
            .expect("search");
        assert_eq!(approved.len(), 2);

        let plan1 = coll.entries_where("plan_id", "plan_1").expect("entries");
        assert_eq!(plan1.len(), 1);
        assert_eq!(
            plan1[0].metadata.get("status").and_then(JsonValue::as_str),
            Some("approved")
        );
    }
}
