// Centralized database schema definitions for Tidepool collections.

// --- Vector collections ---
pub const VECTOR_DB_NAME: &str = "vectors.db";

pub const VECTOR_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const VECTOR_DB_SCHEMA_VECTORS: &str = "
    CREATE TABLE IF NOT EXISTS vectors (
        id TEXT PRIMARY KEY,
        source_path TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        content TEXT NOT NULL,
        embedding TEXT NOT NULL,
        metadata TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
";

pub const VECTOR_DB_INDEX_SOURCE: &str = "
    CREATE INDEX IF NOT EXISTS idx_vectors_source ON vectors (source_path, ordinal)
";

pub const META_KEY_DIMENSION: &str = "dimension";
