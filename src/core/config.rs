//! Runtime configuration.
//!
//! Configuration is environment-driven with sensible defaults; an optional
//! `tidepool.toml` next to the data root supplies defaults that environment
//! variables override. Required keys (service credentials and the sacred
//! approval secret) have no default and fail fast at startup.

use crate::core::error::TidepoolError;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:5556";
pub const DEFAULT_DATA_ROOT: &str = ".tidepool";
pub const DEFAULT_EMBEDDING_BASE_URL: &str = "http://127.0.0.1:11434/v1";
pub const DEFAULT_GENERATION_BASE_URL: &str = "http://127.0.0.1:11434/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_GENERATION_MODEL: &str = "llama3.1";
pub const DEFAULT_EMBEDDING_DIM: usize = 768;
pub const DEFAULT_MAX_INGEST_CONCURRENCY: usize = 2;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_CHUNK_TARGET_CHARS: usize = 1500;
pub const DEFAULT_CHUNK_OVERLAP_CHARS: usize = 150;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DRIFT_COMMIT_PATH_RATIO: f32 = 0.5;
pub const DEFAULT_QUERY_LOG_CAPACITY: usize = 256;

/// Resolved runtime configuration, read once at startup and passed to owners.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: String,
    pub data_root: PathBuf,
    pub embedding_api_key: String,
    pub generation_api_key: String,
    pub embedding_model: String,
    pub generation_model: String,
    pub embedding_base_url: String,
    pub generation_base_url: String,
    pub embedding_dim: usize,
    pub sacred_approval_key: String,
    pub max_ingest_concurrency: usize,
    pub max_file_bytes: u64,
    pub chunk_target_chars: usize,
    pub chunk_overlap_chars: usize,
    pub request_timeout_secs: u64,
    pub drift_commit_path_ratio: f32,
    pub query_log_capacity: usize,
}

/// Optional `tidepool.toml` overlay. Every field is optional; environment
/// variables win over file values.
#[derive(Debug, Default, Deserialize)]
struct FileOverlay {
    http_bind: Option<String>,
    data_root: Option<String>,
    embedding_model: Option<String>,
    generation_model: Option<String>,
    embedding_base_url: Option<String>,
    generation_base_url: Option<String>,
    embedding_dim: Option<usize>,
    max_ingest_concurrency: Option<usize>,
    max_file_bytes: Option<u64>,
    chunk_target_chars: Option<usize>,
    chunk_overlap_chars: Option<usize>,
    request_timeout_secs: Option<u64>,
    drift_commit_path_ratio: Option<f32>,
    query_log_capacity: Option<usize>,
}

fn env_or<S: Into<String>>(key: &str, fallback: S) -> String {
    env::var(key).unwrap_or_else(|_| fallback.into())
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> Result<T, TidepoolError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| TidepoolError::InvalidInput(format!("{key} has invalid value: {raw}"))),
        Err(_) => Ok(fallback),
    }
}

fn required(key: &str) -> Result<String, TidepoolError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(TidepoolError::InvalidInput(format!(
            "required configuration key {key} is not set"
        ))),
    }
}

impl Config {
    /// Build the configuration from the process environment, with an optional
    /// `tidepool.toml` overlay read from the current directory.
    pub fn from_env() -> Result<Self, TidepoolError> {
        let overlay = Self::load_overlay(Path::new("tidepool.toml"))?;
        Self::from_env_with_overlay(overlay)
    }

    fn load_overlay(path: &Path) -> Result<FileOverlay, TidepoolError> {
        if !path.exists() {
            return Ok(FileOverlay::default());
        }
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| TidepoolError::InvalidInput(format!("invalid tidepool.toml: {e}")))
    }

    fn from_env_with_overlay(overlay: FileOverlay) -> Result<Self, TidepoolError> {
        let config = Config {
            http_bind: env_or(
                "HTTP_BIND",
                overlay.http_bind.unwrap_or_else(|| DEFAULT_HTTP_BIND.into()),
            ),
            data_root: PathBuf::from(env_or(
                "DATA_ROOT",
                overlay.data_root.unwrap_or_else(|| DEFAULT_DATA_ROOT.into()),
            )),
            embedding_api_key: required("EMBEDDING_API_KEY")?,
            generation_api_key: required("GENERATION_API_KEY")?,
            embedding_model: env_or(
                "EMBEDDING_MODEL",
                overlay
                    .embedding_model
                    .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.into()),
            ),
            generation_model: env_or(
                "GENERATION_MODEL",
                overlay
                    .generation_model
                    .unwrap_or_else(|| DEFAULT_GENERATION_MODEL.into()),
            ),
            embedding_base_url: env_or(
                "EMBEDDING_BASE_URL",
                overlay
                    .embedding_base_url
                    .unwrap_or_else(|| DEFAULT_EMBEDDING_BASE_URL.into()),
            ),
            generation_base_url: env_or(
                "GENERATION_BASE_URL",
                overlay
                    .generation_base_url
                    .unwrap_or_else(|| DEFAULT_GENERATION_BASE_URL.into()),
            ),
            embedding_dim: env_parse(
                "EMBEDDING_DIM",
                overlay.embedding_dim.unwrap_or(DEFAULT_EMBEDDING_DIM),
            )?,
            sacred_approval_key: required("SACRED_APPROVAL_KEY")?,
            max_ingest_concurrency: env_parse(
                "MAX_INGEST_CONCURRENCY",
                overlay
                    .max_ingest_concurrency
                    .unwrap_or(DEFAULT_MAX_INGEST_CONCURRENCY),
            )?,
            max_file_bytes: env_parse(
                "MAX_FILE_BYTES",
                overlay.max_file_bytes.unwrap_or(DEFAULT_MAX_FILE_BYTES),
            )?,
            chunk_target_chars: env_parse(
                "CHUNK_TARGET_CHARS",
                overlay
                    .chunk_target_chars
                    .unwrap_or(DEFAULT_CHUNK_TARGET_CHARS),
            )?,
            chunk_overlap_chars: env_parse(
                "CHUNK_OVERLAP_CHARS",
                overlay
                    .chunk_overlap_chars
                    .unwrap_or(DEFAULT_CHUNK_OVERLAP_CHARS),
            )?,
            request_timeout_secs: env_parse(
                "REQUEST_TIMEOUT_SECS",
                overlay
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            )?,
            drift_commit_path_ratio: env_parse(
                "DRIFT_COMMIT_PATH_RATIO",
                overlay
                    .drift_commit_path_ratio
                    .unwrap_or(DEFAULT_DRIFT_COMMIT_PATH_RATIO),
            )?,
            query_log_capacity: env_parse(
                "QUERY_LOG_CAPACITY",
                overlay
                    .query_log_capacity
                    .unwrap_or(DEFAULT_QUERY_LOG_CAPACITY),
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), TidepoolError> {
        if self.embedding_dim == 0 {
            return Err(TidepoolError::InvalidInput(
                "EMBEDDING_DIM must be positive".into(),
            ));
        }
        if self.max_ingest_concurrency == 0 {
            return Err(TidepoolError::InvalidInput(
                "MAX_INGEST_CONCURRENCY must be positive".into(),
            ));
        }
        if self.chunk_overlap_chars >= self.chunk_target_chars {
            return Err(TidepoolError::InvalidInput(
                "CHUNK_OVERLAP_CHARS must be smaller than CHUNK_TARGET_CHARS".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.drift_commit_path_ratio) {
            return Err(TidepoolError::InvalidInput(
                "DRIFT_COMMIT_PATH_RATIO must be within [0,1]".into(),
            ));
        }
        Ok(())
    }

    // Persisted-state layout (spec'd tree under the data root).

    pub fn projects_dir(&self) -> PathBuf {
        self.data_root.join("projects")
    }

    pub fn vector_store_dir(&self) -> PathBuf {
        self.data_root.join("vector_store")
    }

    pub fn sacred_plans_dir(&self) -> PathBuf {
        self.data_root.join("sacred_plans")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }

    /// Create the on-disk layout. Idempotent.
    pub fn ensure_layout(&self) -> Result<(), TidepoolError> {
        for dir in [
            self.projects_dir(),
            self.vector_store_dir(),
            self.sacred_plans_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &Path) -> Config {
        Config {
            http_bind: DEFAULT_HTTP_BIND.into(),
            data_root: root.to_path_buf(),
            embedding_api_key: "test-embed-key".into(),
            generation_api_key: "test-gen-key".into(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.into(),
            generation_model: DEFAULT_GENERATION_MODEL.into(),
            embedding_base_url: DEFAULT_EMBEDDING_BASE_URL.into(),
            generation_base_url: DEFAULT_GENERATION_BASE_URL.into(),
            embedding_dim: 8,
            sacred_approval_key: "hatch".into(),
            max_ingest_concurrency: 2,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            chunk_target_chars: DEFAULT_CHUNK_TARGET_CHARS,
            chunk_overlap_chars: DEFAULT_CHUNK_OVERLAP_CHARS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            drift_commit_path_ratio: DEFAULT_DRIFT_COMMIT_PATH_RATIO,
            query_log_capacity: DEFAULT_QUERY_LOG_CAPACITY,
        }
    }

    #[test]
    fn ensure_layout_creates_tree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = test_config(&tmp.path().join("data"));
        config.ensure_layout().expect("layout");
        assert!(config.projects_dir().is_dir());
        assert!(config.vector_store_dir().is_dir());
        assert!(config.sacred_plans_dir().is_dir());
        assert!(config.logs_dir().is_dir());
        // Idempotent.
        config.ensure_layout().expect("layout twice");
    }

    #[test]
    fn validate_rejects_degenerate_values() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(tmp.path());
        config.chunk_overlap_chars = config.chunk_target_chars;
        assert!(config.validate().is_err());

        let mut config = test_config(tmp.path());
        config.drift_commit_path_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overlay_parses_partial_tables() {
        let overlay: FileOverlay =
            toml::from_str("embedding_dim = 1536\nchunk_target_chars = 900").expect("toml");
        assert_eq!(overlay.embedding_dim, Some(1536));
        assert_eq!(overlay.chunk_target_chars, Some(900));
        assert!(overlay.http_bind.is_none());
    }
}
