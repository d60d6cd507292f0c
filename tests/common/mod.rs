//! Shared fixtures: deterministic in-process embedding/generation clients
//! and a test configuration rooted in a tempdir.
#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tidepool::core::config::Config;
use tidepool::core::embed::Embedder;
use tidepool::core::error::TidepoolError;
use tidepool::core::generate::Generator;

pub const TEST_DIM: usize = 64;
pub const TEST_APPROVAL_KEY: &str = "tide-approval-key";

/// Deterministic bag-of-words embedder: each token hashes into one of
/// `dim` buckets; vectors are L2-normalised. Shared tokens yield nonzero
/// cosine similarity, which is all the pipelines need.
pub struct HashEmbedder {
    pub dim: usize,
    /// Optional artificial latency per batch, for cancellation tests.
    pub delay: Option<Duration>,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        HashEmbedder { dim, delay: None }
    }

    pub fn slow(dim: usize, delay: Duration) -> Self {
        HashEmbedder {
            dim,
            delay: Some(delay),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = token
                .bytes()
                .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
                % self.dim;
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TidepoolError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// Generator that answers deterministically from the prompt.
pub struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, prompt: &str, _max_tokens: usize) -> Result<String, TidepoolError> {
        let question = prompt
            .rsplit("Question: ")
            .next()
            .unwrap_or_default()
            .trim();
        Ok(format!("Grounded answer to: {question}"))
    }
}

/// Generator that is always down; exercises the degraded path.
pub struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    async fn generate(&self, _prompt: &str, _max_tokens: usize) -> Result<String, TidepoolError> {
        Err(TidepoolError::DependencyUnavailable(
            "generation service offline".into(),
        ))
    }
}

/// A full config rooted at `data_root`, sized for tests.
pub fn test_config(data_root: &Path) -> Config {
    test_config_with_dim(data_root, TEST_DIM)
}

pub fn test_config_with_dim(data_root: &Path, dim: usize) -> Config {
    Config {
        http_bind: "127.0.0.1:0".into(),
        data_root: data_root.to_path_buf(),
        embedding_api_key: "test-embed-key".into(),
        generation_api_key: "test-gen-key".into(),
        embedding_model: "hash-embed".into(),
        generation_model: "echo".into(),
        embedding_base_url: "http://127.0.0.1:1/v1".into(),
        generation_base_url: "http://127.0.0.1:1/v1".into(),
        embedding_dim: dim,
        sacred_approval_key: TEST_APPROVAL_KEY.into(),
        max_ingest_concurrency: 2,
        max_file_bytes: 1024 * 1024,
        chunk_target_chars: 400,
        chunk_overlap_chars: 40,
        request_timeout_secs: 30,
        drift_commit_path_ratio: 0.5,
        query_log_capacity: 64,
    }
}
