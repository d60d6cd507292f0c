//! Embedding client.
//!
//! [`Embedder`] is the seam between the retrieval pipeline and the external
//! embedding service. The production implementation speaks the
//! OpenAI-compatible `/embeddings` shape over HTTP; tests substitute
//! deterministic in-process embedders.
//!
//! Rate-limit and transient network failures retry with exponential backoff
//! and jitter (base 500 ms, cap 30 s, 6 attempts) before surfacing
//! `RateLimited` / `DependencyUnavailable`.

use crate::core::error::TidepoolError;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const BACKOFF_BASE_MS: u64 = 500;
pub const BACKOFF_CAP_MS: u64 = 30_000;
pub const BACKOFF_ATTEMPTS: u32 = 6;

/// Produces fixed-dimension vectors from text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TidepoolError>;

    /// The dimension every returned vector must have.
    fn dimension(&self) -> usize;
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// HTTP embedder for OpenAI-compatible endpoints.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        dimension: usize,
    ) -> Result<Self, TidepoolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TidepoolError::Internal(format!("http client: {e}")))?;
        Ok(HttpEmbedder {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimension,
        })
    }

    /// Cheap reachability probe used by startup validation and `/health`.
    pub async fn probe(&self) -> Result<(), TidepoolError> {
        self.embed(&["ping".to_string()]).await.map(|_| ())
    }

    async fn call_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TidepoolError> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| TidepoolError::DependencyUnavailable(format!("embedding service: {e}")))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(TidepoolError::RateLimited(
                "embedding service rate limit".into(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TidepoolError::DependencyUnavailable(format!(
                "embedding service returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| TidepoolError::DependencyUnavailable(format!("embedding response: {e}")))?;

        let mut vectors: Vec<(usize, Vec<f32>)> = parsed
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        vectors.sort_by_key(|(index, _)| *index);
        let vectors: Vec<Vec<f32>> = vectors.into_iter().map(|(_, v)| v).collect();

        if vectors.len() != texts.len() {
            return Err(TidepoolError::DependencyUnavailable(format!(
                "embedding service returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(TidepoolError::Integrity(format!(
                    "embedding dimension {} does not match configured {}",
                    vector.len(),
                    self.dimension
                )));
            }
        }
        Ok(vectors)
    }
}

/// Backoff delay for the given attempt (0-based), with jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10));
    let capped = exp.min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, TidepoolError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut last_err = None;
        for attempt in 0..BACKOFF_ATTEMPTS {
            match self.call_once(texts).await {
                Ok(vectors) => {
                    debug!(batch = texts.len(), attempt, "embedded batch");
                    return Ok(vectors);
                }
                Err(err @ (TidepoolError::RateLimited(_) | TidepoolError::DependencyUnavailable(_))) => {
                    if attempt + 1 < BACKOFF_ATTEMPTS {
                        let delay = backoff_delay(attempt);
                        warn!(attempt, ?delay, %err, "embedding call failed; backing off");
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| TidepoolError::DependencyUnavailable("embedding service".into())))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..8 {
            let d0 = backoff_delay(0);
            assert!(d0 >= Duration::from_millis(500));
            assert!(d0 <= Duration::from_millis(625));
            let d5 = backoff_delay(5);
            assert!(d5 >= Duration::from_millis(16_000));
            let d9 = backoff_delay(9);
            assert!(d9 <= Duration::from_millis(BACKOFF_CAP_MS + BACKOFF_CAP_MS / 4));
        }
    }

    #[test]
    fn response_ordering_uses_index() {
        let raw = r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#;
        let parsed: EmbeddingsResponse = serde_json::from_str(raw).expect("parse");
        let mut vectors: Vec<(usize, Vec<f32>)> = parsed
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        vectors.sort_by_key(|(index, _)| *index);
        assert_eq!(vectors[0].1, vec![1.0, 0.0]);
        assert_eq!(vectors[1].1, vec![0.0, 1.0]);
    }
}
