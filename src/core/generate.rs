//! Generation client for retrieval-augmented answers.
//!
//! Mirrors the [`crate::core::embed`] seam: a trait boundary with an
//! OpenAI-compatible chat-completions implementation behind it, and the same
//! backoff-with-jitter retry policy for rate limits and transient network
//! failures. Generation is the longest-latency dependency in the system; the
//! client enforces the 30 s target timeout itself and callers add the hard
//! request deadline.

use crate::core::embed::{backoff_delay, BACKOFF_ATTEMPTS};
use crate::core::error::TidepoolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Produces natural-language answers from a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String, TidepoolError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// HTTP generator for OpenAI-compatible chat endpoints.
pub struct HttpGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpGenerator {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, TidepoolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TidepoolError::Internal(format!("http client: {e}")))?;
        Ok(HttpGenerator {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    /// Reachability probe used by startup validation and `/health`.
    pub async fn probe(&self) -> Result<(), TidepoolError> {
        self.generate("Reply with the single word: ok", 8)
            .await
            .map(|_| ())
    }

    async fn call_once(&self, prompt: &str, max_tokens: usize) -> Result<String, TidepoolError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                messages: vec![ChatMessage {
                    role: "user",
                    content: prompt,
                }],
                max_tokens,
            })
            .send()
            .await
            .map_err(|e| {
                TidepoolError::DependencyUnavailable(format!("generation service: {e}"))
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(TidepoolError::RateLimited(
                "generation service rate limit".into(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TidepoolError::DependencyUnavailable(format!(
                "generation service returned {status}: {body}"
            )));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            TidepoolError::DependencyUnavailable(format!("generation response: {e}"))
        })?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                TidepoolError::DependencyUnavailable("generation service returned no choices".into())
            })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String, TidepoolError> {
        let mut last_err = None;
        for attempt in 0..BACKOFF_ATTEMPTS {
            match self.call_once(prompt, max_tokens).await {
                Ok(answer) => return Ok(answer),
                Err(err @ (TidepoolError::RateLimited(_) | TidepoolError::DependencyUnavailable(_))) => {
                    if attempt + 1 < BACKOFF_ATTEMPTS {
                        let delay = backoff_delay(attempt);
                        warn!(attempt, ?delay, %err, "generation call failed; backing off");
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| TidepoolError::DependencyUnavailable("generation service".into())))
    }
}
