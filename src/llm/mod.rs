//! Text generation - the LLM service used by triage, detection reasoning and the report

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::utils::retry::{RetryPolicy, Retryable};

pub mod client;

pub use client::LLMClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Preamble sent as the system message
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: None,
            prompt: prompt.into(),
            max_tokens: 2048,
            temperature: 0.2,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("generation service rate limited: {0}")]
    RateLimited(String),

    #[error("generation timed out: {0}")]
    Timeout(String),

    #[error("generation blocked by content filter: {0}")]
    ContentFiltered(String),

    #[error("generation service rejected credentials: {0}")]
    Authentication(String),

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("generation provider error: {0}")]
    Provider(String),
}

impl GenerationError {
    /// Map a provider error message onto the error taxonomy.
    ///
    /// Provider SDKs surface HTTP failures as strings, so this is a best
    /// effort match on status codes and well-known error types.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

        // content filtering first, it is never retryable
        if has(&["content_filter", "content filter", "content management policy"]) {
            GenerationError::ContentFiltered(message)
        } else if has(&[
            "status 429",
            "429 ",
            "rate limit",
            "rate_limit",
            "too many requests",
        ]) {
            GenerationError::RateLimited(message)
        } else if has(&["timed out", "timeout", "deadline exceeded"]) {
            GenerationError::Timeout(message)
        } else if has(&["401", "403", "unauthorized", "invalid api key", "authentication"]) {
            GenerationError::Authentication(message)
        } else if has(&["bad request", "invalid_request_error", "context length"]) {
            GenerationError::InvalidRequest(message)
        } else {
            GenerationError::Provider(message)
        }
    }
}

impl Retryable for GenerationError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimited(_)
                | GenerationError::Timeout(_)
                | GenerationError::Provider(_)
        )
    }
}

/// Text generation service. Implementations must be safe for concurrent use.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError>;
}

/// Uniform front for a [`TextGenerator`]: bounds each attempt with a timeout
/// and retries transient failures.
#[derive(Clone)]
pub struct GenerationClient {
    backend: Arc<dyn TextGenerator>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GenerationClient {
    pub fn new(backend: Arc<dyn TextGenerator>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            backend,
            timeout,
            retry,
        }
    }

    /// Generate text, returning the trimmed response body.
    /// An empty response counts as a transient provider error.
    pub async fn generate(
        &self,
        label: &str,
        request: GenerationRequest,
    ) -> Result<String, GenerationError> {
        let backend = &self.backend;
        let request = &request;
        let timeout = self.timeout;

        self.retry
            .run(label, || async move {
                let response = tokio::time::timeout(timeout, backend.generate(request))
                    .await
                    .map_err(|_| {
                        GenerationError::Timeout(format!("no response within {:?}", timeout))
                    })??;
                let text = response.text.trim();
                if text.is_empty() {
                    return Err(GenerationError::Provider("empty response".to_string()));
                }
                Ok(text.to_string())
            })
            .await
    }
}
