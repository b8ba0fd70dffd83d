//! LLM client - the rig-backed [`TextGenerator`]

use anyhow::Result;
use async_trait::async_trait;

use crate::config::LLMConfig;
use crate::llm::{GenerationError, GenerationRequest, GenerationResponse, TextGenerator};

mod providers;

use providers::ProviderClient;

/// Generation service talking to the configured provider.
///
/// Retries and timeouts live in [`crate::llm::GenerationClient`]; one call
/// here is exactly one provider request.
#[derive(Clone)]
pub struct LLMClient {
    config: LLMConfig,
    client: ProviderClient,
}

impl LLMClient {
    pub fn new(config: &LLMConfig) -> Result<Self> {
        let client = ProviderClient::new(config)?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[async_trait]
impl TextGenerator for LLMClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        let max_tokens = request.max_tokens.min(self.config.max_tokens);
        let agent = self
            .client
            .create_agent(
                &self.config.model,
                request.system_prompt.as_deref().unwrap_or_default(),
                max_tokens,
                request.temperature,
            )
            .map_err(|e| GenerationError::InvalidRequest(e.to_string()))?;

        tracing::debug!(
            "prompting {} ({} chars, max_tokens={})",
            self.config.model,
            request.prompt.len(),
            max_tokens
        );

        let text = agent
            .prompt(&request.prompt)
            .await
            .map_err(|e| GenerationError::classify(e.to_string()))?;
        Ok(GenerationResponse { text })
    }
}
