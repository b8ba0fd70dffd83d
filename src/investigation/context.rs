use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::knowledge::{CatalogKnowledgeBase, InvocationClient, KnowledgeBase};
use crate::llm::{GenerationClient, LLMClient, TextGenerator};
use crate::utils::retry::RetryPolicy;

/// Everything a stage may call out to. Cheap to clone; one per investigation run.
#[derive(Clone)]
pub struct InvestigationContext {
    /// Text generation, with timeout and retry applied
    pub generation: GenerationClient,
    /// ATT&CK knowledge base, with retry applied
    pub knowledge: InvocationClient,
    pub config: Config,
}

impl InvestigationContext {
    pub fn new(
        config: Config,
        generator: Arc<dyn TextGenerator>,
        knowledge_base: Arc<dyn KnowledgeBase>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let generation = GenerationClient::new(generator, config.llm.timeout(), retry.clone());
        let knowledge =
            InvocationClient::new(knowledge_base, retry, &config.knowledge_base.domain);

        Self {
            generation,
            knowledge,
            config,
        }
    }

    /// Wire the configured LLM provider and the local ATT&CK bundle.
    pub fn from_config(config: Config) -> Result<Self> {
        let generator = Arc::new(LLMClient::new(&config.llm)?);
        let catalog = Arc::new(CatalogKnowledgeBase::from_file(
            &config.knowledge_base.bundle_path,
            &config.knowledge_base.domain,
        )?);
        tracing::info!(
            "loaded {} ATT&CK techniques from {:?}",
            catalog.technique_count(),
            config.knowledge_base.bundle_path
        );
        Ok(Self::new(config, generator, catalog))
    }
}
