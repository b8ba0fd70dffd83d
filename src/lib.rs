pub mod cli;
pub mod config;
pub mod investigation;
pub mod knowledge;
pub mod llm;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use investigation::workflow::launch;
pub use investigation::{InvestigationContext, InvestigationRecord, Orchestrator};
pub use knowledge::{CatalogKnowledgeBase, KnowledgeBase};
pub use llm::TextGenerator;
