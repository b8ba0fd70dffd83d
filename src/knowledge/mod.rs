//! Knowledge base access - the read-only ATT&CK catalog the pipeline validates against

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::layer::NavigatorLayer;
use crate::types::technique::{DataComponent, Mitigation};
use crate::utils::retry::Retryable;

pub mod catalog;
pub mod client;

pub use catalog::CatalogKnowledgeBase;
pub use client::InvocationClient;

/// Lookups the knowledge base understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KbOperation {
    TechniqueById,
    TacticsForTechnique,
    GroupsUsingTechnique,
    SoftwareUsingTechnique,
    DatacomponentsForTechnique,
    MitigationsForTechnique,
    GenerateLayer,
}

impl std::fmt::Display for KbOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KbOperation::TechniqueById => write!(f, "technique_by_id"),
            KbOperation::TacticsForTechnique => write!(f, "tactics_for_technique"),
            KbOperation::GroupsUsingTechnique => write!(f, "groups_using_technique"),
            KbOperation::SoftwareUsingTechnique => write!(f, "software_using_technique"),
            KbOperation::DatacomponentsForTechnique => write!(f, "datacomponents_for_technique"),
            KbOperation::MitigationsForTechnique => write!(f, "mitigations_for_technique"),
            KbOperation::GenerateLayer => write!(f, "generate_layer"),
        }
    }
}

/// A typed lookup: operation plus free-form arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbRequest {
    pub operation: KbOperation,
    pub args: Map<String, Value>,
}

impl KbRequest {
    pub fn new(operation: KbOperation) -> Self {
        Self {
            operation,
            args: Map::new(),
        }
    }

    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    /// String argument that must be present
    pub fn required_str(&self, key: &str) -> Result<&str, KnowledgeBaseError> {
        self.str_arg(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                KnowledgeBaseError::InvalidRequest(format!(
                    "{} requires a non-empty `{}` argument",
                    self.operation, key
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechniqueRecord {
    pub id: String,
    pub name: String,
    pub stix_id: String,
    pub description: Option<String>,
}

/// Group or software entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedEntity {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KbRecord {
    Technique(TechniqueRecord),
    Tactics(Vec<String>),
    Groups(Vec<NamedEntity>),
    Software(Vec<NamedEntity>),
    DataComponents(Vec<DataComponent>),
    Mitigations(Vec<Mitigation>),
    Layer(Box<NavigatorLayer>),
}

/// `Empty` is how `not_found` is reported; it is a normal answer, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KbResponse {
    Found(KbRecord),
    Empty,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KnowledgeBaseError {
    #[error("knowledge base unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("invalid knowledge base request: {0}")]
    InvalidRequest(String),

    #[error("unexpected response to {operation}: {message}")]
    MalformedResponse {
        operation: KbOperation,
        message: String,
    },
}

impl Retryable for KnowledgeBaseError {
    fn is_retryable(&self) -> bool {
        matches!(self, KnowledgeBaseError::ServiceUnavailable(_))
    }
}

/// Read-only knowledge base service. Implementations must be safe for
/// concurrent use; the pipeline shares one instance across stages.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn query(&self, request: &KbRequest) -> Result<KbResponse, KnowledgeBaseError>;
}
