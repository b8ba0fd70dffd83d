use std::sync::Arc;

use crate::knowledge::{
    KbOperation, KbRecord, KbRequest, KbResponse, KnowledgeBase, KnowledgeBaseError, NamedEntity,
    TechniqueRecord,
};
use crate::types::layer::NavigatorLayer;
use crate::types::technique::{DataComponent, Mitigation};
use crate::utils::retry::RetryPolicy;

/// Uniform, retrying front for a [`KnowledgeBase`].
///
/// Requests are normalized (technique ids upper-cased, `domain` filled in) and
/// responses are narrowed to the record type each operation promises, so
/// stages never match on [`KbRecord`] themselves.
#[derive(Clone)]
pub struct InvocationClient {
    backend: Arc<dyn KnowledgeBase>,
    retry: RetryPolicy,
    domain: String,
}

impl InvocationClient {
    pub fn new(backend: Arc<dyn KnowledgeBase>, retry: RetryPolicy, domain: &str) -> Self {
        Self {
            backend,
            retry,
            domain: domain.to_string(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Send a raw request through the retry policy.
    pub async fn invoke(&self, request: KbRequest) -> Result<KbResponse, KnowledgeBaseError> {
        let request = self.normalize(request);
        let label = format!("knowledge base {}", request.operation);
        let backend = &self.backend;
        let request = &request;
        self.retry
            .run(&label, || async move { backend.query(request).await })
            .await
    }

    fn normalize(&self, mut request: KbRequest) -> KbRequest {
        if let Some(technique_id) = request.str_arg("technique_id") {
            let normalized = technique_id.trim().to_uppercase();
            request = request.arg("technique_id", normalized);
        }
        if request.str_arg("domain").is_none() {
            request = request.arg("domain", self.domain.clone());
        }
        request
    }

    fn technique_request(operation: KbOperation, technique_id: &str) -> KbRequest {
        KbRequest::new(operation).arg("technique_id", technique_id)
    }

    pub async fn technique_by_id(
        &self,
        technique_id: &str,
    ) -> Result<Option<TechniqueRecord>, KnowledgeBaseError> {
        let operation = KbOperation::TechniqueById;
        match self
            .invoke(Self::technique_request(operation, technique_id))
            .await?
        {
            KbResponse::Found(KbRecord::Technique(record)) => Ok(Some(record)),
            KbResponse::Empty => Ok(None),
            KbResponse::Found(other) => Err(mismatch(operation, &other)),
        }
    }

    pub async fn tactics_for_technique(
        &self,
        technique_id: &str,
    ) -> Result<Vec<String>, KnowledgeBaseError> {
        let operation = KbOperation::TacticsForTechnique;
        match self
            .invoke(Self::technique_request(operation, technique_id))
            .await?
        {
            KbResponse::Found(KbRecord::Tactics(tactics)) => Ok(tactics),
            KbResponse::Empty => Ok(Vec::new()),
            KbResponse::Found(other) => Err(mismatch(operation, &other)),
        }
    }

    pub async fn groups_using_technique(
        &self,
        technique_id: &str,
    ) -> Result<Vec<NamedEntity>, KnowledgeBaseError> {
        let operation = KbOperation::GroupsUsingTechnique;
        match self
            .invoke(Self::technique_request(operation, technique_id))
            .await?
        {
            KbResponse::Found(KbRecord::Groups(groups)) => Ok(groups),
            KbResponse::Empty => Ok(Vec::new()),
            KbResponse::Found(other) => Err(mismatch(operation, &other)),
        }
    }

    pub async fn software_using_technique(
        &self,
        technique_id: &str,
    ) -> Result<Vec<NamedEntity>, KnowledgeBaseError> {
        let operation = KbOperation::SoftwareUsingTechnique;
        match self
            .invoke(Self::technique_request(operation, technique_id))
            .await?
        {
            KbResponse::Found(KbRecord::Software(software)) => Ok(software),
            KbResponse::Empty => Ok(Vec::new()),
            KbResponse::Found(other) => Err(mismatch(operation, &other)),
        }
    }

    pub async fn datacomponents_for_technique(
        &self,
        technique_id: &str,
    ) -> Result<Vec<DataComponent>, KnowledgeBaseError> {
        let operation = KbOperation::DatacomponentsForTechnique;
        match self
            .invoke(Self::technique_request(operation, technique_id))
            .await?
        {
            KbResponse::Found(KbRecord::DataComponents(components)) => Ok(components),
            KbResponse::Empty => Ok(Vec::new()),
            KbResponse::Found(other) => Err(mismatch(operation, &other)),
        }
    }

    pub async fn mitigations_for_technique(
        &self,
        technique_id: &str,
    ) -> Result<Vec<Mitigation>, KnowledgeBaseError> {
        let operation = KbOperation::MitigationsForTechnique;
        match self
            .invoke(Self::technique_request(operation, technique_id))
            .await?
        {
            KbResponse::Found(KbRecord::Mitigations(mitigations)) => Ok(mitigations),
            KbResponse::Empty => Ok(Vec::new()),
            KbResponse::Found(other) => Err(mismatch(operation, &other)),
        }
    }

    /// Usage heatmap for the given techniques, scored by the knowledge base itself.
    pub async fn generate_layer(
        &self,
        technique_ids: &[String],
        name: &str,
    ) -> Result<Option<NavigatorLayer>, KnowledgeBaseError> {
        let operation = KbOperation::GenerateLayer;
        let request = KbRequest::new(operation)
            .arg("technique_ids", technique_ids.to_vec())
            .arg("name", name);
        match self.invoke(request).await? {
            KbResponse::Found(KbRecord::Layer(layer)) => Ok(Some(*layer)),
            KbResponse::Empty => Ok(None),
            KbResponse::Found(other) => Err(mismatch(operation, &other)),
        }
    }
}

fn mismatch(operation: KbOperation, record: &KbRecord) -> KnowledgeBaseError {
    let kind = match record {
        KbRecord::Technique(_) => "technique",
        KbRecord::Tactics(_) => "tactics",
        KbRecord::Groups(_) => "groups",
        KbRecord::Software(_) => "software",
        KbRecord::DataComponents(_) => "data components",
        KbRecord::Mitigations(_) => "mitigations",
        KbRecord::Layer(_) => "layer",
    };
    KnowledgeBaseError::MalformedResponse {
        operation,
        message: format!("received a {} record", kind),
    }
}
