use async_trait::async_trait;

use crate::investigation::agents::lookup_each;
use crate::investigation::context::InvestigationContext;
use crate::investigation::record::{
    InvestigationRecord, StageError, StageErrorKind, StageId, StageOutcome, StageOutput,
};
use crate::investigation::stage::Stage;
use crate::knowledge::{KnowledgeBaseError, TechniqueRecord};
use crate::types::technique::VerifiedTechnique;

/// Validates triage candidates against the knowledge base.
///
/// Unknown identifiers are dropped, never corrected: this is the only way
/// techniques enter `validated_techniques`.
pub struct MappingStage;

#[async_trait]
impl Stage for MappingStage {
    fn id(&self) -> StageId {
        StageId::Mapping
    }

    async fn run(
        &self,
        context: &InvestigationContext,
        record: &InvestigationRecord,
    ) -> StageOutcome {
        let knowledge = &context.knowledge;
        let ids = record
            .candidate_techniques
            .iter()
            .map(|candidate| candidate.identifier.clone())
            .collect();

        let results = lookup_each(ids, context.config.knowledge_base.max_parallels, |id| async move {
            let resolved = async {
                let Some(technique) = knowledge.technique_by_id(&id).await? else {
                    return Ok(None);
                };
                // a verified technique survives a failed tactics lookup
                let tactics = match knowledge.tactics_for_technique(&id).await {
                    Ok(tactics) => tactics,
                    Err(err) => {
                        tracing::warn!(
                            "tactics lookup for {} failed, keeping it untagged: {}",
                            id,
                            err
                        );
                        Vec::new()
                    }
                };
                Ok::<_, KnowledgeBaseError>(Some((technique, tactics)))
            }
            .await;
            (id, resolved)
        })
        .await;

        let mut validated = Vec::new();
        let mut errors = Vec::new();
        for (technique_id, result) in results {
            match result {
                Ok(Some((technique, tactics))) => {
                    validated.push(verified(technique_id, technique, tactics));
                }
                Ok(None) => errors.push(StageError::new(
                    StageId::Mapping,
                    StageErrorKind::UnverifiedCandidate,
                    format!("{} not found in the knowledge base", technique_id),
                )),
                Err(err) => errors.push(StageError::new(
                    StageId::Mapping,
                    StageErrorKind::UnverifiedCandidate,
                    format!("{} could not be verified: {}", technique_id, err),
                )),
            }
        }

        tracing::info!(
            "mapping verified {}/{} candidate technique(s)",
            validated.len(),
            record.candidate_techniques.len()
        );

        let empty = validated.is_empty();
        let outcome = StageOutcome::new(StageOutput::Mapping(validated)).with_errors(errors);
        if empty {
            outcome.with_error(
                StageErrorKind::NoVerifiedTechniques,
                "no candidate technique exists in the knowledge base",
            )
        } else {
            outcome
        }
    }
}

fn verified(
    technique_id: String,
    technique: TechniqueRecord,
    tactics: Vec<String>,
) -> VerifiedTechnique {
    VerifiedTechnique {
        identifier: technique_id,
        name: technique.name,
        tactics,
        stix_id: Some(technique.stix_id).filter(|id| !id.is_empty()),
        description: technique.description,
        verified: true,
    }
}
