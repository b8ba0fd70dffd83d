use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::investigation::agents::{lookup_each, partition_lookups};
use crate::investigation::context::InvestigationContext;
use crate::investigation::record::{
    InvestigationRecord, StageErrorKind, StageId, StageOutcome, StageOutput,
};
use crate::investigation::stage::Stage;

pub struct MitigationStage;

#[async_trait]
impl Stage for MitigationStage {
    fn id(&self) -> StageId {
        StageId::Mitigation
    }

    async fn run(
        &self,
        context: &InvestigationContext,
        record: &InvestigationRecord,
    ) -> StageOutcome {
        let knowledge = &context.knowledge;
        let results = lookup_each(
            record.verified_ids(),
            context.config.knowledge_base.max_parallels,
            |id| async move {
                let mitigations = knowledge.mitigations_for_technique(&id).await;
                (id, mitigations)
            },
        )
        .await;

        let (found, failures) = partition_lookups(results);
        if !failures.is_empty() {
            return StageOutcome::new(StageOutput::Mitigation(BTreeMap::new())).with_error(
                StageErrorKind::PartialEnrichmentFailure,
                format!("mitigation lookups failed: {}", failures.join("; ")),
            );
        }

        StageOutcome::new(StageOutput::Mitigation(found.into_iter().collect()))
    }
}
