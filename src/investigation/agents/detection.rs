use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::investigation::agents::{lookup_each, partition_lookups};
use crate::investigation::context::InvestigationContext;
use crate::investigation::record::{
    InvestigationRecord, StageErrorKind, StageId, StageOutcome, StageOutput,
};
use crate::investigation::stage::Stage;

/// Data components able to detect each verified technique.
/// An empty entry means the catalog has no detection mapping for it.
pub struct DetectionStage;

#[async_trait]
impl Stage for DetectionStage {
    fn id(&self) -> StageId {
        StageId::Detection
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
                let components = knowledge.datacomponents_for_technique(&id).await;
                (id, components)
            },
        )
        .await;

        let (found, failures) = partition_lookups(results);
        if !failures.is_empty() {
            return StageOutcome::new(StageOutput::Detection(BTreeMap::new())).with_error(
                StageErrorKind::PartialEnrichmentFailure,
                format!("data component lookups failed: {}", failures.join("; ")),
            );
        }

        let covered = found.iter().filter(|(_, c)| !c.is_empty()).count();
        tracing::info!("detection covered {}/{} technique(s)", covered, found.len());
        StageOutcome::new(StageOutput::Detection(found.into_iter().collect()))
    }
}
