use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use crate::investigation::agents::{lookup_each, partition_lookups};
use crate::investigation::context::InvestigationContext;
use crate::investigation::record::{
    InvestigationRecord, StageErrorKind, StageId, StageOutcome, StageOutput,
};
use crate::investigation::stage::Stage;
use crate::knowledge::NamedEntity;
use crate::types::technique::Attribution;

/// Groups and software known to use each verified technique.
pub struct IntelligenceStage;

fn bounded_names(entities: Vec<NamedEntity>, max_items: usize) -> BTreeSet<String> {
    entities
        .into_iter()
        .map(|entity| entity.name)
        .filter(|name| !name.trim().is_empty())
        .take(max_items)
        .collect()
}

#[async_trait]
impl Stage for IntelligenceStage {
    fn id(&self) -> StageId {
        StageId::Intelligence
    }

    async fn run(
        &self,
        context: &InvestigationContext,
        record: &InvestigationRecord,
    ) -> StageOutcome {
        let knowledge = &context.knowledge;
        let max_items = context.config.pipeline.max_attribution_items;

        let results = lookup_each(
            record.verified_ids(),
            context.config.knowledge_base.max_parallels,
            |id| async move {
                let attribution = futures::try_join!(
                    knowledge.groups_using_technique(&id),
                    knowledge.software_using_technique(&id)
                )
                .map(|(groups, software)| Attribution {
                    groups: bounded_names(groups, max_items),
                    software: bounded_names(software, max_items),
                });
                (id, attribution)
            },
        )
        .await;

        let (found, failures) = partition_lookups(results);
        if !failures.is_empty() {
            return StageOutcome::new(StageOutput::Intelligence(BTreeMap::new())).with_error(
                StageErrorKind::PartialEnrichmentFailure,
                format!("attribution lookups failed: {}", failures.join("; ")),
            );
        }

        let attributed = found.iter().filter(|(_, a)| !a.is_empty()).count();
        tracing::info!("intelligence attributed {}/{} technique(s)", attributed, found.len());
        StageOutcome::new(StageOutput::Intelligence(found.into_iter().collect()))
    }
}
