use async_trait::async_trait;

use crate::investigation::context::InvestigationContext;
use crate::investigation::record::{InvestigationRecord, StageId, StageOutcome};

/// One node of the investigation graph.
///
/// A stage reads an immutable snapshot of the record and reports what it
/// produced; failures are part of the outcome, never an `Err`.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    async fn run(
        &self,
        context: &InvestigationContext,
        record: &InvestigationRecord,
    ) -> StageOutcome;
}
