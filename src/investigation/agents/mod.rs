use futures::stream::{self, StreamExt};
use std::future::Future;

use crate::knowledge::KnowledgeBaseError;

pub mod detection;
pub mod detection_reasoning;
pub mod intelligence;
pub mod mapping;
pub mod mitigation;
pub mod report;
pub mod triage;
pub mod visualization;

pub use detection::DetectionStage;
pub use detection_reasoning::DetectionReasoningStage;
pub use intelligence::IntelligenceStage;
pub use mapping::MappingStage;
pub use mitigation::MitigationStage;
pub use report::ReportStage;
pub use triage::TriageStage;
pub use visualization::VisualizationStage;

/// Run one knowledge base lookup per technique with at most `max_parallels`
/// in flight. Results keep the input order.
pub(crate) async fn lookup_each<T, F, Fut>(
    technique_ids: Vec<String>,
    max_parallels: usize,
    lookup: F,
) -> Vec<(String, Result<T, KnowledgeBaseError>)>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = (String, Result<T, KnowledgeBaseError>)>,
{
    stream::iter(technique_ids)
        .map(lookup)
        .buffered(max_parallels.max(1))
        .collect()
        .await
}

/// Split lookup results into successes and a failure summary.
pub(crate) fn partition_lookups<T>(
    results: Vec<(String, Result<T, KnowledgeBaseError>)>,
) -> (Vec<(String, T)>, Vec<String>) {
    let mut found = Vec::new();
    let mut failures = Vec::new();
    for (technique_id, result) in results {
        match result {
            Ok(value) => found.push((technique_id, value)),
            Err(err) => failures.push(format!("{}: {}", technique_id, err)),
        }
    }
    (found, failures)
}
