use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::investigation::agents::{
    DetectionReasoningStage, DetectionStage, IntelligenceStage, MappingStage, MitigationStage,
    ReportStage, TriageStage, VisualizationStage,
};
use crate::investigation::context::InvestigationContext;
use crate::investigation::graph::{StageGraph, StageState};
use crate::investigation::record::{
    InvestigationRecord, StageError, StageErrorKind, StageId, StageOutcome,
};
use crate::investigation::stage::Stage;

/// Runs one investigation over the stage graph.
///
/// Ready stages run concurrently in waves; every wave is drained before the
/// next is planned, so fan-in needs no extra synchronisation. Report always
/// runs last, after the deadline too.
pub struct Orchestrator {
    graph: StageGraph,
    stages: HashMap<StageId, Arc<dyn Stage>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(TriageStage),
            Arc::new(MappingStage),
            Arc::new(IntelligenceStage),
            Arc::new(DetectionStage),
            Arc::new(MitigationStage),
            Arc::new(DetectionReasoningStage),
            Arc::new(VisualizationStage),
            Arc::new(ReportStage),
        ];
        Self::new(StageGraph::investigation(), stages)
    }
}

enum WaveResult {
    Drained,
    DeadlineExpired,
}

impl Orchestrator {
    pub fn new(graph: StageGraph, stages: Vec<Arc<dyn Stage>>) -> Self {
        let stages = stages
            .into_iter()
            .map(|stage| (stage.id(), stage))
            .collect();
        Self { graph, stages }
    }

    /// Investigate one alert. Always returns a record with a non-empty report.
    pub async fn investigate(
        &self,
        context: &InvestigationContext,
        raw_alert: &str,
    ) -> InvestigationRecord {
        let layer_path = context.config.layer_path().to_string_lossy().to_string();
        let mut record = InvestigationRecord::new(raw_alert, Some(layer_path));
        let pipeline = &context.config.pipeline;
        let deadline = instant_after(Instant::now(), pipeline.deadline());
        let mut states = self.graph.initial_states();

        tracing::info!("investigation {} started", record.investigation_id);

        loop {
            let wave: Vec<StageId> = self
                .graph
                .next_wave(&mut states, &record)
                .into_iter()
                .filter(|stage| *stage != StageId::Report)
                .collect();
            if wave.is_empty() {
                break;
            }

            tracing::debug!("running wave {:?}", wave);
            match self
                .run_wave(context, &mut record, &mut states, &wave, deadline)
                .await
            {
                WaveResult::Drained => {}
                WaveResult::DeadlineExpired => {
                    let unfinished: Vec<StageId> = wave
                        .iter()
                        .copied()
                        .filter(|stage| !record.is_completed(*stage))
                        .collect();
                    let names = unfinished
                        .iter()
                        .map(StageId::to_string)
                        .collect::<Vec<_>>()
                        .join(", ");
                    tracing::warn!(
                        "deadline of {:?} expired, abandoning {}",
                        pipeline.deadline(),
                        names
                    );
                    record.record_error(StageError::new(
                        unfinished.first().copied().unwrap_or(StageId::Report),
                        StageErrorKind::PipelineTimeout,
                        format!(
                            "deadline of {}s expired; unfinished stages: {}",
                            pipeline.deadline_seconds, names
                        ),
                    ));
                    break;
                }
            }
        }

        self.run_report(context, &mut record, deadline).await;
        tracing::info!(
            "investigation {} finished: {} verified technique(s), {} stage error(s)",
            record.investigation_id,
            record.validated_techniques.len(),
            record.stage_errors.len()
        );
        record
    }

    async fn run_wave(
        &self,
        context: &InvestigationContext,
        record: &mut InvestigationRecord,
        states: &mut BTreeMap<StageId, StageState>,
        wave: &[StageId],
        deadline: Instant,
    ) -> WaveResult {
        let snapshot = Arc::new(record.clone());
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::new();

        for stage_id in wave {
            let Some(stage) = self.stages.get(stage_id).cloned() else {
                tracing::warn!("no implementation registered for stage {}", stage_id);
                states.insert(*stage_id, StageState::Skipped);
                continue;
            };
            let context = context.clone();
            let snapshot = snapshot.clone();
            let started = Instant::now();
            let handle = tasks.spawn(async move {
                let outcome = stage.run(&context, &snapshot).await;
                (outcome, started.elapsed())
            });
            spawned.insert(handle.id(), (*stage_id, started));
        }

        loop {
            let next = tokio::time::timeout_at(deadline, tasks.join_next_with_id()).await;
            match next {
                Err(_) => {
                    // completed outputs are already applied; abandon the rest
                    tasks.abort_all();
                    return WaveResult::DeadlineExpired;
                }
                Ok(None) => return WaveResult::Drained,
                Ok(Some(Ok((_, (outcome, elapsed))))) => {
                    let stage = outcome.output.stage();
                    tracing::debug!("stage {} finished in {:?}", stage, elapsed);
                    record.apply(outcome, elapsed);
                    states.insert(stage, StageState::Completed);
                }
                Ok(Some(Err(join_error))) => {
                    let Some((stage, started)) = spawned.get(&join_error.id()).copied() else {
                        continue;
                    };
                    tracing::warn!("stage {} task failed: {}", stage, join_error);
                    record.apply(
                        StageOutcome::failed(stage, format!("stage task failed: {}", join_error)),
                        started.elapsed(),
                    );
                    states.insert(stage, StageState::Completed);
                }
            }
        }
    }

    /// Run the report under the remaining deadline plus the grace period,
    /// falling back to the template when that budget runs out.
    async fn run_report(
        &self,
        context: &InvestigationContext,
        record: &mut InvestigationRecord,
        deadline: Instant,
    ) {
        let grace = context.config.pipeline.report_grace();
        let timed_out = record.has_error(StageErrorKind::PipelineTimeout);
        let started = Instant::now();

        if timed_out && grace.is_zero() {
            let outcome = ReportStage::fallback(record, "pipeline deadline expired");
            record.apply(outcome, started.elapsed());
            return;
        }

        let report_deadline = instant_after(deadline.max(started), grace);
        let outcome = match self.stages.get(&StageId::Report) {
            Some(stage) => {
                let result = tokio::time::timeout_at(report_deadline, stage.run(context, record)).await;
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        if !timed_out {
                            record.record_error(StageError::new(
                                StageId::Report,
                                StageErrorKind::PipelineTimeout,
                                format!(
                                    "report did not finish within the deadline plus {:?} grace",
                                    grace
                                ),
                            ));
                        }
                        ReportStage::fallback(record, "report generation exceeded its time budget")
                    }
                }
            }
            None => ReportStage::fallback(record, "no report stage registered"),
        };
        record.apply(outcome, started.elapsed());
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }
}

/// `start + budget`, saturating at thirty years for budgets `Instant` cannot represent.
fn instant_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);
