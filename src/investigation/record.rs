use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::types::layer::NavigatorLayer;
use crate::types::technique::{
    Attribution, CandidateTechnique, DataComponent, Mitigation, VerifiedTechnique,
};

/// Stages of the investigation graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Triage,
    Mapping,
    Intelligence,
    Detection,
    Mitigation,
    DetectionReasoning,
    Visualization,
    Report,
}

impl StageId {
    pub const ALL: [StageId; 8] = [
        StageId::Triage,
        StageId::Mapping,
        StageId::Intelligence,
        StageId::Detection,
        StageId::Mitigation,
        StageId::DetectionReasoning,
        StageId::Visualization,
        StageId::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Triage => "triage",
            StageId::Mapping => "mapping",
            StageId::Intelligence => "intelligence",
            StageId::Detection => "detection",
            StageId::Mitigation => "mitigation",
            StageId::DetectionReasoning => "detection_reasoning",
            StageId::Visualization => "visualization",
            StageId::Report => "report",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    TriageFailure,
    NoCandidateTechniques,
    UnverifiedCandidate,
    NoVerifiedTechniques,
    PartialEnrichmentFailure,
    DetectionReasoningFailure,
    ReportFallback,
    PipelineTimeout,
}

impl StageErrorKind {
    /// Errors that end the investigation early and route straight to the report.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StageErrorKind::TriageFailure
                | StageErrorKind::NoCandidateTechniques
                | StageErrorKind::NoVerifiedTechniques
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageErrorKind::TriageFailure => "triage_failure",
            StageErrorKind::NoCandidateTechniques => "no_candidate_techniques",
            StageErrorKind::UnverifiedCandidate => "unverified_candidate",
            StageErrorKind::NoVerifiedTechniques => "no_verified_techniques",
            StageErrorKind::PartialEnrichmentFailure => "partial_enrichment_failure",
            StageErrorKind::DetectionReasoningFailure => "detection_reasoning_failure",
            StageErrorKind::ReportFallback => "report_fallback",
            StageErrorKind::PipelineTimeout => "pipeline_timeout",
        }
    }
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: StageId,
    pub kind: StageErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StageError {
    pub fn new(stage: StageId, kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What a stage produced. Each variant carries exactly the fields its stage owns.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Triage {
        summary: Option<String>,
        candidates: Vec<CandidateTechnique>,
    },
    Mapping(Vec<VerifiedTechnique>),
    Intelligence(BTreeMap<String, Attribution>),
    Detection(BTreeMap<String, Vec<DataComponent>>),
    Mitigation(BTreeMap<String, Vec<Mitigation>>),
    DetectionReasoning(Option<String>),
    Visualization(Option<NavigatorLayer>),
    Report(String),
}

impl StageOutput {
    pub fn stage(&self) -> StageId {
        match self {
            StageOutput::Triage { .. } => StageId::Triage,
            StageOutput::Mapping(_) => StageId::Mapping,
            StageOutput::Intelligence(_) => StageId::Intelligence,
            StageOutput::Detection(_) => StageId::Detection,
            StageOutput::Mitigation(_) => StageId::Mitigation,
            StageOutput::DetectionReasoning(_) => StageId::DetectionReasoning,
            StageOutput::Visualization(_) => StageId::Visualization,
            StageOutput::Report(_) => StageId::Report,
        }
    }
}

/// Stage result: its output plus any errors to append. Stages never return `Result`.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub output: StageOutput,
    pub errors: Vec<StageError>,
}

impl StageOutcome {
    pub fn new(output: StageOutput) -> Self {
        Self {
            output,
            errors: Vec::new(),
        }
    }

    pub fn with_error(mut self, kind: StageErrorKind, message: impl Into<String>) -> Self {
        let stage = self.output.stage();
        self.errors.push(StageError::new(stage, kind, message));
        self
    }

    pub fn with_errors(mut self, errors: impl IntoIterator<Item = StageError>) -> Self {
        self.errors.extend(errors);
        self
    }

    /// Outcome for a stage whose task died (panic or cancellation): the
    /// owned field is left at its empty value and the failure is recorded.
    pub fn failed(stage: StageId, message: impl Into<String>) -> Self {
        let (output, kind) = match stage {
            StageId::Triage => (
                StageOutput::Triage {
                    summary: None,
                    candidates: Vec::new(),
                },
                StageErrorKind::TriageFailure,
            ),
            StageId::Mapping => (
                StageOutput::Mapping(Vec::new()),
                StageErrorKind::NoVerifiedTechniques,
            ),
            StageId::Intelligence => (
                StageOutput::Intelligence(BTreeMap::new()),
                StageErrorKind::PartialEnrichmentFailure,
            ),
            StageId::Detection => (
                StageOutput::Detection(BTreeMap::new()),
                StageErrorKind::PartialEnrichmentFailure,
            ),
            StageId::Mitigation => (
                StageOutput::Mitigation(BTreeMap::new()),
                StageErrorKind::PartialEnrichmentFailure,
            ),
            StageId::DetectionReasoning => (
                StageOutput::DetectionReasoning(None),
                StageErrorKind::DetectionReasoningFailure,
            ),
            StageId::Visualization => (
                StageOutput::Visualization(None),
                StageErrorKind::PartialEnrichmentFailure,
            ),
            StageId::Report => (
                StageOutput::Report(String::new()),
                StageErrorKind::ReportFallback,
            ),
        };
        StageOutcome::new(output).with_error(kind, message)
    }
}

/// Shared state of one investigation.
///
/// Stages only ever see `&InvestigationRecord`; the orchestrator is the single
/// writer and merges each [`StageOutcome`] through [`InvestigationRecord::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationRecord {
    pub investigation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub raw_alert: String,
    pub triage_summary: Option<String>,
    pub candidate_techniques: Vec<CandidateTechnique>,
    pub validated_techniques: Vec<VerifiedTechnique>,
    pub intelligence: BTreeMap<String, Attribution>,
    pub detections: BTreeMap<String, Vec<DataComponent>>,
    pub detection_reasoning: Option<String>,
    pub mitigations: BTreeMap<String, Vec<Mitigation>>,
    pub visualization: Option<NavigatorLayer>,
    pub report: String,
    pub navigator_layer_path: Option<String>,
    pub stage_errors: Vec<StageError>,
    pub completed_stages: Vec<StageId>,
    /// Seconds spent per stage
    pub timings: BTreeMap<StageId, f64>,
}

impl InvestigationRecord {
    pub fn new(raw_alert: &str, navigator_layer_path: Option<String>) -> Self {
        Self {
            investigation_id: Uuid::new_v4(),
            started_at: Utc::now(),
            raw_alert: raw_alert.to_string(),
            triage_summary: None,
            candidate_techniques: Vec::new(),
            validated_techniques: Vec::new(),
            intelligence: BTreeMap::new(),
            detections: BTreeMap::new(),
            detection_reasoning: None,
            mitigations: BTreeMap::new(),
            visualization: None,
            report: String::new(),
            navigator_layer_path,
            stage_errors: Vec::new(),
            completed_stages: Vec::new(),
            timings: BTreeMap::new(),
        }
    }

    /// Merge a stage outcome. A stage is applied at most once; later
    /// outcomes for the same stage are discarded.
    pub fn apply(&mut self, outcome: StageOutcome, elapsed: Duration) {
        let StageOutcome { output, errors } = outcome;
        let stage = output.stage();
        if self.is_completed(stage) {
            tracing::warn!("discarding second outcome for stage {}", stage);
            return;
        }

        match output {
            StageOutput::Triage {
                summary,
                candidates,
            } => {
                self.triage_summary = summary;
                self.candidate_techniques = candidates;
            }
            StageOutput::Mapping(validated) => {
                // validated techniques must come from the candidate list
                self.validated_techniques = validated
                    .into_iter()
                    .filter(|technique| {
                        self.candidate_techniques
                            .iter()
                            .any(|candidate| candidate.identifier == technique.identifier)
                    })
                    .collect();
            }
            StageOutput::Intelligence(intelligence) => self.intelligence = intelligence,
            StageOutput::Detection(detections) => self.detections = detections,
            StageOutput::Mitigation(mitigations) => self.mitigations = mitigations,
            StageOutput::DetectionReasoning(reasoning) => self.detection_reasoning = reasoning,
            StageOutput::Visualization(layer) => self.visualization = layer,
            StageOutput::Report(report) => self.report = report,
        }

        self.stage_errors.extend(errors);
        self.completed_stages.push(stage);
        self.timings.insert(stage, elapsed.as_secs_f64());
    }

    /// Append an error not tied to a stage outcome (e.g. the pipeline deadline).
    pub fn record_error(&mut self, error: StageError) {
        self.stage_errors.push(error);
    }

    pub fn is_completed(&self, stage: StageId) -> bool {
        self.completed_stages.contains(&stage)
    }

    pub fn has_fatal_error(&self) -> bool {
        self.stage_errors.iter().any(|error| error.kind.is_fatal())
    }

    pub fn has_error(&self, kind: StageErrorKind) -> bool {
        self.stage_errors.iter().any(|error| error.kind == kind)
    }

    pub fn verified_ids(&self) -> Vec<String> {
        self.validated_techniques
            .iter()
            .map(|technique| technique.identifier.clone())
            .collect()
    }

    pub fn candidate(&self, technique_id: &str) -> Option<&CandidateTechnique> {
        self.candidate_techniques
            .iter()
            .find(|candidate| candidate.identifier == technique_id)
    }

    /// Verified techniques with an empty or missing detection entry.
    pub fn techniques_without_detections(&self) -> Vec<&VerifiedTechnique> {
        self.validated_techniques
            .iter()
            .filter(|technique| {
                self.detections
                    .get(&technique.identifier)
                    .is_none_or(|components| components.is_empty())
            })
            .collect()
    }
}
