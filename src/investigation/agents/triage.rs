use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use std::collections::HashSet;

use crate::investigation::context::InvestigationContext;
use crate::investigation::record::{
    InvestigationRecord, StageErrorKind, StageId, StageOutcome, StageOutput,
};
use crate::investigation::stage::Stage;
use crate::llm::GenerationRequest;
use crate::types::technique::{CandidateTechnique, Confidence, normalize_technique_id};
use crate::utils::text::{clip, dedupe_preserving_order, extract_json_object};

const MAX_EVIDENCE_PER_TECHNIQUE: usize = 6;
const MAX_EVIDENCE_CHARS: usize = 120;
const MAX_SUMMARY_CHARS: usize = 600;

const SYSTEM_PROMPT: &str = "You are a SOC triage analyst specialized in mapping EDR alerts to MITRE ATT&CK. \
Identify the attack patterns in the incident and name ATT&CK technique IDs only when confident \
(Txxxx or Txxxx.xxx). For each technique give short evidence phrases copied or paraphrased from \
the incident text, such as process names, command line flags or scheduled task names. \
Return only valid JSON.";

/// Shape the model is asked to return
#[derive(Debug, Deserialize, JsonSchema)]
pub struct TriageResponse {
    /// Short incident summary, at most 600 characters
    #[serde(default)]
    pub summary: String,
    /// Candidate techniques ordered by likelihood
    #[serde(default)]
    pub techniques: Vec<TriageCandidate>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TriageCandidate {
    /// ATT&CK technique id, e.g. T1059.001
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// low, medium or high
    #[serde(default)]
    pub confidence: Option<String>,
    /// Short concrete phrases from the incident text, at most 80 characters each
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Extracts candidate techniques from the raw alert with one generation call.
pub struct TriageStage;

impl TriageStage {
    fn prompt(raw_alert: &str, max_candidates: usize) -> String {
        let schema = schemars::schema_for!(TriageResponse);
        let schema = serde_json::to_string_pretty(&schema).unwrap_or_default();
        format!(
            "Incident text:\n\"\"\"\n{}\n\"\"\"\n\n\
             Rules:\n\
             - Only include identifiers that start with 'T' followed by four digits, with an optional .xxx sub-technique.\n\
             - Include up to {} techniques, ordered by likelihood.\n\
             - Evidence phrases must be short and concrete.\n\n\
             Respond with a single JSON object matching this schema:\n{}",
            raw_alert.trim(),
            max_candidates,
            schema
        )
    }

    /// Turn the model answer into candidates: malformed ids and duplicates
    /// are dropped, evidence is de-duplicated and bounded.
    pub fn parse_candidates(
        response: &str,
        max_candidates: usize,
    ) -> Result<(Option<String>, Vec<CandidateTechnique>), String> {
        let json = extract_json_object(response)
            .ok_or_else(|| "response contained no JSON object".to_string())?;
        let parsed: TriageResponse = serde_json::from_str(&json)
            .map_err(|e| format!("response did not match the triage schema: {}", e))?;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for candidate in parsed.techniques {
            let Some(identifier) = normalize_technique_id(&candidate.id) else {
                tracing::debug!("triage dropped malformed technique id {:?}", candidate.id);
                continue;
            };
            if !seen.insert(identifier.clone()) {
                continue;
            }

            let confidence = candidate
                .confidence
                .as_deref()
                .and_then(|value| value.parse::<Confidence>().ok())
                .unwrap_or_default();
            let evidence = dedupe_preserving_order(
                candidate
                    .evidence
                    .iter()
                    .map(|phrase| clip(phrase, MAX_EVIDENCE_CHARS)),
                MAX_EVIDENCE_PER_TECHNIQUE,
            );

            candidates.push(CandidateTechnique {
                identifier,
                name: candidate.name.trim().to_string(),
                confidence,
                evidence,
            });
            if candidates.len() >= max_candidates {
                break;
            }
        }

        let summary = Some(clip(&parsed.summary, MAX_SUMMARY_CHARS)).filter(|s| !s.is_empty());
        Ok((summary, candidates))
    }
}

#[async_trait]
impl Stage for TriageStage {
    fn id(&self) -> StageId {
        StageId::Triage
    }

    async fn run(
        &self,
        context: &InvestigationContext,
        record: &InvestigationRecord,
    ) -> StageOutcome {
        let max_candidates = context.config.pipeline.max_candidates.max(1);
        let request = GenerationRequest::new(Self::prompt(&record.raw_alert, max_candidates))
            .with_system_prompt(SYSTEM_PROMPT)
            .with_temperature(0.2);

        let empty = StageOutput::Triage {
            summary: None,
            candidates: Vec::new(),
        };

        let response = match context.generation.generate("triage", request).await {
            Ok(response) => response,
            Err(err) => {
                return StageOutcome::new(empty).with_error(
                    StageErrorKind::TriageFailure,
                    format!("generation failed: {}", err),
                );
            }
        };

        match Self::parse_candidates(&response, max_candidates) {
            Ok((summary, candidates)) if candidates.is_empty() => StageOutcome::new(
                StageOutput::Triage {
                    summary,
                    candidates,
                },
            )
            .with_error(
                StageErrorKind::NoCandidateTechniques,
                "triage produced no usable technique identifiers",
            ),
            Ok((summary, candidates)) => {
                tracing::info!("triage proposed {} candidate technique(s)", candidates.len());
                StageOutcome::new(StageOutput::Triage {
                    summary,
                    candidates,
                })
            }
            Err(message) => StageOutcome::new(empty).with_error(StageErrorKind::TriageFailure, message),
        }
    }
}
