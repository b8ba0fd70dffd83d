use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::investigation::context::InvestigationContext;
use crate::investigation::record::{
    InvestigationRecord, StageErrorKind, StageId, StageOutcome, StageOutput,
};
use crate::investigation::stage::Stage;
use crate::llm::GenerationRequest;
use crate::types::technique::{Confidence, VerifiedTechnique};
use crate::utils::text::{clip, extract_json_object};

const MAX_HYPOTHESES: usize = 3;
const MIN_TELEMETRY: usize = 2;
const MAX_TELEMETRY: usize = 8;
const DEFAULT_TELEMETRY: [&str; 2] = [
    "Endpoint process telemetry (EDR/Sysmon)",
    "Network telemetry (DNS/Proxy/Firewall)",
];

const SYSTEM_PROMPT: &str = "You are a senior detection engineer. Give detection ideas that are \
practical, log-source oriented and defensible. Focus on telemetry sources such as EDR, Sysmon, \
Windows Event Logs, proxy and DNS. Output must be valid JSON matching the provided schema.";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReasoningResponse {
    #[serde(default)]
    pub techniques: Vec<TechniqueHypotheses>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TechniqueHypotheses {
    pub technique_id: String,
    #[serde(default)]
    pub hypotheses: Vec<Hypothesis>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct Hypothesis {
    /// At most 140 characters
    pub title: String,
    /// Two to eight telemetry sources
    #[serde(default)]
    pub telemetry: Vec<String>,
    /// At most 400 characters
    #[serde(default)]
    pub rationale: String,
    /// low, medium or high
    #[serde(default)]
    pub confidence: Option<String>,
}

/// Heuristic detection guidance for techniques the catalog has no data
/// components for. Only scheduled when such techniques exist.
pub struct DetectionReasoningStage;

impl DetectionReasoningStage {
    fn prompt(raw_alert: &str, uncovered: &[&VerifiedTechnique]) -> String {
        let techniques = uncovered
            .iter()
            .map(|technique| {
                format!(
                    "- {}: {}",
                    technique.label(),
                    clip(technique.description.as_deref().unwrap_or(""), 600)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let schema = schemars::schema_for!(ReasoningResponse);
        let schema = serde_json::to_string_pretty(&schema).unwrap_or_default();

        format!(
            "The ATT&CK catalog has no detection data components for these techniques:\n{}\n\n\
             Incident context:\n\"\"\"\n{}\n\"\"\"\n\n\
             For each technique give 1 to {} detection hypotheses with 2 to 8 telemetry sources each.\n\
             Respond with a single JSON object matching this schema:\n{}",
            techniques,
            raw_alert.trim(),
            MAX_HYPOTHESES,
            schema
        )
    }

    /// Render the model answer as markdown. Shapes that do not parse are
    /// kept verbatim; the guidance is still useful to an analyst.
    pub fn render(response: &str) -> String {
        let parsed = extract_json_object(response)
            .and_then(|json| serde_json::from_str::<ReasoningResponse>(&json).ok())
            .filter(|parsed| !parsed.techniques.is_empty());
        let Some(parsed) = parsed else {
            return response.trim().to_string();
        };

        let mut out = String::new();
        for technique in parsed.techniques {
            out.push_str(&format!("### {}\n\n", technique.technique_id.trim()));
            let hypotheses: Vec<Hypothesis> =
                technique.hypotheses.into_iter().take(MAX_HYPOTHESES).collect();
            if hypotheses.is_empty() {
                out.push_str(&format!(
                    "- **Correlate endpoint execution chain with network activity** (confidence: medium)\n  - Telemetry: {}\n\n",
                    DEFAULT_TELEMETRY.join(", ")
                ));
                continue;
            }
            for hypothesis in hypotheses {
                let confidence = hypothesis
                    .confidence
                    .as_deref()
                    .and_then(|value| value.parse::<Confidence>().ok())
                    .unwrap_or_default();
                let mut telemetry: Vec<String> = hypothesis
                    .telemetry
                    .iter()
                    .map(|source| clip(source, 140))
                    .filter(|source| !source.is_empty())
                    .take(MAX_TELEMETRY)
                    .collect();
                for default in DEFAULT_TELEMETRY {
                    if telemetry.len() >= MIN_TELEMETRY {
                        break;
                    }
                    if !telemetry.iter().any(|source| source == default) {
                        telemetry.push(default.to_string());
                    }
                }

                out.push_str(&format!(
                    "- **{}** (confidence: {})\n  - Telemetry: {}\n",
                    clip(&hypothesis.title, 140),
                    confidence,
                    telemetry.join(", ")
                ));
                if !hypothesis.rationale.trim().is_empty() {
                    out.push_str(&format!("  - Rationale: {}\n", clip(&hypothesis.rationale, 400)));
                }
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

#[async_trait]
impl Stage for DetectionReasoningStage {
    fn id(&self) -> StageId {
        StageId::DetectionReasoning
    }

    async fn run(
        &self,
        context: &InvestigationContext,
        record: &InvestigationRecord,
    ) -> StageOutcome {
        let uncovered = record.techniques_without_detections();
        if uncovered.is_empty() {
            return StageOutcome::new(StageOutput::DetectionReasoning(None));
        }

        tracing::info!(
            "reasoning about detections for {} uncovered technique(s)",
            uncovered.len()
        );
        let request = GenerationRequest::new(Self::prompt(&record.raw_alert, &uncovered))
            .with_system_prompt(SYSTEM_PROMPT)
            .with_temperature(0.2);

        match context.generation.generate("detection reasoning", request).await {
            Ok(response) => {
                StageOutcome::new(StageOutput::DetectionReasoning(Some(Self::render(&response))))
            }
            Err(err) => StageOutcome::new(StageOutput::DetectionReasoning(None)).with_error(
                StageErrorKind::DetectionReasoningFailure,
                format!("generation failed: {}", err),
            ),
        }
    }
}
