use async_trait::async_trait;
use serde_json::json;

use crate::investigation::context::InvestigationContext;
use crate::investigation::record::{
    InvestigationRecord, StageError, StageErrorKind, StageId, StageOutcome, StageOutput,
};
use crate::investigation::stage::Stage;
use crate::llm::GenerationRequest;
use crate::types::technique::VerifiedTechnique;
use crate::utils::ioc::extract_indicators;

pub const EXECUTIVE_SUMMARY: &str = "Executive Summary";
pub const LIKELY_ATTACK_FLOW: &str = "Likely Attack Flow";
pub const MAPPED_TECHNIQUES: &str = "Mapped Techniques";
pub const NOTABLE_GROUPS_SOFTWARE: &str = "Notable Groups/Software";
pub const DETECTION_RECOMMENDATIONS: &str = "Detection Recommendations";
pub const IMMEDIATE_ACTIONS: &str = "Immediate Actions";
pub const INDICATORS_OF_COMPROMISE: &str = "Indicators of Compromise";
pub const NAVIGATOR_LAYER: &str = "Navigator Layer";
pub const DATA_COMPLETENESS: &str = "Data Completeness";

/// Sections every report carries, in order
pub const SECTIONS: [&str; 8] = [
    EXECUTIVE_SUMMARY,
    LIKELY_ATTACK_FLOW,
    MAPPED_TECHNIQUES,
    NOTABLE_GROUPS_SOFTWARE,
    DETECTION_RECOMMENDATIONS,
    IMMEDIATE_ACTIONS,
    INDICATORS_OF_COMPROMISE,
    NAVIGATOR_LAYER,
];

pub const NONE_IDENTIFIED: &str = "none identified";

const TACTIC_ORDER: [&str; 14] = [
    "reconnaissance",
    "resource-development",
    "initial-access",
    "execution",
    "persistence",
    "privilege-escalation",
    "defense-evasion",
    "credential-access",
    "discovery",
    "lateral-movement",
    "collection",
    "command-and-control",
    "exfiltration",
    "impact",
];

const SYSTEM_PROMPT: &str = "You are a senior incident responder writing for a security \
leadership audience. Use only the facts in the investigation record; never invent technique \
identifiers, groups, software or indicators. Write concise markdown.";

/// Writes the final report. Never fails: when generation is unavailable the
/// report is rendered from the record with a fixed template.
pub struct ReportStage;

impl ReportStage {
    fn prompt(record: &InvestigationRecord) -> String {
        let context = json!({
            "raw_alert": record.raw_alert,
            "triage_summary": record.triage_summary,
            "candidate_techniques": record.candidate_techniques,
            "validated_techniques": record.validated_techniques,
            "intelligence": record.intelligence,
            "detections": record.detections,
            "detection_reasoning": record.detection_reasoning,
            "mitigations": record.mitigations,
            "navigator_layer_path": record.visualization.as_ref().and(record.navigator_layer_path.as_ref()),
            "stage_errors": record.stage_errors,
        });
        let context = serde_json::to_string_pretty(&context).unwrap_or_default();
        let headings = SECTIONS
            .iter()
            .map(|section| format!("## {}", section))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "Investigation record:\n```json\n{}\n```\n\n\
             Write the incident report in markdown. Start with a '# ' title, then use exactly \
             these second-level headings in this order:\n{}\n\n\
             Write \"{}\" under any heading the record has no data for. List indicators of \
             compromise as suspected artifacts, suspicious processes and suspicious network activity.",
            context, headings, NONE_IDENTIFIED
        )
    }

    /// Append every required section the text lacks.
    pub fn ensure_sections(text: &str) -> String {
        let mut out = text.trim_end().to_string();
        for section in SECTIONS {
            if !has_heading(&out, section) {
                out.push_str(&format!("\n\n## {}\n\n{}", section, NONE_IDENTIFIED));
            }
        }
        out.push('\n');
        out
    }

    /// "Data Completeness" annotation listing sections resting on incomplete data.
    pub fn data_completeness(errors: &[StageError]) -> Option<String> {
        if errors.is_empty() {
            return None;
        }

        let mut out = format!(
            "## {}\n\nSome sections rest on incomplete data:\n\n",
            DATA_COMPLETENESS
        );
        for error in errors {
            out.push_str(&format!(
                "- `{}` in {}: {} (affects: {})\n",
                error.kind,
                error.stage,
                error.message,
                affected_sections(error).join(", ")
            ));
        }
        Some(out)
    }

    fn finalize(body: &str, errors: &[StageError]) -> String {
        let mut report = Self::ensure_sections(body);
        if let Some(annotation) = Self::data_completeness(errors) {
            report.push('\n');
            report.push_str(&annotation);
        }
        report
    }

    /// Deterministic report built purely from the record.
    pub fn render_template(record: &InvestigationRecord, errors: &[StageError]) -> String {
        let mut body = String::from("# Incident Report\n\n");
        body.push_str(&format!(
            "_Investigation {} started {}. Rendered from the investigation record._\n\n",
            record.investigation_id,
            record.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));

        let sections = [
            (EXECUTIVE_SUMMARY, executive_summary(record)),
            (LIKELY_ATTACK_FLOW, attack_flow(record)),
            (MAPPED_TECHNIQUES, mapped_techniques(record)),
            (NOTABLE_GROUPS_SOFTWARE, groups_and_software(record)),
            (DETECTION_RECOMMENDATIONS, detection_recommendations(record)),
            (IMMEDIATE_ACTIONS, immediate_actions(record)),
            (INDICATORS_OF_COMPROMISE, indicators(record)),
            (NAVIGATOR_LAYER, navigator_layer(record)),
        ];
        for (section, content) in sections {
            let content = content.unwrap_or_else(|| NONE_IDENTIFIED.to_string());
            body.push_str(&format!("## {}\n\n{}\n\n", section, content.trim_end()));
        }

        Self::finalize(&body, errors)
    }

    /// Template report plus the `report_fallback` entry explaining why.
    pub fn fallback(record: &InvestigationRecord, reason: impl Into<String>) -> StageOutcome {
        let error = StageError::new(StageId::Report, StageErrorKind::ReportFallback, reason);
        let mut errors = record.stage_errors.clone();
        errors.push(error.clone());
        let report = Self::render_template(record, &errors);
        StageOutcome::new(StageOutput::Report(report)).with_errors([error])
    }
}

#[async_trait]
impl Stage for ReportStage {
    fn id(&self) -> StageId {
        StageId::Report
    }

    async fn run(
        &self,
        context: &InvestigationContext,
        record: &InvestigationRecord,
    ) -> StageOutcome {
        if record.has_fatal_error() {
            // early termination: explanatory stub, nothing to narrate
            let report = Self::render_template(record, &record.stage_errors);
            return StageOutcome::new(StageOutput::Report(report));
        }

        let request = GenerationRequest::new(Self::prompt(record))
            .with_system_prompt(SYSTEM_PROMPT)
            .with_max_tokens(context.config.llm.max_tokens)
            .with_temperature(context.config.llm.temperature);

        match context.generation.generate("report", request).await {
            Ok(text) => StageOutcome::new(StageOutput::Report(Self::finalize(
                &text,
                &record.stage_errors,
            ))),
            Err(err) => {
                tracing::warn!("report generation failed, using template: {}", err);
                Self::fallback(record, format!("generation failed: {}", err))
            }
        }
    }
}

fn normalize_heading(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn has_heading(text: &str, section: &str) -> bool {
    let wanted = normalize_heading(section);
    text.lines().any(|line| {
        let line = line.trim();
        line.starts_with('#') && normalize_heading(line.trim_start_matches('#')) == wanted
    })
}

fn affected_sections(error: &StageError) -> Vec<&'static str> {
    match error.kind {
        StageErrorKind::TriageFailure
        | StageErrorKind::NoCandidateTechniques
        | StageErrorKind::NoVerifiedTechniques => vec![
            LIKELY_ATTACK_FLOW,
            MAPPED_TECHNIQUES,
            NOTABLE_GROUPS_SOFTWARE,
            DETECTION_RECOMMENDATIONS,
            IMMEDIATE_ACTIONS,
            NAVIGATOR_LAYER,
        ],
        StageErrorKind::UnverifiedCandidate => vec![MAPPED_TECHNIQUES],
        StageErrorKind::PartialEnrichmentFailure => match error.stage {
            StageId::Intelligence => vec![NOTABLE_GROUPS_SOFTWARE],
            StageId::Detection => vec![DETECTION_RECOMMENDATIONS],
            StageId::Mitigation => vec![IMMEDIATE_ACTIONS],
            _ => vec![NAVIGATOR_LAYER],
        },
        StageErrorKind::DetectionReasoningFailure => vec![DETECTION_RECOMMENDATIONS],
        StageErrorKind::ReportFallback => vec![EXECUTIVE_SUMMARY, LIKELY_ATTACK_FLOW],
        StageErrorKind::PipelineTimeout => SECTIONS.to_vec(),
    }
}

fn executive_summary(record: &InvestigationRecord) -> Option<String> {
    let mut out = String::new();
    if record.has_fatal_error() {
        let reasons = record
            .stage_errors
            .iter()
            .filter(|error| error.kind.is_fatal())
            .map(|error| error.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        out.push_str(&format!(
            "The investigation ended early: {}. No technique could be verified against the ATT&CK \
             knowledge base, so no enrichment was performed.\n\n",
            reasons
        ));
    }

    match &record.triage_summary {
        Some(summary) => out.push_str(&format!("{}\n\n", summary)),
        None if !record.has_fatal_error() => {
            out.push_str("Automated triage produced no summary.\n\n")
        }
        None => {}
    }

    if !record.candidate_techniques.is_empty() {
        out.push_str(&format!(
            "{} of {} candidate technique(s) were verified against the ATT&CK knowledge base.",
            record.validated_techniques.len(),
            record.candidate_techniques.len()
        ));
    }
    Some(out).filter(|text| !text.trim().is_empty())
}

fn tactic_rank(technique: &VerifiedTechnique) -> usize {
    TACTIC_ORDER
        .iter()
        .position(|tactic| *tactic == technique.tactic())
        .unwrap_or(TACTIC_ORDER.len())
}

fn attack_flow(record: &InvestigationRecord) -> Option<String> {
    if record.validated_techniques.is_empty() {
        return None;
    }
    let mut ordered: Vec<&VerifiedTechnique> = record.validated_techniques.iter().collect();
    ordered.sort_by_key(|technique| tactic_rank(technique));

    let lines = ordered
        .iter()
        .enumerate()
        .map(|(index, technique)| {
            format!(
                "{}. **{}**: {} {}",
                index + 1,
                technique.tactic(),
                technique.identifier,
                technique.name
            )
        })
        .collect::<Vec<_>>();
    Some(lines.join("\n"))
}

fn mapped_techniques(record: &InvestigationRecord) -> Option<String> {
    if record.validated_techniques.is_empty() {
        return None;
    }
    let mut out = String::from(
        "| Technique | Name | Tactics | Confidence | Evidence |\n|---|---|---|---|---|\n",
    );
    for technique in &record.validated_techniques {
        let candidate = record.candidate(&technique.identifier);
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            technique.identifier,
            technique.name,
            technique.tactics.join(", "),
            candidate.map_or("unknown".to_string(), |c| c.confidence.to_string()),
            candidate.map_or(String::new(), |c| c.evidence.join("; ").replace('|', "/"))
        ));
    }
    Some(out)
}

fn groups_and_software(record: &InvestigationRecord) -> Option<String> {
    let lines = record
        .validated_techniques
        .iter()
        .filter_map(|technique| {
            let attribution = record.intelligence.get(&technique.identifier)?;
            if attribution.is_empty() {
                return None;
            }
            let join = |names: &std::collections::BTreeSet<String>| {
                if names.is_empty() {
                    NONE_IDENTIFIED.to_string()
                } else {
                    names.iter().cloned().collect::<Vec<_>>().join(", ")
                }
            };
            Some(format!(
                "- **{} {}**: groups: {}; software: {}",
                technique.identifier,
                technique.name,
                join(&attribution.groups),
                join(&attribution.software)
            ))
        })
        .collect::<Vec<_>>();
    Some(lines.join("\n")).filter(|text| !text.is_empty())
}

fn detection_recommendations(record: &InvestigationRecord) -> Option<String> {
    let mut out = record
        .validated_techniques
        .iter()
        .filter_map(|technique| {
            let components = record.detections.get(&technique.identifier)?;
            if components.is_empty() {
                return None;
            }
            let components = components
                .iter()
                .map(|component| component.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!(
                "- **{} {}**: monitor {}",
                technique.identifier, technique.name, components
            ))
        })
        .collect::<Vec<_>>()
        .join("\n");

    if let Some(reasoning) = &record.detection_reasoning {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str("Heuristic guidance for techniques without catalog detections:\n\n");
        out.push_str(reasoning);
    }
    Some(out).filter(|text| !text.is_empty())
}

fn immediate_actions(record: &InvestigationRecord) -> Option<String> {
    let lines = record
        .validated_techniques
        .iter()
        .filter_map(|technique| {
            let mitigations = record.mitigations.get(&technique.identifier)?;
            if mitigations.is_empty() {
                return None;
            }
            let mitigations = mitigations
                .iter()
                .map(|mitigation| format!("{} {}", mitigation.id, mitigation.name))
                .collect::<Vec<_>>()
                .join("; ");
            Some(format!("- **{}**: {}", technique.identifier, mitigations))
        })
        .collect::<Vec<_>>();
    Some(lines.join("\n")).filter(|text| !text.is_empty())
}

fn indicators(record: &InvestigationRecord) -> Option<String> {
    let iocs = extract_indicators(&record.raw_alert);
    if iocs.is_empty() {
        return None;
    }
    let list = |items: &[String]| {
        if items.is_empty() {
            NONE_IDENTIFIED.to_string()
        } else {
            items
                .iter()
                .map(|item| format!("`{}`", item))
                .collect::<Vec<_>>()
                .join(", ")
        }
    };
    Some(format!(
        "- Suspected artifacts: {}\n- Suspicious processes: {}\n- Suspicious network: {}",
        list(&iocs.suspected_artifacts),
        list(&iocs.suspicious_processes),
        list(&iocs.suspicious_network)
    ))
}

fn navigator_layer(record: &InvestigationRecord) -> Option<String> {
    let layer = record.visualization.as_ref()?;
    let mut out = match &record.navigator_layer_path {
        Some(path) => format!(
            "Layer with {} technique(s) saved to `{}`.\n\n",
            layer.techniques.len(),
            path
        ),
        None => format!("Layer with {} technique(s).\n\n", layer.techniques.len()),
    };
    for technique in &layer.techniques {
        out.push_str(&format!(
            "- {}: score {}\n",
            technique.technique_id, technique.score
        ));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::technique::{CandidateTechnique, Confidence, DataComponent};

    fn record() -> InvestigationRecord {
        let mut record = InvestigationRecord::new(
            "WINWORD.EXE spawned powershell.exe, beacon to 185.220.101.4",
            Some("out/incident_layer.json".to_string()),
        );
        record.candidate_techniques = vec![CandidateTechnique {
            identifier: "T1059.001".to_string(),
            name: "PowerShell".to_string(),
            confidence: Confidence::High,
            evidence: vec!["powershell.exe -EncodedCommand".to_string()],
        }];
        record.validated_techniques = vec![VerifiedTechnique {
            identifier: "T1059.001".to_string(),
            name: "PowerShell".to_string(),
            tactics: vec!["execution".to_string()],
            stix_id: None,
            description: None,
            verified: true,
        }];
        record.detections.insert(
            "T1059.001".to_string(),
            vec![DataComponent {
                name: "Script Execution".to_string(),
                data_source: Some("Script".to_string()),
            }],
        );
        record
    }

    #[test]
    fn test_ensure_sections_appends_missing() {
        let text = "# Report\n\n## Executive Summary\n\nBad day.\n\n## mapped techniques\n\nT1059.001";
        let report = ReportStage::ensure_sections(text);

        for section in SECTIONS {
            assert!(has_heading(&report, section), "missing {}", section);
        }
        assert_eq!(report.matches("## Executive Summary").count(), 1);
        assert!(report.contains("## Navigator Layer\n\nnone identified"));
    }

    #[test]
    fn test_heading_match_ignores_case_and_punctuation() {
        assert!(has_heading("### Notable Groups / Software", NOTABLE_GROUPS_SOFTWARE));
        assert!(has_heading("## INDICATORS OF COMPROMISE", INDICATORS_OF_COMPROMISE));
        assert!(!has_heading("Indicators of Compromise", INDICATORS_OF_COMPROMISE));
    }

    #[test]
    fn test_template_has_all_sections_and_facts() {
        let record = record();
        let report = ReportStage::render_template(&record, &[]);

        for section in SECTIONS {
            assert!(has_heading(&report, section), "missing {}", section);
        }
        assert!(report.contains("| T1059.001 | PowerShell | execution | high |"));
        assert!(report.contains("Script: Script Execution"));
        assert!(report.contains("`185.220.101.4`"));
        assert!(!report.contains(DATA_COMPLETENESS));
    }

    #[test]
    fn test_fallback_records_error_and_annotation() {
        let record = record();
        let outcome = ReportStage::fallback(&record, "generation failed: 503");

        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind, StageErrorKind::ReportFallback);
        match outcome.output {
            StageOutput::Report(report) => {
                assert!(report.contains("## Data Completeness"));
                assert!(report.contains("`report_fallback` in report"));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_early_termination_stub() {
        let mut record = InvestigationRecord::new("something odd happened", None);
        record.record_error(StageError::new(
            StageId::Triage,
            StageErrorKind::NoCandidateTechniques,
            "triage produced no usable technique identifiers",
        ));
        let report = ReportStage::render_template(&record, &record.stage_errors);

        assert!(report.contains("The investigation ended early"));
        assert!(report.contains("## Mapped Techniques\n\nnone identified"));
        assert!(report.contains("## Data Completeness"));
    }
}
