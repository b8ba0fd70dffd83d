mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tempfile::TempDir;

use attack_lens::investigation::agents::report::SECTIONS;
use attack_lens::investigation::outlet;
use attack_lens::investigation::{InvestigationRecord, Orchestrator, StageErrorKind, StageId};
use attack_lens::knowledge::KbOperation;
use attack_lens::types::layer::NavigatorLayer;

use common::{CountingKnowledgeBase, PromptKind, ScriptedGenerator};

fn assert_all_sections(record: &InvestigationRecord) {
    for section in SECTIONS {
        assert!(
            record.report.contains(&format!("## {}", section)),
            "report is missing section {:?}:\n{}",
            section,
            record.report
        );
    }
}

fn error_kinds(record: &InvestigationRecord) -> Vec<StageErrorKind> {
    record.stage_errors.iter().map(|error| error.kind).collect()
}

#[tokio::test]
async fn test_winword_alert_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::winword());
    let knowledge_base = Arc::new(CountingKnowledgeBase::new());
    let context = common::context(
        common::test_config(temp_dir.path()),
        generator.clone(),
        knowledge_base.clone(),
    );

    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    assert!(record.stage_errors.is_empty(), "{:?}", record.stage_errors);
    assert_eq!(
        record.verified_ids(),
        vec!["T1059.001", "T1053.005", "T1071.001"]
    );
    assert_eq!(record.candidate_techniques.len(), 3);
    assert!(record.validated_techniques.iter().all(|t| t.verified));
    assert_eq!(record.validated_techniques[0].tactics, vec!["execution"]);

    let attribution = &record.intelligence["T1059.001"];
    assert!(attribution.groups.contains("APT29"));
    assert!(attribution.software.contains("Emotet"));
    assert!(record.intelligence["T1053.005"].is_empty());

    assert_eq!(record.detections["T1059.001"].len(), 1);
    assert!(record.detections["T1053.005"].is_empty());
    assert_eq!(record.mitigations["T1053.005"][0].id, "M1028");

    // Scheduled Task has no data components, so reasoning ran for it
    let reasoning = record.detection_reasoning.as_deref().unwrap();
    assert!(reasoning.contains("T1053.005"));
    assert_eq!(generator.calls(PromptKind::Reasoning), 1);

    let layer = record.visualization.as_ref().unwrap();
    assert_eq!(layer.domain, "enterprise-attack");
    assert_eq!(layer.technique("T1059.001").unwrap().score, 100);
    assert_eq!(layer.technique("T1053.005").unwrap().score, 35);
    assert_eq!(layer.technique("T1071.001").unwrap().score, 40);

    assert!(record.report.starts_with("# Incident Report: FIN-WS-042"));
    assert_all_sections(&record);
    assert!(!record.report.contains("Data Completeness"));

    for stage in StageId::ALL {
        assert!(record.is_completed(stage), "{} did not complete", stage);
    }
    assert_eq!(knowledge_base.calls(KbOperation::TechniqueById), 3);
    assert_eq!(knowledge_base.calls(KbOperation::GroupsUsingTechnique), 3);
}

#[tokio::test]
async fn test_hallucinated_candidate_is_dropped() {
    let temp_dir = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::new(
        r#"{"summary": "PowerShell", "techniques": [
            {"id": "T9999.999", "name": "Invented", "evidence": ["made up"]},
            {"id": "T1059.001", "name": "PowerShell", "evidence": ["powershell.exe"]}
        ]}"#,
    ));
    let context = common::context(
        common::test_config(temp_dir.path()),
        generator,
        Arc::new(CountingKnowledgeBase::new()),
    );

    let record = Orchestrator::default().investigate(&context, "powershell.exe -enc").await;

    assert_eq!(record.candidate_techniques.len(), 2);
    assert_eq!(record.verified_ids(), vec!["T1059.001"]);
    assert_eq!(error_kinds(&record), vec![StageErrorKind::UnverifiedCandidate]);
    assert!(record.stage_errors[0].message.contains("T9999.999"));
    assert!(!record.intelligence.contains_key("T9999.999"));
    assert!(record.is_completed(StageId::Visualization));
}

#[tokio::test]
async fn test_zero_verified_skips_enrichment() {
    let temp_dir = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::new(
        r#"{"summary": "nothing real", "techniques": [{"id": "T9999", "name": "Invented"}]}"#,
    ));
    let knowledge_base = Arc::new(CountingKnowledgeBase::new());
    let context = common::context(
        common::test_config(temp_dir.path()),
        generator.clone(),
        knowledge_base.clone(),
    );

    let record = Orchestrator::default().investigate(&context, "odd alert").await;

    assert!(record.validated_techniques.is_empty());
    assert!(record.has_error(StageErrorKind::NoVerifiedTechniques));
    assert!(!record.has_error(StageErrorKind::ReportFallback));
    for stage in [
        StageId::Intelligence,
        StageId::Detection,
        StageId::Mitigation,
        StageId::DetectionReasoning,
        StageId::Visualization,
    ] {
        assert!(!record.is_completed(stage), "{} should not run", stage);
    }
    assert_eq!(knowledge_base.calls(KbOperation::GroupsUsingTechnique), 0);
    assert_eq!(knowledge_base.calls(KbOperation::DatacomponentsForTechnique), 0);

    // early termination renders the stub without asking the model
    assert_eq!(generator.calls(PromptKind::Report), 0);
    assert!(record.is_completed(StageId::Report));
    assert!(record.report.contains("ended early"));
    assert!(
        record
            .report
            .contains("## Mapped Techniques\n\nnone identified")
    );
    assert!(record.visualization.is_none());
    assert_all_sections(&record);
}

#[tokio::test]
async fn test_reasoning_skipped_when_every_technique_has_detections() {
    let temp_dir = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::new(
        r#"{"summary": "encoded PowerShell", "techniques": [
            {"id": "T1059.001", "name": "PowerShell", "evidence": ["-enc"]},
            {"id": "T1071.001", "name": "Web Protocols", "evidence": ["https beacon"]}
        ]}"#,
    ));
    let context = common::context(
        common::test_config(temp_dir.path()),
        generator.clone(),
        Arc::new(CountingKnowledgeBase::new()),
    );

    let record = Orchestrator::default().investigate(&context, "powershell -enc").await;

    assert_eq!(record.validated_techniques.len(), 2);
    assert!(record.detection_reasoning.is_none());
    assert!(!record.is_completed(StageId::DetectionReasoning));
    assert_eq!(generator.calls(PromptKind::Reasoning), 0);
    assert!(record.is_completed(StageId::Report));
}

#[tokio::test]
async fn test_not_found_technique_does_not_affect_others() {
    let temp_dir = TempDir::new().unwrap();
    let knowledge_base = Arc::new(CountingKnowledgeBase::new().with_not_found("T1071.001"));
    let context = common::context(
        common::test_config(temp_dir.path()),
        Arc::new(ScriptedGenerator::winword()),
        knowledge_base,
    );

    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    assert_eq!(
        record.verified_ids(),
        vec!["T1059.001", "T1053.005"]
    );
    assert_eq!(error_kinds(&record), vec![StageErrorKind::UnverifiedCandidate]);
    assert_eq!(record.detections.len(), 2);
    assert!(record.intelligence["T1059.001"].groups.contains("APT29"));
}

#[tokio::test]
async fn test_enrichment_failure_is_isolated() {
    let temp_dir = TempDir::new().unwrap();
    let knowledge_base = Arc::new(
        CountingKnowledgeBase::new().with_failing(KbOperation::GroupsUsingTechnique),
    );
    let context = common::context(
        common::test_config(temp_dir.path()),
        Arc::new(ScriptedGenerator::winword()),
        knowledge_base.clone(),
    );

    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    assert!(record.intelligence.is_empty());
    let failure = record
        .stage_errors
        .iter()
        .find(|error| error.kind == StageErrorKind::PartialEnrichmentFailure)
        .unwrap();
    assert_eq!(failure.stage, StageId::Intelligence);

    // siblings still contributed
    assert_eq!(record.detections.len(), 3);
    assert_eq!(record.mitigations.len(), 3);
    assert_eq!(
        record.visualization.as_ref().unwrap().technique("T1059.001").unwrap().score,
        75
    );
    assert!(record.report.contains("## Data Completeness"));
    assert!(record.report.contains("partial_enrichment_failure"));
    // retried up to the attempt ceiling for each technique
    assert_eq!(knowledge_base.calls(KbOperation::GroupsUsingTechnique), 6);
}

#[tokio::test]
async fn test_report_falls_back_to_template() {
    let temp_dir = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::winword().without_report());
    let context = common::context(
        common::test_config(temp_dir.path()),
        generator.clone(),
        Arc::new(CountingKnowledgeBase::new()),
    );

    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    assert_eq!(error_kinds(&record), vec![StageErrorKind::ReportFallback]);
    assert_eq!(generator.calls(PromptKind::Report), 2);
    assert!(record.report.starts_with("# Incident Report"));
    assert_all_sections(&record);
    assert!(record.report.contains("T1059.001"));
    assert!(record.report.contains("APT29"));
    assert!(record.report.contains("report_fallback"));
    assert!(record.report.contains("update-check.xyz"));
}

#[tokio::test]
async fn test_failing_generator_still_produces_report() {
    let temp_dir = TempDir::new().unwrap();
    let generator = Arc::new(ScriptedGenerator::failing());
    let knowledge_base = Arc::new(CountingKnowledgeBase::new());
    let context = common::context(
        common::test_config(temp_dir.path()),
        generator.clone(),
        knowledge_base.clone(),
    );

    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    assert_eq!(error_kinds(&record), vec![StageErrorKind::TriageFailure]);
    assert_eq!(generator.calls(PromptKind::Triage), 2);
    assert_eq!(knowledge_base.calls(KbOperation::TechniqueById), 0);
    assert!(!record.is_completed(StageId::Mapping));
    assert!(record.is_completed(StageId::Report));
    assert_all_sections(&record);
}

#[tokio::test]
async fn test_unavailable_knowledge_base() {
    let temp_dir = TempDir::new().unwrap();
    let knowledge_base = Arc::new(CountingKnowledgeBase::new().unavailable());
    let context = common::context(
        common::test_config(temp_dir.path()),
        Arc::new(ScriptedGenerator::winword()),
        knowledge_base.clone(),
    );

    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    let unverified = record
        .stage_errors
        .iter()
        .filter(|error| error.kind == StageErrorKind::UnverifiedCandidate)
        .count();
    assert_eq!(unverified, 3);
    assert!(record.has_error(StageErrorKind::NoVerifiedTechniques));
    assert!(record.validated_techniques.is_empty());
    assert_eq!(knowledge_base.calls(KbOperation::TechniqueById), 6);
    assert!(record.report.contains("ended early"));
    assert_all_sections(&record);
}

#[tokio::test]
async fn test_deadline_expiry_returns_partial_record() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = common::test_config(temp_dir.path());
    config.pipeline.deadline_seconds = 1;
    config.pipeline.report_grace_seconds = 0;
    let generator =
        Arc::new(ScriptedGenerator::winword().with_triage_delay(Duration::from_secs(10)));
    let context = common::context(config, generator, Arc::new(CountingKnowledgeBase::new()));

    let started = Instant::now();
    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    let timeout = record
        .stage_errors
        .iter()
        .find(|error| error.kind == StageErrorKind::PipelineTimeout)
        .unwrap();
    assert_eq!(timeout.stage, StageId::Triage);
    assert!(record.has_error(StageErrorKind::ReportFallback));
    assert!(!record.is_completed(StageId::Triage));
    assert!(record.is_completed(StageId::Report));
    assert_all_sections(&record);
}

#[tokio::test]
async fn test_concurrent_investigations_are_independent() {
    let temp_dir = TempDir::new().unwrap();
    let knowledge_base = Arc::new(CountingKnowledgeBase::new());
    let context = common::context(
        common::test_config(temp_dir.path()),
        Arc::new(ScriptedGenerator::winword()),
        knowledge_base.clone(),
    );
    let orchestrator = Orchestrator::default();

    let alerts: Vec<String> = (0..5)
        .map(|i| format!("{} (host #{})", common::WINWORD_ALERT, i))
        .collect();
    let records = join_all(
        alerts
            .iter()
            .map(|alert| orchestrator.investigate(&context, alert)),
    )
    .await;

    for (record, alert) in records.iter().zip(&alerts) {
        assert_eq!(&record.raw_alert, alert);
        assert_eq!(record.validated_techniques.len(), 3);
        assert!(record.stage_errors.is_empty());
    }
    let mut ids: Vec<_> = records.iter().map(|r| r.investigation_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    assert_eq!(knowledge_base.calls(KbOperation::TechniqueById), 15);
}

#[tokio::test]
async fn test_artifacts_are_written() {
    let temp_dir = TempDir::new().unwrap();
    let config = common::test_config(&temp_dir.path().join("out"));
    let context = common::context(
        config.clone(),
        Arc::new(ScriptedGenerator::winword()),
        Arc::new(CountingKnowledgeBase::new()),
    );

    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;
    let saved = outlet::save(&config, &record).await.unwrap();

    assert_eq!(saved.report, config.report_path());
    assert_eq!(std::fs::read_to_string(&saved.report).unwrap(), record.report);

    let layer_path = saved.layer.unwrap();
    let expected_path = layer_path.to_string_lossy().to_string();
    assert_eq!(
        record.navigator_layer_path.as_deref(),
        Some(expected_path.as_str())
    );
    let layer: NavigatorLayer =
        serde_json::from_str(&std::fs::read_to_string(&layer_path).unwrap()).unwrap();
    assert_eq!(layer.techniques.len(), 3);

    let restored: InvestigationRecord =
        serde_json::from_str(&std::fs::read_to_string(&saved.record).unwrap()).unwrap();
    assert_eq!(restored.investigation_id, record.investigation_id);
    assert_eq!(restored.validated_techniques, record.validated_techniques);
}

#[tokio::test]
async fn test_deadline_during_enrichment_keeps_finished_siblings() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = common::test_config(temp_dir.path());
    config.pipeline.deadline_seconds = 1;
    config.pipeline.report_grace_seconds = 5;
    let generator = Arc::new(ScriptedGenerator::winword());
    let knowledge_base = Arc::new(
        CountingKnowledgeBase::new().with_hanging(KbOperation::DatacomponentsForTechnique),
    );
    let context = common::context(config, generator.clone(), knowledge_base);

    let started = Instant::now();
    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(record.intelligence.len(), 3);
    assert_eq!(record.mitigations.len(), 3);
    assert!(record.detections.is_empty());
    assert!(record.is_completed(StageId::Intelligence));
    assert!(record.is_completed(StageId::Mitigation));
    assert!(!record.is_completed(StageId::Detection));
    assert!(!record.is_completed(StageId::Visualization));

    let timeouts: Vec<_> = record
        .stage_errors
        .iter()
        .filter(|error| error.kind == StageErrorKind::PipelineTimeout)
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].stage, StageId::Detection);

    // the grace period leaves room for a generated report
    assert!(!record.has_error(StageErrorKind::ReportFallback));
    assert_eq!(generator.calls(PromptKind::Report), 1);
    assert!(record.report.starts_with("# Incident Report: FIN-WS-042"));
    assert!(record.report.contains("pipeline_timeout"));
    assert_all_sections(&record);
}

#[tokio::test]
async fn test_report_exceeding_grace_uses_template() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = common::test_config(temp_dir.path());
    config.pipeline.deadline_seconds = 1;
    config.pipeline.report_grace_seconds = 1;
    let generator =
        Arc::new(ScriptedGenerator::winword().with_report_delay(Duration::from_secs(10)));
    let knowledge_base = Arc::new(
        CountingKnowledgeBase::new().with_hanging(KbOperation::DatacomponentsForTechnique),
    );
    let context = common::context(config, generator.clone(), knowledge_base);

    let started = Instant::now();
    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(generator.calls(PromptKind::Report), 1);
    assert_eq!(
        error_kinds(&record),
        vec![StageErrorKind::PipelineTimeout, StageErrorKind::ReportFallback]
    );
    assert!(record.report.starts_with("# Incident Report\n"));
    assert!(record.report.contains("APT29"));
    assert!(record.is_completed(StageId::Report));
    assert_all_sections(&record);
}

#[tokio::test]
async fn test_unrepresentable_deadline_runs_to_completion() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = common::test_config(temp_dir.path());
    config.pipeline.deadline_seconds = u64::MAX;
    config.pipeline.report_grace_seconds = u64::MAX;
    let context = common::context(
        config,
        Arc::new(ScriptedGenerator::winword()),
        Arc::new(CountingKnowledgeBase::new()),
    );

    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    assert!(record.stage_errors.is_empty(), "{:?}", record.stage_errors);
    assert_eq!(record.validated_techniques.len(), 3);
    assert!(record.is_completed(StageId::Report));
    assert_all_sections(&record);
}

#[tokio::test]
async fn test_tactics_failure_keeps_verified_technique() {
    let temp_dir = TempDir::new().unwrap();
    let knowledge_base = Arc::new(
        CountingKnowledgeBase::new().with_failing(KbOperation::TacticsForTechnique),
    );
    let context = common::context(
        common::test_config(temp_dir.path()),
        Arc::new(ScriptedGenerator::winword()),
        knowledge_base,
    );

    let record = Orchestrator::default()
        .investigate(&context, common::WINWORD_ALERT)
        .await;

    assert_eq!(
        record.verified_ids(),
        vec!["T1059.001", "T1053.005", "T1071.001"]
    );
    assert!(record.validated_techniques.iter().all(|t| t.tactics.is_empty()));
    assert_eq!(record.validated_techniques[0].tactic(), "unknown");
    assert!(!record.has_error(StageErrorKind::UnverifiedCandidate));
}
