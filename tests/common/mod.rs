#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use attack_lens::config::Config;
use attack_lens::investigation::InvestigationContext;
use attack_lens::knowledge::{
    CatalogKnowledgeBase, KbOperation, KbRequest, KbResponse, KnowledgeBase, KnowledgeBaseError,
};
use attack_lens::llm::{GenerationError, GenerationRequest, GenerationResponse, TextGenerator};

pub const WINWORD_ALERT: &str = "EDR alert on host FIN-WS-042: WINWORD.EXE spawned \
powershell.exe -nop -w hidden -enc SQBFAFgA... The child process ran \
schtasks /create /tn \"OfficeUpdater\" /tr C:\\Users\\Public\\upd.ps1 /sc minute and \
then connected to https://update-check.xyz/beacon from 10.0.4.17.";

pub const WINWORD_TRIAGE: &str = r#"{
  "summary": "Word macro launched encoded PowerShell that persisted with a scheduled task and beaconed over HTTPS.",
  "techniques": [
    {"id": "T1059.001", "name": "PowerShell", "confidence": "high",
     "evidence": ["powershell.exe -nop -w hidden -enc", "WINWORD.EXE spawned powershell.exe"]},
    {"id": "t1053.005", "name": "Scheduled Task", "confidence": "medium",
     "evidence": ["schtasks /create /tn \"OfficeUpdater\""]},
    {"id": "T1071.001", "name": "Web Protocols", "confidence": "medium",
     "evidence": ["https://update-check.xyz/beacon"]}
  ]
}"#;

pub const REASONING: &str = r#"{"techniques": [{"technique_id": "T1053.005", "hypotheses": [
  {"title": "Scheduled task registered by an Office child process",
   "telemetry": ["Windows Security 4698", "Sysmon EventID 1"],
   "rationale": "Office processes rarely register scheduled tasks.",
   "confidence": "high"}
]}]}"#;

pub const REPORT: &str = "# Incident Report: FIN-WS-042\n\n\
## Executive Summary\n\nA malicious Word document executed encoded PowerShell.\n\n\
## Likely Attack Flow\n\nExecution, then persistence, then command and control.\n\n\
## Mapped Techniques\n\nT1059.001, T1053.005, T1071.001\n";

/// Which prompt a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Triage,
    Reasoning,
    Report,
    Other,
}

impl PromptKind {
    fn of(request: &GenerationRequest) -> Self {
        let prompt = request.prompt.as_str();
        if prompt.starts_with("Incident text:") {
            PromptKind::Triage
        } else if prompt.contains("no detection data components") {
            PromptKind::Reasoning
        } else if prompt.starts_with("Investigation record:") {
            PromptKind::Report
        } else {
            PromptKind::Other
        }
    }
}

/// Text generator answering from fixed responses; `None` makes that prompt fail.
pub struct ScriptedGenerator {
    pub triage: Option<String>,
    pub reasoning: Option<String>,
    pub report: Option<String>,
    pub triage_delay: Duration,
    pub report_delay: Duration,
    calls: Mutex<HashMap<PromptKind, usize>>,
}

impl ScriptedGenerator {
    pub fn new(triage: &str) -> Self {
        Self {
            triage: Some(triage.to_string()),
            reasoning: Some(REASONING.to_string()),
            report: Some(REPORT.to_string()),
            triage_delay: Duration::ZERO,
            report_delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn winword() -> Self {
        Self::new(WINWORD_TRIAGE)
    }

    pub fn failing() -> Self {
        Self {
            triage: None,
            reasoning: None,
            report: None,
            triage_delay: Duration::ZERO,
            report_delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn without_report(mut self) -> Self {
        self.report = None;
        self
    }

    pub fn with_triage_delay(mut self, delay: Duration) -> Self {
        self.triage_delay = delay;
        self
    }

    pub fn with_report_delay(mut self, delay: Duration) -> Self {
        self.report_delay = delay;
        self
    }

    pub fn calls(&self, kind: PromptKind) -> usize {
        self.calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        let kind = PromptKind::of(request);
        *self.calls.lock().unwrap().entry(kind).or_default() += 1;

        let answer = match kind {
            PromptKind::Triage => {
                if !self.triage_delay.is_zero() {
                    tokio::time::sleep(self.triage_delay).await;
                }
                self.triage.clone()
            }
            PromptKind::Reasoning => self.reasoning.clone(),
            PromptKind::Report => {
                if !self.report_delay.is_zero() {
                    tokio::time::sleep(self.report_delay).await;
                }
                self.report.clone()
            }
            PromptKind::Other => None,
        };
        answer
            .map(|text| GenerationResponse { text })
            .ok_or_else(|| GenerationError::Provider("scripted failure".to_string()))
    }
}

/// Catalog wrapper that counts calls per operation and injects failures.
pub struct CountingKnowledgeBase {
    inner: CatalogKnowledgeBase,
    not_found: HashSet<String>,
    failing: HashSet<KbOperation>,
    hanging: HashSet<KbOperation>,
    unavailable: bool,
    calls: Mutex<HashMap<KbOperation, usize>>,
}

impl CountingKnowledgeBase {
    pub fn new() -> Self {
        Self {
            inner: catalog(),
            not_found: HashSet::new(),
            failing: HashSet::new(),
            hanging: HashSet::new(),
            unavailable: false,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_not_found(mut self, technique_id: &str) -> Self {
        self.not_found.insert(technique_id.to_string());
        self
    }

    pub fn with_failing(mut self, operation: KbOperation) -> Self {
        self.failing.insert(operation);
        self
    }

    /// `operation` never answers
    pub fn with_hanging(mut self, operation: KbOperation) -> Self {
        self.hanging.insert(operation);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn calls(&self, operation: KbOperation) -> usize {
        self.calls.lock().unwrap().get(&operation).copied().unwrap_or(0)
    }
}

#[async_trait]
impl KnowledgeBase for CountingKnowledgeBase {
    async fn query(&self, request: &KbRequest) -> Result<KbResponse, KnowledgeBaseError> {
        *self.calls.lock().unwrap().entry(request.operation).or_default() += 1;

        if self.hanging.contains(&request.operation) {
            std::future::pending::<()>().await;
        }
        if self.unavailable || self.failing.contains(&request.operation) {
            return Err(KnowledgeBaseError::ServiceUnavailable(
                "connection refused".to_string(),
            ));
        }
        if let Some(technique_id) = request.str_arg("technique_id")
            && self.not_found.contains(technique_id)
        {
            return Ok(KbResponse::Empty);
        }
        self.inner.query(request).await
    }
}

fn technique(stix_id: &str, attack_id: &str, name: &str, tactic: &str) -> serde_json::Value {
    json!({
        "type": "attack-pattern",
        "id": stix_id,
        "name": name,
        "description": format!("Adversaries may abuse {}.", name),
        "external_references": [{"source_name": "mitre-attack", "external_id": attack_id}],
        "kill_chain_phases": [{"kill_chain_name": "mitre-attack", "phase_name": tactic}]
    })
}

fn relationship(id: &str, kind: &str, source: &str, target: &str) -> serde_json::Value {
    json!({
        "type": "relationship",
        "id": id,
        "relationship_type": kind,
        "source_ref": source,
        "target_ref": target
    })
}

/// Small ATT&CK bundle: PowerShell is fully covered, Scheduled Task has no
/// data components, Web Protocols has data components only.
pub fn bundle_json() -> String {
    json!({
        "type": "bundle",
        "id": "bundle--test",
        "objects": [
            technique("attack-pattern--powershell", "T1059.001", "PowerShell", "execution"),
            technique("attack-pattern--schtask", "T1053.005", "Scheduled Task", "persistence"),
            technique("attack-pattern--web", "T1071.001", "Web Protocols", "command-and-control"),
            {
                "type": "intrusion-set",
                "id": "intrusion-set--apt29",
                "name": "APT29",
                "external_references": [{"source_name": "mitre-attack", "external_id": "G0016"}]
            },
            {
                "type": "malware",
                "id": "malware--emotet",
                "name": "Emotet",
                "external_references": [{"source_name": "mitre-attack", "external_id": "S0367"}]
            },
            {
                "type": "course-of-action",
                "id": "course-of-action--m1042",
                "name": "Disable or Remove Feature or Program",
                "description": "Remove or deny access to unnecessary software.",
                "external_references": [{"source_name": "mitre-attack", "external_id": "M1042"}]
            },
            {
                "type": "course-of-action",
                "id": "course-of-action--m1028",
                "name": "Operating System Configuration",
                "description": "Restrict task scheduling to administrators.",
                "external_references": [{"source_name": "mitre-attack", "external_id": "M1028"}]
            },
            {"type": "x-mitre-data-source", "id": "x-mitre-data-source--process", "name": "Process"},
            {"type": "x-mitre-data-source", "id": "x-mitre-data-source--network", "name": "Network Traffic"},
            {
                "type": "x-mitre-data-component",
                "id": "x-mitre-data-component--process-creation",
                "name": "Process Creation",
                "x_mitre_data_source_ref": "x-mitre-data-source--process"
            },
            {
                "type": "x-mitre-data-component",
                "id": "x-mitre-data-component--network-content",
                "name": "Network Traffic Content",
                "x_mitre_data_source_ref": "x-mitre-data-source--network"
            },
            relationship("relationship--1", "uses", "intrusion-set--apt29", "attack-pattern--powershell"),
            relationship("relationship--2", "uses", "malware--emotet", "attack-pattern--powershell"),
            relationship("relationship--3", "mitigates", "course-of-action--m1042", "attack-pattern--powershell"),
            relationship("relationship--4", "mitigates", "course-of-action--m1028", "attack-pattern--schtask"),
            relationship("relationship--5", "detects", "x-mitre-data-component--process-creation", "attack-pattern--powershell"),
            relationship("relationship--6", "detects", "x-mitre-data-component--network-content", "attack-pattern--web")
        ]
    })
    .to_string()
}

pub fn catalog() -> CatalogKnowledgeBase {
    CatalogKnowledgeBase::from_bundle_json(&bundle_json(), "enterprise").unwrap()
}

/// Config with fast retries, writing under `output_path`
pub fn test_config(output_path: &Path) -> Config {
    let mut config = Config::default();
    config.output_path = output_path.to_path_buf();
    config.retry.max_attempts = 2;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.retry.jitter = false;
    config.llm.timeout_seconds = 30;
    config
}

pub fn context(
    config: Config,
    generator: Arc<ScriptedGenerator>,
    knowledge_base: Arc<CountingKnowledgeBase>,
) -> InvestigationContext {
    InvestigationContext::new(config, generator, knowledge_base)
}
