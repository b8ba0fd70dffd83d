use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

static TECHNIQUE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^T\d{4}(?:\.\d{3})?$").expect("valid technique id regex"));

/// Normalize an ATT&CK technique identifier (`t1059.001` -> `T1059.001`).
/// Returns `None` for anything that does not look like `T####` or `T####.###`.
pub fn normalize_technique_id(raw: &str) -> Option<String> {
    let candidate = raw.trim().to_uppercase();
    TECHNIQUE_ID.is_match(&candidate).then_some(candidate)
}

/// How sure triage is about a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Confidence::Low),
            "medium" => Ok(Confidence::Medium),
            "high" => Ok(Confidence::High),
            _ => Err(format!("Unknown confidence: {}", s)),
        }
    }
}

/// A technique suggested by triage, not yet checked against the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTechnique {
    pub identifier: String,
    pub name: String,
    pub confidence: Confidence,
    /// Short phrases from the alert supporting the suggestion
    pub evidence: Vec<String>,
}

/// A candidate confirmed by the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedTechnique {
    pub identifier: String,
    /// Canonical name from the knowledge base
    pub name: String,
    pub tactics: Vec<String>,
    pub stix_id: Option<String>,
    pub description: Option<String>,
    pub verified: bool,
}

impl VerifiedTechnique {
    /// First tactic, or `unknown` when the knowledge base had none.
    pub fn tactic(&self) -> &str {
        self.tactics.first().map(String::as_str).unwrap_or("unknown")
    }

    /// `T1059.001 PowerShell (execution)`
    pub fn label(&self) -> String {
        let tactics = if self.tactics.is_empty() {
            "unknown".to_string()
        } else {
            self.tactics.join(", ")
        };
        format!("{} {} ({})", self.identifier, self.name, tactics)
    }
}

/// Groups and software known to use a technique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub groups: BTreeSet<String>,
    pub software: BTreeSet<String>,
}

impl Attribution {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.software.is_empty()
    }
}

/// Telemetry signal able to detect a technique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataComponent {
    pub name: String,
    pub data_source: Option<String>,
}

impl std::fmt::Display for DataComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data_source {
            Some(source) => write!(f, "{}: {}", source, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Defensive control mitigating a technique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mitigation {
    pub id: String,
    pub name: String,
    pub description: String,
}
