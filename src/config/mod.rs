use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

/// LLM provider type
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub enum LLMProvider {
    #[serde(rename = "openai")]
    #[default]
    OpenAI,
    #[serde(rename = "moonshot")]
    Moonshot,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "mistral")]
    Mistral,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "ollama")]
    Ollama,
}

impl std::fmt::Display for LLMProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LLMProvider::OpenAI => write!(f, "openai"),
            LLMProvider::Moonshot => write!(f, "moonshot"),
            LLMProvider::DeepSeek => write!(f, "deepseek"),
            LLMProvider::Mistral => write!(f, "mistral"),
            LLMProvider::OpenRouter => write!(f, "openrouter"),
            LLMProvider::Anthropic => write!(f, "anthropic"),
            LLMProvider::Gemini => write!(f, "gemini"),
            LLMProvider::Ollama => write!(f, "ollama"),
        }
    }
}

impl std::str::FromStr for LLMProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(LLMProvider::OpenAI),
            "moonshot" => Ok(LLMProvider::Moonshot),
            "deepseek" => Ok(LLMProvider::DeepSeek),
            "mistral" => Ok(LLMProvider::Mistral),
            "openrouter" => Ok(LLMProvider::OpenRouter),
            "anthropic" => Ok(LLMProvider::Anthropic),
            "gemini" => Ok(LLMProvider::Gemini),
            "ollama" => Ok(LLMProvider::Ollama),
            _ => Err(format!("Unknown provider: {}", s)),
        }
    }
}

/// Application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Directory the report, navigator layer and record are written to
    pub output_path: PathBuf,

    /// LLM settings
    pub llm: LLMConfig,

    /// Retry policy shared by every external call
    pub retry: RetryConfig,

    /// ATT&CK knowledge base settings
    pub knowledge_base: KnowledgeBaseConfig,

    /// Orchestration limits
    pub pipeline: PipelineConfig,

    /// Enable verbose logging
    pub verbose: bool,
}

/// LLM settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LLMConfig {
    pub provider: LLMProvider,

    pub api_key: String,

    pub api_base_url: String,

    pub model: String,

    /// Upper bound for generated tokens, stages may request less
    pub max_tokens: u32,

    pub temperature: f64,

    /// Per-call timeout (seconds)
    pub timeout_seconds: u64,
}

/// Retry policy settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempt ceiling, including the first attempt
    pub max_attempts: u32,

    pub initial_backoff_ms: u64,

    pub backoff_multiplier: f64,

    pub max_backoff_ms: u64,

    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

/// Knowledge base settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    /// ATT&CK STIX bundle, e.g. enterprise-attack.json
    pub bundle_path: PathBuf,

    /// ATT&CK domain (enterprise, mobile, ics)
    pub domain: String,

    /// Max concurrent lookups within one stage
    pub max_parallels: usize,
}

/// Orchestration limits
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Overall investigation deadline (seconds)
    pub deadline_seconds: u64,

    /// Extra time granted to the report stage after the deadline expired, 0 disables generation
    pub report_grace_seconds: u64,

    /// Groups and software kept per technique
    pub max_attribution_items: usize,

    /// Candidates kept from triage
    pub max_candidates: usize,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let mut file =
            File::open(path).context(format!("Failed to open config file: {:?}", path))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_path.join("incident_report.md")
    }

    pub fn layer_path(&self) -> PathBuf {
        self.output_path.join("incident_layer.json")
    }

    pub fn record_path(&self) -> PathBuf {
        self.output_path.join("investigation.json")
    }
}

impl LLMConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl PipelineConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_seconds)
    }

    pub fn report_grace(&self) -> Duration {
        Duration::from_secs(self.report_grace_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("./attack-lens.out"),
            llm: LLMConfig::default(),
            retry: RetryConfig::default(),
            knowledge_base: KnowledgeBaseConfig::default(),
            pipeline: PipelineConfig::default(),
            verbose: false,
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: LLMProvider::default(),
            api_key: std::env::var("ATTACK_LENS_LLM_API_KEY").unwrap_or_default(),
            api_base_url: String::from("https://api.openai.com/v1"),
            model: String::from("gpt-4.1-mini"),
            max_tokens: 4096,
            temperature: 0.2,
            timeout_seconds: 90,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 16_000,
            jitter: true,
        }
    }
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            bundle_path: PathBuf::from("./enterprise-attack.json"),
            domain: String::from("enterprise"),
            max_parallels: 10,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deadline_seconds: 300,
            report_grace_seconds: 45,
            max_attribution_items: 8,
            max_candidates: 10,
        }
    }
}
