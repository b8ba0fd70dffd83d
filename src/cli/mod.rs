use crate::config::{Config, LLMProvider};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::{IsTerminal, Read};
use std::path::PathBuf;

/// attack-lens - maps security alerts to MITRE ATT&CK and writes an incident report
#[derive(Parser, Debug)]
#[command(name = "attack-lens")]
#[command(
    about = "Turns an unstructured security alert into a validated MITRE ATT&CK mapping, enrichment, navigator layer and incident report."
)]
#[command(version)]
pub struct Args {
    /// Alert text; read from --alert-file or stdin when omitted
    pub alert: Option<String>,

    /// File containing the alert text
    #[arg(short = 'f', long)]
    pub alert_file: Option<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    pub output_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// ATT&CK STIX bundle (e.g. enterprise-attack.json)
    #[arg(long)]
    pub attack_bundle: Option<PathBuf>,

    /// ATT&CK domain (enterprise, mobile, ics)
    #[arg(long)]
    pub domain: Option<String>,

    /// LLM Provider (openai, moonshot, deepseek, mistral, openrouter, anthropic, gemini, ollama)
    #[arg(long)]
    pub llm_provider: Option<String>,

    /// LLM API base URL
    #[arg(long)]
    pub llm_api_base_url: Option<String>,

    /// LLM API KEY
    #[arg(long)]
    pub llm_api_key: Option<String>,

    /// Model name
    #[arg(short, long)]
    pub model: Option<String>,

    /// Max tokens per generation
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f64>,

    /// Overall investigation deadline in seconds
    #[arg(long)]
    pub deadline_seconds: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Alert text from the positional argument, the alert file or stdin, in that order
    pub fn read_alert(&self) -> Result<String> {
        let alert = if let Some(alert) = &self.alert {
            alert.clone()
        } else if let Some(path) = &self.alert_file {
            std::fs::read_to_string(path)
                .context(format!("Failed to read alert file: {:?}", path))?
        } else {
            let mut stdin = std::io::stdin();
            if stdin.is_terminal() {
                bail!("No alert given: pass it as an argument, with --alert-file, or on stdin");
            }
            let mut buffer = String::new();
            stdin
                .read_to_string(&mut buffer)
                .context("Failed to read alert from stdin")?;
            buffer
        };

        let alert = alert.trim().to_string();
        if alert.is_empty() {
            bail!("Alert text is empty");
        }
        Ok(alert)
    }

    /// Load the configuration and apply CLI overrides
    pub fn into_config(self) -> Result<Config> {
        let mut config = if let Some(config_path) = &self.config {
            Config::from_file(config_path)?
        } else {
            let default_config_path = std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("attack-lens.toml");

            if default_config_path.exists() {
                Config::from_file(&default_config_path)?
            } else {
                Config::default()
            }
        };

        if let Some(output_path) = self.output_path {
            config.output_path = output_path;
        }
        if let Some(attack_bundle) = self.attack_bundle {
            config.knowledge_base.bundle_path = attack_bundle;
        }
        if let Some(domain) = self.domain {
            config.knowledge_base.domain = domain;
        }

        if let Some(provider_str) = self.llm_provider {
            if let Ok(provider) = provider_str.parse::<LLMProvider>() {
                config.llm.provider = provider;
            } else {
                eprintln!(
                    "⚠️ Unknown provider: {}, keeping {}",
                    provider_str, config.llm.provider
                );
            }
        }
        if let Some(llm_api_base_url) = self.llm_api_base_url {
            config.llm.api_base_url = llm_api_base_url;
        }
        if let Some(llm_api_key) = self.llm_api_key {
            config.llm.api_key = llm_api_key;
        }
        if let Some(model) = self.model {
            config.llm.model = model;
        }
        if let Some(max_tokens) = self.max_tokens {
            config.llm.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            config.llm.temperature = temperature;
        }
        if let Some(deadline_seconds) = self.deadline_seconds {
            config.pipeline.deadline_seconds = deadline_seconds;
        }
        config.verbose = config.verbose || self.verbose;

        Ok(config)
    }
}
