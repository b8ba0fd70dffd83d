//! Deterministic indicator extraction from raw alert text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::utils::text::dedupe_preserving_order;

const MAX_PER_KIND: usize = 30;

static IPV4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b")
        .expect("valid ipv4 regex")
});

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bhttps?://[^\s"'<>]+"#).expect("valid url regex"));

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+(?:com|net|org|io|ru|cn|info|biz|xyz|top|online|site|co|uk|de)\b")
        .expect("valid domain regex")
});

static EXECUTABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[\w.-]+\.(?:exe|dll|ps1|bat|cmd|vbs|js|hta|scr|msi)\b")
        .expect("valid executable regex")
});

static HASH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:[A-Fa-f0-9]{64}|[A-Fa-f0-9]{40}|[A-Fa-f0-9]{32})\b").expect("valid hash regex")
});

static REGISTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:HKLM|HKCU|HKEY_LOCAL_MACHINE|HKEY_CURRENT_USER)\\[^\s,;]+")
        .expect("valid registry regex")
});

/// Indicators grouped the way the report presents them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub suspected_artifacts: Vec<String>,
    pub suspicious_processes: Vec<String>,
    pub suspicious_network: Vec<String>,
}

impl IndicatorSet {
    pub fn is_empty(&self) -> bool {
        self.suspected_artifacts.is_empty()
            && self.suspicious_processes.is_empty()
            && self.suspicious_network.is_empty()
    }
}

pub fn extract_indicators(text: &str) -> IndicatorSet {
    let urls: Vec<&str> = URL.find_iter(text).map(|m| m.as_str()).collect();

    let mut network: Vec<&str> = IPV4.find_iter(text).map(|m| m.as_str()).collect();
    network.extend(urls.iter().copied());
    // Bare domains that are not already part of a URL, and are not file names.
    network.extend(
        DOMAIN
            .find_iter(text)
            .map(|m| m.as_str())
            .filter(|domain| !urls.iter().any(|url| url.contains(domain))),
    );

    let processes = EXECUTABLE.find_iter(text).map(|m| m.as_str());

    let mut artifacts: Vec<&str> = HASH.find_iter(text).map(|m| m.as_str()).collect();
    artifacts.extend(REGISTRY.find_iter(text).map(|m| m.as_str()));

    IndicatorSet {
        suspected_artifacts: dedupe_preserving_order(artifacts, MAX_PER_KIND),
        suspicious_processes: dedupe_preserving_order(processes, MAX_PER_KIND),
        suspicious_network: dedupe_preserving_order(network, MAX_PER_KIND),
    }
}
