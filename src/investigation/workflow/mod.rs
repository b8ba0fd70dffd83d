use crate::config::Config;
use crate::investigation::context::InvestigationContext;
use crate::investigation::orchestrator::Orchestrator;
use crate::investigation::outlet;
use crate::investigation::record::InvestigationRecord;

use anyhow::Result;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Wall-clock timing of the workflow phases
pub struct TimingScope {
    start_time: Instant,
    phase_start_times: BTreeMap<String, Instant>,
    phase_durations: BTreeMap<String, Duration>,
}

impl Default for TimingScope {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingScope {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            phase_start_times: BTreeMap::new(),
            phase_durations: BTreeMap::new(),
        }
    }

    pub fn start_phase(&mut self, phase_name: &str) {
        self.phase_start_times
            .insert(phase_name.to_string(), Instant::now());
    }

    pub fn end_phase(&mut self, phase_name: &str) -> Option<Duration> {
        let start_time = self.phase_start_times.remove(phase_name)?;
        let duration = start_time.elapsed();
        self.phase_durations
            .insert(phase_name.to_string(), duration);
        Some(duration)
    }

    pub fn total_duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn phase_durations(&self) -> &BTreeMap<String, Duration> {
        &self.phase_durations
    }

    /// Phase timings plus the per-stage timings of the record
    pub fn timing_report(&self, record: &InvestigationRecord) -> String {
        let mut report = format!(
            "Total execution time: {:.2}s\n",
            self.total_duration().as_secs_f64()
        );

        if !self.phase_durations.is_empty() {
            report.push_str("\nPhases:\n");
            for (phase, duration) in &self.phase_durations {
                report.push_str(&format!("- {}: {:.3}s\n", phase, duration.as_secs_f64()));
            }
        }

        if !record.timings.is_empty() {
            report.push_str("\nStages:\n");
            for (stage, seconds) in &record.timings {
                report.push_str(&format!("- {}: {:.3}s\n", stage, seconds));
            }
        }

        report
    }
}

pub struct TimingKeys;

impl TimingKeys {
    pub const SETUP: &'static str = "setup";
    pub const INVESTIGATION: &'static str = "investigation";
    pub const OUTPUT: &'static str = "output";
}

/// Run one investigation end to end: wire the services, investigate, persist.
pub async fn launch(config: &Config, raw_alert: &str) -> Result<InvestigationRecord> {
    let mut timing = TimingScope::new();

    timing.start_phase(TimingKeys::SETUP);
    let context = InvestigationContext::from_config(config.clone())?;
    timing.end_phase(TimingKeys::SETUP);

    println!("🚀 Investigating alert ({} chars)...", raw_alert.len());
    timing.start_phase(TimingKeys::INVESTIGATION);
    let record = Orchestrator::default().investigate(&context, raw_alert).await;
    timing.end_phase(TimingKeys::INVESTIGATION);

    println!(
        "✓ Investigation {} complete: {}/{} technique(s) verified",
        record.investigation_id,
        record.validated_techniques.len(),
        record.candidate_techniques.len()
    );
    for error in &record.stage_errors {
        println!("⚠️ {} ({}): {}", error.kind, error.stage, error.message);
    }

    timing.start_phase(TimingKeys::OUTPUT);
    outlet::save(config, &record).await?;
    timing.end_phase(TimingKeys::OUTPUT);

    if config.verbose {
        println!("\n{}", timing.timing_report(&record));
    }

    Ok(record)
}
