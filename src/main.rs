use crate::investigation::workflow::launch;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod investigation;
mod knowledge;
mod llm;
mod types;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    let default_level = if args.verbose { "attack_lens=debug" } else { "attack_lens=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let alert = args.read_alert()?;
    let config = args.into_config()?;

    let record = launch(&config, &alert).await?;
    println!("📄 Report: {}", config.report_path().display());
    if !record.stage_errors.is_empty() {
        println!(
            "⚠️ {} stage error(s) recorded, see the Data Completeness section",
            record.stage_errors.len()
        );
    }
    Ok(())
}
