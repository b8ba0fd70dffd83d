use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::investigation::record::InvestigationRecord;

/// Persist a finished investigation
pub async fn save(config: &Config, record: &InvestigationRecord) -> Result<SavedArtifacts> {
    let outlet = DiskOutlet::new(config);
    outlet.save(record).await
}

pub trait Outlet {
    async fn save(&self, record: &InvestigationRecord) -> Result<SavedArtifacts>;
}

/// Where each artifact ended up
#[derive(Debug, Clone, PartialEq)]
pub struct SavedArtifacts {
    pub report: PathBuf,
    /// `None` when no layer was produced
    pub layer: Option<PathBuf>,
    pub record: PathBuf,
}

pub struct DiskOutlet {
    output_path: PathBuf,
    report_path: PathBuf,
    layer_path: PathBuf,
    record_path: PathBuf,
}

impl DiskOutlet {
    pub fn new(config: &Config) -> Self {
        Self {
            output_path: config.output_path.clone(),
            report_path: config.report_path(),
            layer_path: config.layer_path(),
            record_path: config.record_path(),
        }
    }

    fn write(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {:?}", parent))?;
        }
        fs::write(path, content).context(format!("Failed to write {:?}", path))
    }
}

impl Outlet for DiskOutlet {
    async fn save(&self, record: &InvestigationRecord) -> Result<SavedArtifacts> {
        println!("\n🖊️ Saving investigation artifacts...");
        fs::create_dir_all(&self.output_path)
            .context(format!("Failed to create output directory: {:?}", self.output_path))?;

        Self::write(&self.report_path, &record.report)?;
        println!("💾 Report: {}", self.report_path.display());

        let layer = match &record.visualization {
            Some(layer) => {
                let json = serde_json::to_string_pretty(layer)
                    .context("Failed to serialize navigator layer")?;
                Self::write(&self.layer_path, &json)?;
                println!("💾 Navigator layer: {}", self.layer_path.display());
                Some(self.layer_path.clone())
            }
            None => {
                tracing::debug!("no navigator layer produced, skipping {:?}", self.layer_path);
                None
            }
        };

        let json = serde_json::to_string_pretty(record)
            .context("Failed to serialize investigation record")?;
        Self::write(&self.record_path, &json)?;
        println!("💾 Investigation record: {}", self.record_path.display());

        Ok(SavedArtifacts {
            report: self.report_path.clone(),
            layer,
            record: self.record_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_saves_report_and_record_without_layer() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            output_path: temp_dir.path().join("out"),
            ..Default::default()
        };
        let mut record = InvestigationRecord::new("alert", None);
        record.report = "# Incident Report\n".to_string();

        let saved = save(&config, &record).await.unwrap();

        assert_eq!(
            fs::read_to_string(&saved.report).unwrap(),
            "# Incident Report\n"
        );
        assert!(saved.layer.is_none());
        assert!(!config.layer_path().exists());

        let stored: InvestigationRecord =
            serde_json::from_str(&fs::read_to_string(&saved.record).unwrap()).unwrap();
        assert_eq!(stored.investigation_id, record.investigation_id);
    }
}
