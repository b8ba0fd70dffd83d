use async_trait::async_trait;

use crate::investigation::context::InvestigationContext;
use crate::investigation::record::{InvestigationRecord, StageId, StageOutcome, StageOutput};
use crate::investigation::stage::Stage;
use crate::types::layer::{
    LAYER_FORMAT_VERSION, LayerGradient, LayerTechnique, LayerVersions, LegendItem,
    NavigatorLayer,
};

pub const DETECTED_WEIGHT: u8 = 40;
pub const MITIGATED_WEIGHT: u8 = 35;
pub const ATTRIBUTED_WEIGHT: u8 = 25;

/// Score bands, lowest first: (upper bound inclusive, color, legend label)
const BANDS: [(u8, &str, &str); 5] = [
    (0, "#ff6666", "no coverage"),
    (39, "#ff9e66", "weak coverage"),
    (74, "#ffe766", "partial coverage"),
    (99, "#b6e36b", "good coverage"),
    (100, "#66b266", "full coverage"),
];

/// Coverage score in 0..=100; adding coverage never lowers it.
pub fn coverage_score(detected: bool, mitigated: bool, attributed: bool) -> u8 {
    let mut score = 0;
    if detected {
        score += DETECTED_WEIGHT;
    }
    if mitigated {
        score += MITIGATED_WEIGHT;
    }
    if attributed {
        score += ATTRIBUTED_WEIGHT;
    }
    score
}

pub fn color_for_score(score: u8) -> &'static str {
    BANDS
        .iter()
        .find(|(upper, _, _)| score <= *upper)
        .map(|(_, color, _)| *color)
        .unwrap_or("#66b266")
}

/// Build the navigator layer from the record. Pure; missing upstream
/// entries count as not covered.
pub fn build_layer(record: &InvestigationRecord) -> NavigatorLayer {
    let techniques = record
        .validated_techniques
        .iter()
        .map(|technique| {
            let id = technique.identifier.as_str();
            let components = record.detections.get(id).map_or(0, Vec::len);
            let mitigations = record.mitigations.get(id).map_or(0, Vec::len);
            let (groups, software) = record
                .intelligence
                .get(id)
                .map_or((0, 0), |a| (a.groups.len(), a.software.len()));

            let score = coverage_score(components > 0, mitigations > 0, groups + software > 0);
            LayerTechnique {
                technique_id: id.to_string(),
                score,
                color: color_for_score(score).to_string(),
                comment: format!(
                    "{} | tactics: {} | data components: {} | mitigations: {} | groups: {} | software: {}",
                    technique.name,
                    if technique.tactics.is_empty() {
                        "unknown".to_string()
                    } else {
                        technique.tactics.join(", ")
                    },
                    components,
                    mitigations,
                    groups,
                    software
                ),
            }
        })
        .collect();

    NavigatorLayer {
        name: format!("Incident {}", record.investigation_id),
        version: LAYER_FORMAT_VERSION.to_string(),
        versions: LayerVersions::default(),
        domain: "enterprise-attack".to_string(),
        description: "Verified techniques scored by detection, mitigation and attribution coverage"
            .to_string(),
        techniques,
        gradient: LayerGradient {
            colors: vec![
                BANDS[0].1.to_string(),
                BANDS[2].1.to_string(),
                BANDS[4].1.to_string(),
            ],
            min_value: 0,
            max_value: 100,
        },
        legend_items: BANDS
            .iter()
            .map(|(_, color, label)| LegendItem {
                label: label.to_string(),
                color: color.to_string(),
            })
            .collect(),
    }
}

pub struct VisualizationStage;

#[async_trait]
impl Stage for VisualizationStage {
    fn id(&self) -> StageId {
        StageId::Visualization
    }

    async fn run(
        &self,
        context: &InvestigationContext,
        record: &InvestigationRecord,
    ) -> StageOutcome {
        let mut layer = build_layer(record);
        layer.domain = format!("{}-attack", context.config.knowledge_base.domain);
        StageOutcome::new(StageOutput::Visualization(Some(layer)))
    }
}
