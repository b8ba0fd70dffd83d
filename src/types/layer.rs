use serde::{Deserialize, Serialize};

pub const LAYER_FORMAT_VERSION: &str = "4.5";
pub const NAVIGATOR_VERSION: &str = "5.1.0";
pub const ATTACK_VERSION: &str = "16";

/// ATT&CK Navigator layer, serialized with the navigator's field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigatorLayer {
    pub name: String,
    pub version: String,
    pub versions: LayerVersions,
    pub domain: String,
    pub description: String,
    pub techniques: Vec<LayerTechnique>,
    pub gradient: LayerGradient,
    pub legend_items: Vec<LegendItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerVersions {
    pub attack: String,
    pub navigator: String,
    pub layer: String,
}

impl Default for LayerVersions {
    fn default() -> Self {
        Self {
            attack: ATTACK_VERSION.to_string(),
            navigator: NAVIGATOR_VERSION.to_string(),
            layer: LAYER_FORMAT_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerTechnique {
    #[serde(rename = "techniqueID")]
    pub technique_id: String,
    /// 0..=100
    pub score: u8,
    pub color: String,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerGradient {
    pub colors: Vec<String>,
    pub min_value: u8,
    pub max_value: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegendItem {
    pub label: String,
    pub color: String,
}

impl NavigatorLayer {
    pub fn technique(&self, technique_id: &str) -> Option<&LayerTechnique> {
        self.techniques
            .iter()
            .find(|technique| technique.technique_id == technique_id)
    }
}
