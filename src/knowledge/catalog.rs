//! In-memory knowledge base built from an ATT&CK STIX 2.x bundle (e.g. `enterprise-attack.json`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::knowledge::{
    KbOperation, KbRecord, KbRequest, KbResponse, KnowledgeBase, KnowledgeBaseError, NamedEntity,
    TechniqueRecord,
};
use crate::types::layer::{
    LAYER_FORMAT_VERSION, LayerGradient, LayerTechnique, LayerVersions, LegendItem,
    NavigatorLayer,
};
use crate::types::technique::{DataComponent, Mitigation};

const ATTACK_SOURCES: [&str; 3] = ["mitre-attack", "mitre-mobile-attack", "mitre-ics-attack"];

#[derive(Debug, Deserialize)]
struct StixBundle {
    #[serde(default)]
    objects: Vec<StixObject>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StixObject {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    name: Option<String>,
    description: Option<String>,
    external_references: Vec<ExternalReference>,
    kill_chain_phases: Vec<KillChainPhase>,
    relationship_type: Option<String>,
    source_ref: Option<String>,
    target_ref: Option<String>,
    x_mitre_data_source_ref: Option<String>,
    revoked: bool,
    x_mitre_deprecated: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExternalReference {
    source_name: String,
    external_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KillChainPhase {
    kill_chain_name: String,
    phase_name: String,
}

impl StixObject {
    fn attack_id(&self) -> Option<&str> {
        self.external_references
            .iter()
            .find(|reference| ATTACK_SOURCES.contains(&reference.source_name.as_str()))
            .and_then(|reference| reference.external_id.as_deref())
    }

    fn is_active(&self) -> bool {
        !self.revoked && !self.x_mitre_deprecated
    }

    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone)]
struct CatalogTechnique {
    record: TechniqueRecord,
    tactics: Vec<String>,
}

/// Knowledge base answering every [`KbOperation`] from an indexed STIX bundle.
#[derive(Debug, Default)]
pub struct CatalogKnowledgeBase {
    domain: String,
    techniques: HashMap<String, CatalogTechnique>,
    groups: HashMap<String, Vec<NamedEntity>>,
    software: HashMap<String, Vec<NamedEntity>>,
    data_components: HashMap<String, Vec<DataComponent>>,
    mitigations: HashMap<String, Vec<Mitigation>>,
}

impl CatalogKnowledgeBase {
    /// Load and index a bundle file
    pub fn from_file(path: &Path, domain: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read ATT&CK bundle: {:?}", path))?;
        Self::from_bundle_json(&content, domain)
    }

    pub fn from_bundle_json(content: &str, domain: &str) -> Result<Self> {
        let bundle: StixBundle =
            serde_json::from_str(content).context("Failed to parse ATT&CK STIX bundle")?;
        Ok(Self::index(bundle, domain))
    }

    fn index(bundle: StixBundle, domain: &str) -> Self {
        let mut catalog = Self {
            domain: domain.to_string(),
            ..Default::default()
        };

        let active: HashMap<&str, &StixObject> = bundle
            .objects
            .iter()
            .filter(|object| object.is_active())
            .map(|object| (object.id.as_str(), object))
            .collect();

        // STIX id of an attack-pattern -> ATT&CK technique id
        let mut technique_ids: HashMap<&str, String> = HashMap::new();

        for object in active.values().filter(|object| object.kind == "attack-pattern") {
            let Some(attack_id) = object.attack_id() else {
                continue;
            };
            let tactics = object
                .kill_chain_phases
                .iter()
                .filter(|phase| phase.kill_chain_name.starts_with("mitre"))
                .map(|phase| phase.phase_name.clone())
                .collect();
            technique_ids.insert(object.id.as_str(), attack_id.to_string());
            catalog.techniques.insert(
                attack_id.to_string(),
                CatalogTechnique {
                    record: TechniqueRecord {
                        id: attack_id.to_string(),
                        name: object.display_name(),
                        stix_id: object.id.clone(),
                        description: object.description.clone(),
                    },
                    tactics,
                },
            );
        }

        for relationship in active.values().filter(|object| object.kind == "relationship") {
            let (Some(source_ref), Some(target_ref), Some(relationship_type)) = (
                relationship.source_ref.as_deref(),
                relationship.target_ref.as_deref(),
                relationship.relationship_type.as_deref(),
            ) else {
                continue;
            };
            let (Some(technique_id), Some(source)) =
                (technique_ids.get(target_ref), active.get(source_ref))
            else {
                continue;
            };

            match (relationship_type, source.kind.as_str()) {
                ("uses", "intrusion-set") => catalog
                    .groups
                    .entry(technique_id.clone())
                    .or_default()
                    .push(named_entity(source)),
                ("uses", "malware" | "tool") => catalog
                    .software
                    .entry(technique_id.clone())
                    .or_default()
                    .push(named_entity(source)),
                ("mitigates", "course-of-action") => catalog
                    .mitigations
                    .entry(technique_id.clone())
                    .or_default()
                    .push(Mitigation {
                        id: source.attack_id().unwrap_or(&source.id).to_string(),
                        name: source.display_name(),
                        description: source.description.clone().unwrap_or_default(),
                    }),
                ("detects", "x-mitre-data-component") => {
                    let data_source = source
                        .x_mitre_data_source_ref
                        .as_deref()
                        .and_then(|reference| active.get(reference))
                        .and_then(|data_source| data_source.name.clone());
                    catalog
                        .data_components
                        .entry(technique_id.clone())
                        .or_default()
                        .push(DataComponent {
                            name: source.display_name(),
                            data_source,
                        });
                }
                _ => {}
            }
        }

        for entities in catalog.groups.values_mut().chain(catalog.software.values_mut()) {
            entities.sort_by(|a, b| a.name.cmp(&b.name));
            entities.dedup_by(|a, b| a.id == b.id);
        }
        for components in catalog.data_components.values_mut() {
            components.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
            components.dedup();
        }
        for mitigations in catalog.mitigations.values_mut() {
            mitigations.sort_by(|a, b| a.id.cmp(&b.id));
            mitigations.dedup_by(|a, b| a.id == b.id);
        }

        tracing::debug!(
            "indexed {} techniques from ATT&CK bundle ({})",
            catalog.techniques.len(),
            catalog.domain
        );
        catalog
    }

    pub fn technique_count(&self) -> usize {
        self.techniques.len()
    }

    fn list_response<T>(
        map: &HashMap<String, Vec<T>>,
        technique_id: &str,
        wrap: fn(Vec<T>) -> KbRecord,
    ) -> KbResponse
    where
        T: Clone,
    {
        match map.get(technique_id) {
            Some(items) if !items.is_empty() => KbResponse::Found(wrap(items.clone())),
            _ => KbResponse::Empty,
        }
    }

    fn usage_layer(&self, request: &KbRequest) -> Result<KbResponse, KnowledgeBaseError> {
        let requested: Vec<&str> = request
            .args
            .get("technique_ids")
            .and_then(|value| value.as_array())
            .ok_or_else(|| {
                KnowledgeBaseError::InvalidRequest(
                    "generate_layer requires a `technique_ids` array".to_string(),
                )
            })?
            .iter()
            .filter_map(|value| value.as_str())
            .collect();

        let techniques: Vec<LayerTechnique> = requested
            .iter()
            .filter_map(|technique_id| self.techniques.get(*technique_id))
            .map(|technique| {
                let id = technique.record.id.as_str();
                let users = self.groups.get(id).map_or(0, Vec::len)
                    + self.software.get(id).map_or(0, Vec::len);
                let score = (users * 10).min(100) as u8;
                LayerTechnique {
                    technique_id: id.to_string(),
                    score,
                    color: if score >= 50 { "#ff6666" } else { "#ffe766" }.to_string(),
                    comment: format!("{} known groups/software", users),
                }
            })
            .collect();

        if techniques.is_empty() {
            return Ok(KbResponse::Empty);
        }

        let layer = NavigatorLayer {
            name: request.str_arg("name").unwrap_or("Technique usage").to_string(),
            version: LAYER_FORMAT_VERSION.to_string(),
            versions: LayerVersions::default(),
            domain: format!("{}-attack", self.domain),
            description: "Techniques scored by the number of groups and software using them"
                .to_string(),
            techniques,
            gradient: LayerGradient {
                colors: vec!["#ffe766".to_string(), "#ff6666".to_string()],
                min_value: 0,
                max_value: 100,
            },
            legend_items: vec![
                LegendItem {
                    label: "rarely used".to_string(),
                    color: "#ffe766".to_string(),
                },
                LegendItem {
                    label: "widely used".to_string(),
                    color: "#ff6666".to_string(),
                },
            ],
        };
        Ok(KbResponse::Found(KbRecord::Layer(Box::new(layer))))
    }
}

fn named_entity(object: &StixObject) -> NamedEntity {
    NamedEntity {
        id: object.attack_id().unwrap_or(&object.id).to_string(),
        name: object.display_name(),
    }
}

#[async_trait]
impl KnowledgeBase for CatalogKnowledgeBase {
    async fn query(&self, request: &KbRequest) -> Result<KbResponse, KnowledgeBaseError> {
        if let Some(domain) = request.str_arg("domain")
            && domain != self.domain
        {
            return Err(KnowledgeBaseError::InvalidRequest(format!(
                "catalog serves the {} domain, not {}",
                self.domain, domain
            )));
        }

        let technique_id = move || request.required_str("technique_id");
        let response = match request.operation {
            KbOperation::GenerateLayer => return self.usage_layer(request),
            KbOperation::TechniqueById => match self.techniques.get(technique_id()?) {
                Some(technique) => KbResponse::Found(KbRecord::Technique(technique.record.clone())),
                None => KbResponse::Empty,
            },
            KbOperation::TacticsForTechnique => match self.techniques.get(technique_id()?) {
                Some(technique) if !technique.tactics.is_empty() => {
                    KbResponse::Found(KbRecord::Tactics(technique.tactics.clone()))
                }
                _ => KbResponse::Empty,
            },
            KbOperation::GroupsUsingTechnique => {
                Self::list_response(&self.groups, technique_id()?, KbRecord::Groups)
            }
            KbOperation::SoftwareUsingTechnique => {
                Self::list_response(&self.software, technique_id()?, KbRecord::Software)
            }
            KbOperation::DatacomponentsForTechnique => Self::list_response(
                &self.data_components,
                technique_id()?,
                KbRecord::DataComponents,
            ),
            KbOperation::MitigationsForTechnique => {
                Self::list_response(&self.mitigations, technique_id()?, KbRecord::Mitigations)
            }
        };
        Ok(response)
    }
}
