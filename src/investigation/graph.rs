//! Stage graph: which stage follows which, and under what condition.

use std::collections::BTreeMap;

use crate::investigation::record::{InvestigationRecord, StageId};

pub type Predicate = fn(&InvestigationRecord) -> bool;

/// Edge condition, named so routing decisions can be logged and tested.
#[derive(Clone, Copy)]
pub enum Condition {
    Always,
    When(&'static str, Predicate),
    Unless(&'static str, Predicate),
}

impl Condition {
    pub fn evaluate(&self, record: &InvestigationRecord) -> bool {
        match self {
            Condition::Always => true,
            Condition::When(_, predicate) => predicate(record),
            Condition::Unless(_, predicate) => !predicate(record),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::Always => write!(f, "always"),
            Condition::When(name, _) => write!(f, "{}", name),
            Condition::Unless(name, _) => write!(f, "!{}", name),
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub from: StageId,
    pub to: StageId,
    pub condition: Condition,
}

pub fn has_candidate_techniques(record: &InvestigationRecord) -> bool {
    !record.candidate_techniques.is_empty() && !record.has_fatal_error()
}

pub fn has_verified_techniques(record: &InvestigationRecord) -> bool {
    !record.validated_techniques.is_empty()
}

/// True iff some verified technique has no detection coverage.
pub fn needs_detection_reasoning(record: &InvestigationRecord) -> bool {
    !record.techniques_without_detections().is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Pending,
    Completed,
    Skipped,
}

impl StageState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, StageState::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    entry: StageId,
    edges: Vec<Edge>,
}

impl StageGraph {
    pub fn new(entry: StageId, edges: Vec<Edge>) -> Self {
        Self { entry, edges }
    }

    /// Triage -> Mapping -> {Intelligence, Detection, Mitigation}
    /// -> Detection-Reasoning (when coverage gaps exist) -> Visualization -> Report,
    /// with short-circuits to Report when triage or mapping come up empty.
    pub fn investigation() -> Self {
        use StageId::*;

        let has_candidates = ("has_candidate_techniques", has_candidate_techniques as Predicate);
        let has_verified = ("has_verified_techniques", has_verified_techniques as Predicate);
        let needs_reasoning = ("needs_detection_reasoning", needs_detection_reasoning as Predicate);

        let mut edges = vec![
            Edge {
                from: Triage,
                to: Mapping,
                condition: Condition::When(has_candidates.0, has_candidates.1),
            },
            Edge {
                from: Triage,
                to: Report,
                condition: Condition::Unless(has_candidates.0, has_candidates.1),
            },
            Edge {
                from: Mapping,
                to: Report,
                condition: Condition::Unless(has_verified.0, has_verified.1),
            },
        ];

        for enrichment in [Intelligence, Detection, Mitigation] {
            edges.push(Edge {
                from: Mapping,
                to: enrichment,
                condition: Condition::When(has_verified.0, has_verified.1),
            });
            edges.push(Edge {
                from: enrichment,
                to: DetectionReasoning,
                condition: Condition::When(needs_reasoning.0, needs_reasoning.1),
            });
            edges.push(Edge {
                from: enrichment,
                to: Visualization,
                condition: Condition::Always,
            });
        }

        edges.push(Edge {
            from: DetectionReasoning,
            to: Visualization,
            condition: Condition::Always,
        });
        edges.push(Edge {
            from: Visualization,
            to: Report,
            condition: Condition::Always,
        });

        Self::new(Triage, edges)
    }

    pub fn entry(&self) -> StageId {
        self.entry
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn incoming(&self, stage: StageId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |edge| edge.to == stage)
    }

    pub fn initial_states(&self) -> BTreeMap<StageId, StageState> {
        StageId::ALL
            .iter()
            .map(|stage| (*stage, StageState::Pending))
            .collect()
    }

    /// Compute the next wave.
    ///
    /// A pending stage whose sources are all resolved is ready when at least
    /// one edge from a completed source is active, and is marked skipped
    /// otherwise. Skips cascade until a fixpoint, so a single call resolves
    /// whole unreachable branches.
    pub fn next_wave(
        &self,
        states: &mut BTreeMap<StageId, StageState>,
        record: &InvestigationRecord,
    ) -> Vec<StageId> {
        loop {
            let mut changed = false;
            for stage in StageId::ALL {
                if states.get(&stage) != Some(&StageState::Pending) || stage == self.entry {
                    continue;
                }
                if self.sources_resolved(stage, states) && !self.has_active_edge(stage, states, record)
                {
                    tracing::debug!("skipping stage {}: no active incoming edge", stage);
                    states.insert(stage, StageState::Skipped);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        StageId::ALL
            .into_iter()
            .filter(|stage| states.get(stage) == Some(&StageState::Pending))
            .filter(|stage| {
                *stage == self.entry
                    || (self.sources_resolved(*stage, states)
                        && self.has_active_edge(*stage, states, record))
            })
            .collect()
    }

    fn sources_resolved(&self, stage: StageId, states: &BTreeMap<StageId, StageState>) -> bool {
        self.incoming(stage).all(|edge| {
            states
                .get(&edge.from)
                .is_some_and(|state| state.is_resolved())
        })
    }

    fn has_active_edge(
        &self,
        stage: StageId,
        states: &BTreeMap<StageId, StageState>,
        record: &InvestigationRecord,
    ) -> bool {
        self.incoming(stage).any(|edge| {
            states.get(&edge.from) == Some(&StageState::Completed)
                && edge.condition.evaluate(record)
        })
    }
}

impl Default for StageGraph {
    fn default() -> Self {
        Self::investigation()
    }
}
