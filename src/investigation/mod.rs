//! Investigation engine: the stage graph, its stages and the orchestrator running them.

pub mod agents;
pub mod context;
pub mod graph;
pub mod orchestrator;
pub mod outlet;
pub mod record;
pub mod stage;
pub mod workflow;

pub use context::InvestigationContext;
pub use orchestrator::Orchestrator;
pub use record::{InvestigationRecord, StageError, StageErrorKind, StageId};
