//! Pipeline engine for Conveyor.
//!
//! Runs executions of one pipeline strictly one at a time, stage by stage,
//! with the actions of a stage running concurrently. Artifacts flow between
//! stages through an [`ArtifactStore`](conveyor_core::artifact::ArtifactStore);
//! every state transition is appended to an
//! [`ExecutionLog`](conveyor_core::history::ExecutionLog).

pub mod engine;
pub mod event;
pub mod history;
pub mod stage;
pub mod store;

pub use engine::{EngineConfig, ExecutionHandle, PipelineEngine, PipelineEngineBuilder};
pub use event::PipelineEvent;
pub use history::{JsonlExecutionLog, MemoryExecutionLog};
pub use store::MemoryArtifactStore;
