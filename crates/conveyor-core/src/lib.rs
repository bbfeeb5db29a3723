//! Core domain types and traits for the Conveyor delivery pipeline.
//!
//! This crate contains:
//! - Identifiers and the error taxonomy
//! - Pipeline, stage, action and execution types
//! - The action runner trait
//! - Storage abstractions (artifacts, secrets, execution history)
//! - Collaborator traits (source, registry, provisioner, container orchestrator)

pub mod artifact;
pub mod deployer;
pub mod error;
pub mod executor;
pub mod history;
pub mod id;
pub mod pipeline;
pub mod provision;
pub mod registry;
pub mod secret;
pub mod source;

pub use error::{Error, Result};
pub use id::{ExecutionId, PipelineId};
