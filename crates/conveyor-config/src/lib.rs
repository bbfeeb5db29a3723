//! KDL configuration parsing for Conveyor.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (conveyor.kdl)
//! - Service targets
//! - Engine configuration
//! - Variable interpolation

pub mod error;
mod nodes;
pub mod pipeline;
pub mod service;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{ProjectConfig, load_project, parse_pipeline, parse_project};
pub use service::ServiceConfig;
pub use system::{SystemConfig, parse_system_config};
pub use variables::{
    ExecutionContext, PipelineContext, SourceContext, StageContext, VariableContext,
    VariableContextBuilder,
};
