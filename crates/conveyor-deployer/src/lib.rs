//! Rolling-update deployments for Conveyor.
//!
//! Provides:
//! - [`RolloutController`]: health-gated rolling update of a service
//! - [`SimulatedOrchestrator`]: in-process container orchestrator
//! - [`DeployRunner`]: serves `deploy` actions through the controller

pub mod deploy;
pub mod rollout;
pub mod simulated;

pub use deploy::DeployRunner;
pub use rollout::RolloutController;
pub use simulated::SimulatedOrchestrator;

pub use conveyor_core::deployer::{
    ContainerOrchestrator, HealthStatus, Instance, RolloutPolicy, RolloutReport, ServiceTarget,
};
