//! Container orchestrator collaborator and rollout types.
//!
//! The orchestrator owns the live service; the rollout controller drives it
//! through this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// The deployable unit a rollout mutates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    /// Service name.
    pub name: String,
    /// Number of instances that should serve.
    pub desired_count: u32,
    /// Lower bound on healthy instances during a rollout, in percent of desired.
    pub min_healthy_percent: u32,
    /// Upper bound on running instances during a rollout, in percent of desired.
    pub max_healthy_percent: u32,
    /// Delay after start before an instance's health result counts.
    pub health_check_grace_period: Duration,
    /// Current (desired) image reference.
    pub image: String,
}

impl ServiceTarget {
    /// `ceil(desired * min / 100)`
    pub fn min_healthy(&self) -> u32 {
        clamp_count(scaled(self.desired_count, self.min_healthy_percent).div_ceil(100))
    }

    /// `floor(desired * max / 100)`, saturating at `u32::MAX`.
    pub fn max_running(&self) -> u32 {
        clamp_count(scaled(self.desired_count, self.max_healthy_percent) / 100)
    }

    /// Reject bounds under which a rolling update can never make progress.
    pub fn validate(&self) -> Result<()> {
        if self.desired_count == 0 {
            return Err(Error::InvalidInput(format!(
                "service '{}' has a desired count of zero",
                self.name
            )));
        }
        if self.min_healthy_percent > 100 {
            return Err(Error::InvalidInput(format!(
                "service '{}': minimum healthy percent {} exceeds 100",
                self.name, self.min_healthy_percent
            )));
        }
        if self.max_healthy_percent < 100 {
            return Err(Error::InvalidInput(format!(
                "service '{}': maximum healthy percent {} is below 100",
                self.name, self.max_healthy_percent
            )));
        }
        if self.max_running() <= self.desired_count && self.min_healthy() >= self.desired_count {
            return Err(Error::InvalidInput(format!(
                "service '{}': bounds {}%..{}% leave no room to replace instances",
                self.name, self.min_healthy_percent, self.max_healthy_percent
            )));
        }
        Ok(())
    }
}

fn scaled(count: u32, percent: u32) -> u64 {
    u64::from(count) * u64::from(percent)
}

fn clamp_count(count: u64) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// A running instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub image: String,
}

/// Result of an instance health query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[display("healthy")]
    Healthy,
    #[display("unhealthy")]
    Unhealthy,
    /// No verdict yet (still starting).
    #[display("unknown")]
    Unknown,
}

/// Trait for container orchestrators.
#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    /// Name of this orchestrator.
    fn name(&self) -> &'static str;

    /// Current definition of a service.
    async fn describe(&self, service: &str) -> Result<ServiceTarget>;

    /// Record the image new instances should run.
    async fn set_image(&self, service: &str, image: &str) -> Result<()>;

    /// Running instances of a service.
    async fn instances(&self, service: &str) -> Result<Vec<Instance>>;

    /// Launch one instance on an image.
    async fn start_instance(&self, service: &str, image: &str) -> Result<Instance>;

    /// Terminate an instance.
    async fn stop_instance(&self, service: &str, instance: &str) -> Result<()>;

    /// Query an instance's health check.
    async fn health(&self, service: &str, instance: &str) -> Result<HealthStatus>;
}

/// Timing policy for a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    /// Hard wall-clock bound on the whole rollout.
    pub deployment_timeout: Duration,
    /// Delay between health observations.
    pub poll_interval: Duration,
    /// End the rollout early after this many failed health checks on the new image.
    pub failure_threshold: Option<u32>,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            deployment_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            failure_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutEventKind {
    Started,
    InstanceStarted,
    InstanceHealthy,
    HealthCheckFailed,
    InstanceStopped,
    Completed,
    Failed,
}

/// Something that happened during a rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: RolloutEventKind,
    pub message: String,
}

/// Summary of a finished rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutReport {
    pub service: String,
    pub image: String,
    /// Image the service ran before; the rollback candidate.
    pub previous_image: String,
    pub instances_started: u32,
    pub instances_stopped: u32,
    pub health_check_failures: u32,
    /// Lowest healthy count observed while replacing instances.
    pub min_healthy_observed: u32,
    pub events: Vec<RolloutEvent>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RolloutReport {
    /// One line per event, headed by the outcome.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{}: {} -> {} (started {}, stopped {}, failed checks {}, min healthy {})",
            self.service,
            self.previous_image,
            self.image,
            self.instances_started,
            self.instances_stopped,
            self.health_check_failures,
            self.min_healthy_observed
        );
        for event in &self.events {
            out.push_str(&format!(
                "\n{} {:?} {}",
                event.timestamp.format("%H:%M:%S"),
                event.kind,
                event.message
            ));
        }
        out
    }
}
