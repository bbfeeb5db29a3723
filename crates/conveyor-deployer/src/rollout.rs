//! Health-gated rolling update.
//!
//! Each round the controller observes the service, terminates new instances
//! that failed their health check after the grace period, retires old
//! instances only while the healthy floor allows it, and starts new instances
//! only while the running ceiling allows it. The rollout ends when `desired`
//! new instances are healthy or the deployment timeout expires.

use chrono::Utc;
use conveyor_core::deployer::{
    ContainerOrchestrator, HealthStatus, Instance, RolloutEvent, RolloutEventKind, RolloutPolicy,
    RolloutReport, ServiceTarget,
};
use conveyor_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Drives rolling updates through a [`ContainerOrchestrator`].
///
/// Rollouts of one service must not overlap; callers serialize them (the
/// pipeline engine runs one execution at a time).
pub struct RolloutController {
    orchestrator: Arc<dyn ContainerOrchestrator>,
    policy: RolloutPolicy,
    service_policies: HashMap<String, RolloutPolicy>,
    /// Service -> image it ran before the latest rollout.
    candidates: Mutex<HashMap<String, String>>,
}

impl RolloutController {
    pub fn new(orchestrator: Arc<dyn ContainerOrchestrator>, policy: RolloutPolicy) -> Self {
        Self {
            orchestrator,
            policy,
            service_policies: HashMap::new(),
            candidates: Mutex::new(HashMap::new()),
        }
    }

    /// Override the policy for one service.
    pub fn with_service_policy(mut self, service: impl Into<String>, policy: RolloutPolicy) -> Self {
        self.service_policies.insert(service.into(), policy);
        self
    }

    pub fn policy_for(&self, service: &str) -> &RolloutPolicy {
        self.service_policies.get(service).unwrap_or(&self.policy)
    }

    /// Image the service ran before its latest rollout.
    pub async fn rollback_candidate(&self, service: &str) -> Option<String> {
        self.candidates.lock().await.get(service).cloned()
    }

    /// Redeploy the recorded prior image through the same algorithm.
    pub async fn rollback(&self, service: &str) -> Result<RolloutReport> {
        let candidate = self.rollback_candidate(service).await.ok_or_else(|| {
            Error::NotFound(format!("no rollback candidate recorded for service '{}'", service))
        })?;
        info!(service = %service, image = %candidate, "Rolling back");
        self.rollout(service, &candidate).await
    }

    /// Roll `service` onto `image`.
    pub async fn rollout(&self, service: &str, image: &str) -> Result<RolloutReport> {
        let target = self.orchestrator.describe(service).await?;
        target.validate()?;
        let policy = self.policy_for(service).clone();

        if target.image != image {
            self.candidates
                .lock()
                .await
                .insert(service.to_string(), target.image.clone());
        }
        self.orchestrator.set_image(service, image).await?;

        info!(
            service = %service,
            from = %target.image,
            to = %image,
            desired = target.desired_count,
            floor = target.min_healthy(),
            ceiling = target.max_running(),
            "Starting rollout"
        );

        let mut run = Rollout {
            orchestrator: self.orchestrator.as_ref(),
            target: &target,
            image,
            policy: &policy,
            launched: HashMap::new(),
            seen_healthy: HashSet::new(),
            consecutive_failures: 0,
            report: RolloutReport {
                service: service.to_string(),
                image: image.to_string(),
                previous_image: target.image.clone(),
                instances_started: 0,
                instances_stopped: 0,
                health_check_failures: 0,
                min_healthy_observed: u32::MAX,
                events: Vec::new(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
            },
        };
        run.event(
            RolloutEventKind::Started,
            format!("rolling {} from {} to {}", service, target.image, image),
        );
        run.drive().await
    }
}

/// State of one rollout in progress.
struct Rollout<'a> {
    orchestrator: &'a dyn ContainerOrchestrator,
    target: &'a ServiceTarget,
    image: &'a str,
    policy: &'a RolloutPolicy,
    /// New instances started by this rollout, with their launch time.
    launched: HashMap<String, Instant>,
    seen_healthy: HashSet<String>,
    consecutive_failures: u32,
    report: RolloutReport,
}

/// One observation of the service.
#[derive(Default)]
struct Snapshot {
    old_healthy: Vec<Instance>,
    old_unhealthy: Vec<Instance>,
    new_healthy: Vec<Instance>,
    new_pending: Vec<Instance>,
}

impl Snapshot {
    fn healthy(&self) -> u32 {
        (self.old_healthy.len() + self.new_healthy.len()) as u32
    }

    fn old(&self) -> u32 {
        (self.old_healthy.len() + self.old_unhealthy.len()) as u32
    }

    fn running(&self) -> u32 {
        self.old() + (self.new_healthy.len() + self.new_pending.len()) as u32
    }
}

/// How a rollout ended.
enum Verdict {
    Converged(Snapshot),
    Failed {
        snapshot: Snapshot,
        reason: String,
        timeout_secs: Option<u64>,
    },
}

impl Rollout<'_> {
    /// Run the rollout under the deployment timeout. A collaborator call
    /// still in flight at the deadline is abandoned.
    async fn drive(mut self) -> Result<RolloutReport> {
        let deadline = Instant::now() + self.policy.deployment_timeout;

        let outcome = tokio::time::timeout_at(deadline, self.converge(deadline)).await;
        let verdict = match outcome {
            Ok(verdict) => verdict?,
            Err(_) => {
                warn!(
                    service = %self.target.name,
                    timeout_secs = self.policy.deployment_timeout.as_secs(),
                    "Orchestrator call overran the deployment timeout"
                );
                self.expired(Snapshot::default())
            }
        };

        match verdict {
            Verdict::Converged(snapshot) => self.complete(snapshot).await,
            Verdict::Failed {
                snapshot,
                reason,
                timeout_secs,
            } => Err(self.fail(snapshot, reason, timeout_secs).await),
        }
    }

    async fn converge(&mut self, deadline: Instant) -> Result<Verdict> {
        let service = self.target.name.clone();
        let desired = self.target.desired_count;

        loop {
            let mut snapshot = self.observe().await?;
            self.observe_healthy(snapshot.healthy());

            if snapshot.new_healthy.len() as u32 >= desired {
                return Ok(Verdict::Converged(snapshot));
            }

            if let Some(threshold) = self.policy.failure_threshold {
                if self.consecutive_failures >= threshold {
                    let reason = format!(
                        "{} consecutive health check failures on {}",
                        self.consecutive_failures, self.image
                    );
                    return Ok(Verdict::Failed {
                        snapshot,
                        reason,
                        timeout_secs: None,
                    });
                }
            }

            if Instant::now() >= deadline {
                return Ok(self.expired(snapshot));
            }

            self.retire_old(&mut snapshot).await?;
            self.start_new(&snapshot).await?;

            let next = Instant::now() + self.policy.poll_interval;
            tokio::time::sleep_until(next.min(deadline)).await;
            debug!(service = %service, "Polling rollout");
        }
    }

    fn expired(&self, snapshot: Snapshot) -> Verdict {
        let timeout_secs = self.policy.deployment_timeout.as_secs();
        let reason = if self.report.health_check_failures > 0 {
            format!(
                "{} instance(s) of {} failed health checks",
                self.report.health_check_failures, self.image
            )
        } else {
            format!("not healthy within {}s", timeout_secs)
        };
        Verdict::Failed {
            snapshot,
            reason,
            timeout_secs: Some(timeout_secs),
        }
    }

    /// Classify every instance. New instances that fail their health check
    /// after the grace period are terminated here.
    async fn observe(&mut self) -> Result<Snapshot> {
        let service = &self.target.name;
        let grace = self.target.health_check_grace_period;
        let mut snapshot = Snapshot::default();

        for instance in self.orchestrator.instances(service).await? {
            let health = self.orchestrator.health(service, &instance.id).await?;

            if instance.image != self.image {
                match health {
                    HealthStatus::Healthy => snapshot.old_healthy.push(instance),
                    _ => snapshot.old_unhealthy.push(instance),
                }
                continue;
            }

            let in_grace = self
                .launched
                .get(&instance.id)
                .is_some_and(|launched| launched.elapsed() < grace);
            if in_grace {
                snapshot.new_pending.push(instance);
                continue;
            }

            match health {
                HealthStatus::Healthy => {
                    if self.seen_healthy.insert(instance.id.clone()) {
                        self.consecutive_failures = 0;
                        self.event(
                            RolloutEventKind::InstanceHealthy,
                            format!("instance {} is healthy", instance.id),
                        );
                    }
                    snapshot.new_healthy.push(instance);
                }
                HealthStatus::Unhealthy => {
                    self.report.health_check_failures += 1;
                    self.consecutive_failures += 1;
                    warn!(service = %service, instance = %instance.id, "Health check failed");
                    self.event(
                        RolloutEventKind::HealthCheckFailed,
                        format!("instance {} failed its health check", instance.id),
                    );
                    self.stop(&instance).await?;
                }
                HealthStatus::Unknown => snapshot.new_pending.push(instance),
            }
        }

        Ok(snapshot)
    }

    /// Stop old instances to make room under the ceiling or to shed surplus,
    /// never taking the healthy count below the floor.
    async fn retire_old(&mut self, snapshot: &mut Snapshot) -> Result<()> {
        let desired = self.target.desired_count;
        let floor = self.target.min_healthy();
        let ceiling = self.target.max_running();

        let new_total = (snapshot.new_healthy.len() + snapshot.new_pending.len()) as u32;
        let needed = desired.saturating_sub(new_total);
        let room_short = snapshot.running().saturating_add(needed).saturating_sub(ceiling);
        let surplus = snapshot
            .old()
            .saturating_add(snapshot.new_healthy.len() as u32)
            .saturating_sub(desired);
        let mut want_gone = room_short.max(surplus).min(snapshot.old());

        while want_gone > 0 {
            if let Some(instance) = snapshot.old_unhealthy.pop() {
                self.stop(&instance).await?;
            } else if snapshot.healthy() > floor {
                let Some(instance) = snapshot.old_healthy.pop() else {
                    break;
                };
                self.stop(&instance).await?;
                self.observe_healthy(snapshot.healthy());
            } else {
                break;
            }
            want_gone -= 1;
        }
        Ok(())
    }

    /// Start replacements while the ceiling allows it.
    async fn start_new(&mut self, snapshot: &Snapshot) -> Result<()> {
        let desired = self.target.desired_count;
        let ceiling = self.target.max_running();
        let new_total = (snapshot.new_healthy.len() + snapshot.new_pending.len()) as u32;
        let needed = desired.saturating_sub(new_total);
        let starts = needed.min(ceiling.saturating_sub(snapshot.running()));

        for _ in 0..starts {
            let instance = self
                .orchestrator
                .start_instance(&self.target.name, self.image)
                .await?;
            self.launched.insert(instance.id.clone(), Instant::now());
            self.report.instances_started += 1;
            self.event(
                RolloutEventKind::InstanceStarted,
                format!("started instance {} on {}", instance.id, self.image),
            );
        }
        Ok(())
    }

    async fn complete(mut self, snapshot: Snapshot) -> Result<RolloutReport> {
        let desired = self.target.desired_count as usize;
        let leftovers = snapshot
            .old_healthy
            .iter()
            .chain(&snapshot.old_unhealthy)
            .chain(&snapshot.new_pending)
            .chain(snapshot.new_healthy.iter().skip(desired));
        for instance in leftovers {
            self.stop(instance).await?;
        }

        self.report.finished_at = Utc::now();
        if self.report.min_healthy_observed == u32::MAX {
            self.report.min_healthy_observed = snapshot.healthy();
        }
        self.event(
            RolloutEventKind::Completed,
            format!("{}/{} instances healthy on {}", desired, desired, self.image),
        );
        info!(
            service = %self.target.name,
            image = %self.image,
            started = self.report.instances_started,
            stopped = self.report.instances_stopped,
            "Rollout completed"
        );
        Ok(self.report)
    }

    /// Stop new instances that never became healthy and build the error.
    /// Old instances are left serving; there is no automatic rollback.
    async fn fail(mut self, snapshot: Snapshot, reason: String, timeout_secs: Option<u64>) -> Error {
        let mut abandoned = snapshot.new_pending.clone();
        for id in self.launched.keys() {
            if !self.seen_healthy.contains(id) && !abandoned.iter().any(|i| &i.id == id) {
                abandoned.push(Instance {
                    id: id.clone(),
                    image: self.image.to_string(),
                });
            }
        }

        // Each stop gets at most one poll interval past the deadline.
        let bound = self.policy.poll_interval;
        for instance in &abandoned {
            match tokio::time::timeout(bound, self.stop(instance)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(instance = %instance.id, error = %e, "Failed to stop instance"),
                Err(_) => warn!(instance = %instance.id, "Timed out stopping instance"),
            }
        }
        self.event(RolloutEventKind::Failed, reason.clone());
        self.report.finished_at = Utc::now();
        if self.report.min_healthy_observed == u32::MAX {
            self.report.min_healthy_observed = snapshot.healthy();
        }
        error!(
            service = %self.target.name,
            image = %self.image,
            healthy = snapshot.healthy(),
            reason = %reason,
            "Rollout failed"
        );

        let service = self.target.name.clone();
        let diagnostics = self.report.summary();
        match timeout_secs {
            Some(timeout_secs) if self.report.health_check_failures == 0 => {
                Error::RolloutTimeout {
                    service,
                    timeout_secs,
                    diagnostics,
                }
            }
            _ => Error::RolloutFailed {
                service,
                reason,
                diagnostics,
            },
        }
    }

    async fn stop(&mut self, instance: &Instance) -> Result<()> {
        self.orchestrator
            .stop_instance(&self.target.name, &instance.id)
            .await?;
        self.launched.remove(&instance.id);
        self.report.instances_stopped += 1;
        self.event(
            RolloutEventKind::InstanceStopped,
            format!("stopped instance {} ({})", instance.id, instance.image),
        );
        Ok(())
    }

    fn observe_healthy(&mut self, healthy: u32) {
        self.report.min_healthy_observed = self.report.min_healthy_observed.min(healthy);
    }

    fn event(&mut self, kind: RolloutEventKind, message: String) {
        debug!(service = %self.target.name, ?kind, message = %message, "Rollout event");
        self.report.events.push(RolloutEvent {
            timestamp: Utc::now(),
            kind,
            message,
        });
    }
}
