//! In-process container orchestrator.

use async_trait::async_trait;
use conveyor_core::deployer::{ContainerOrchestrator, HealthStatus, Instance, ServiceTarget};
use conveyor_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Simulates services whose instances turn healthy once their grace period
/// has elapsed, unless their image is marked unhealthy.
///
/// Seeded instances are healthy from the start. Every start and stop records
/// the healthy count so tests can check the floor was never breached.
#[derive(Default)]
pub struct SimulatedOrchestrator {
    services: Mutex<HashMap<String, SimulatedService>>,
    unhealthy_images: HashSet<String>,
    next_id: AtomicU64,
}

struct SimulatedService {
    target: ServiceTarget,
    instances: Vec<SimulatedInstance>,
    healthy_history: Vec<u32>,
    max_running: usize,
}

struct SimulatedInstance {
    instance: Instance,
    /// `None` for seeded instances.
    started: Option<Instant>,
}

impl SimulatedOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service running `desired_count` healthy instances of its image.
    pub fn with_service(mut self, target: ServiceTarget) -> Self {
        let instances = (0..target.desired_count)
            .map(|_| SimulatedInstance {
                instance: Instance {
                    id: self.instance_id(&target.name),
                    image: target.image.clone(),
                },
                started: None,
            })
            .collect::<Vec<_>>();
        let service = SimulatedService {
            healthy_history: vec![instances.len() as u32],
            max_running: instances.len(),
            instances,
            target,
        };
        self.services
            .get_mut()
            .insert(service.target.name.clone(), service);
        self
    }

    /// Instances of this image never pass their health check.
    pub fn with_unhealthy_image(mut self, image: impl Into<String>) -> Self {
        self.unhealthy_images.insert(image.into());
        self
    }

    /// Healthy instance count after every start and stop.
    pub async fn healthy_history(&self, service: &str) -> Vec<u32> {
        self.services
            .lock()
            .await
            .get(service)
            .map(|s| s.healthy_history.clone())
            .unwrap_or_default()
    }

    /// Most instances ever running at once.
    pub async fn max_running(&self, service: &str) -> usize {
        self.services
            .lock()
            .await
            .get(service)
            .map(|s| s.max_running)
            .unwrap_or_default()
    }

    fn instance_id(&self, service: &str) -> String {
        format!("{}-{}", service, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn health_of(&self, service: &SimulatedService, instance: &SimulatedInstance) -> HealthStatus {
        let grace = service.target.health_check_grace_period;
        if instance.started.is_some_and(|started| started.elapsed() < grace) {
            HealthStatus::Unknown
        } else if self.unhealthy_images.contains(&instance.instance.image) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }

    fn record(&self, service: &mut SimulatedService) {
        let view: &SimulatedService = service;
        let healthy = view
            .instances
            .iter()
            .filter(|i| self.health_of(view, i) == HealthStatus::Healthy)
            .count() as u32;
        service.healthy_history.push(healthy);
        service.max_running = service.max_running.max(service.instances.len());
    }
}

fn not_found(service: &str) -> Error {
    Error::NotFound(format!("service '{}'", service))
}

#[async_trait]
impl ContainerOrchestrator for SimulatedOrchestrator {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn describe(&self, service: &str) -> Result<ServiceTarget> {
        self.services
            .lock()
            .await
            .get(service)
            .map(|s| s.target.clone())
            .ok_or_else(|| not_found(service))
    }

    async fn set_image(&self, service: &str, image: &str) -> Result<()> {
        let mut services = self.services.lock().await;
        let entry = services.get_mut(service).ok_or_else(|| not_found(service))?;
        entry.target.image = image.to_string();
        Ok(())
    }

    async fn instances(&self, service: &str) -> Result<Vec<Instance>> {
        self.services
            .lock()
            .await
            .get(service)
            .map(|s| s.instances.iter().map(|i| i.instance.clone()).collect())
            .ok_or_else(|| not_found(service))
    }

    async fn start_instance(&self, service: &str, image: &str) -> Result<Instance> {
        let id = self.instance_id(service);
        let mut services = self.services.lock().await;
        let entry = services.get_mut(service).ok_or_else(|| not_found(service))?;
        let instance = Instance {
            id,
            image: image.to_string(),
        };
        entry.instances.push(SimulatedInstance {
            instance: instance.clone(),
            started: Some(Instant::now()),
        });
        self.record(entry);
        debug!(service = %service, instance = %instance.id, "Started instance");
        Ok(instance)
    }

    async fn stop_instance(&self, service: &str, instance: &str) -> Result<()> {
        let mut services = self.services.lock().await;
        let entry = services.get_mut(service).ok_or_else(|| not_found(service))?;
        let before = entry.instances.len();
        entry.instances.retain(|i| i.instance.id != instance);
        if entry.instances.len() == before {
            return Err(Error::NotFound(format!("instance '{}'", instance)));
        }
        self.record(entry);
        debug!(service = %service, instance = %instance, "Stopped instance");
        Ok(())
    }

    async fn health(&self, service: &str, instance: &str) -> Result<HealthStatus> {
        let services = self.services.lock().await;
        let entry = services.get(service).ok_or_else(|| not_found(service))?;
        let found = entry
            .instances
            .iter()
            .find(|i| i.instance.id == instance)
            .ok_or_else(|| Error::NotFound(format!("instance '{}'", instance)))?;
        Ok(self.health_of(entry, found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn target() -> ServiceTarget {
        ServiceTarget {
            name: "api".to_string(),
            desired_count: 2,
            min_healthy_percent: 50,
            max_healthy_percent: 200,
            health_check_grace_period: Duration::from_secs(10),
            image: "api:1".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_instance_healthy_after_grace() {
        let orchestrator = SimulatedOrchestrator::new().with_service(target());
        let instance = orchestrator.start_instance("api", "api:2").await.unwrap();
        assert_eq!(
            orchestrator.health("api", &instance.id).await.unwrap(),
            HealthStatus::Unknown
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            orchestrator.health("api", &instance.id).await.unwrap(),
            HealthStatus::Healthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_image_fails_after_grace() {
        let orchestrator = SimulatedOrchestrator::new()
            .with_service(target())
            .with_unhealthy_image("api:bad");
        let instance = orchestrator.start_instance("api", "api:bad").await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            orchestrator.health("api", &instance.id).await.unwrap(),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_seeded_instances_and_history() {
        let orchestrator = SimulatedOrchestrator::new().with_service(target());
        let instances = orchestrator.instances("api").await.unwrap();
        assert_eq!(instances.len(), 2);

        orchestrator.stop_instance("api", &instances[0].id).await.unwrap();
        assert_eq!(orchestrator.healthy_history("api").await, vec![2, 1]);
        assert!(orchestrator.stop_instance("api", &instances[0].id).await.is_err());
        assert!(orchestrator.describe("missing").await.is_err());
    }
}
