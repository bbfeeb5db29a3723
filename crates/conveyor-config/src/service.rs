//! Service target declarations.

use conveyor_core::deployer::{RolloutPolicy, ServiceTarget};
use kdl::KdlNode;
use std::time::Duration;

use crate::nodes::{first_string_arg, secs_arg, u32_arg};
use crate::{ConfigError, ConfigResult};

/// A deployable service and its rollout overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub target: ServiceTarget,
    /// Overrides the engine-wide deployment timeout for this service.
    pub deployment_timeout: Option<Duration>,
}

impl ServiceConfig {
    /// The engine-wide policy with this service's overrides applied.
    pub fn policy(&self, base: &RolloutPolicy) -> RolloutPolicy {
        let mut policy = base.clone();
        if let Some(timeout) = self.deployment_timeout {
            policy.deployment_timeout = timeout;
        }
        policy
    }
}

pub(crate) fn parse_service(node: &KdlNode) -> ConfigResult<ServiceConfig> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("service name".to_string()))?;
    let field = |what: &str| format!("{} of service '{}'", what, name);

    let mut target = ServiceTarget {
        name: name.clone(),
        desired_count: 1,
        min_healthy_percent: 100,
        max_healthy_percent: 200,
        health_check_grace_period: Duration::ZERO,
        image: String::new(),
    };
    let mut deployment_timeout = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => target.image = first_string_arg(child).unwrap_or_default(),
                "desired-count" => target.desired_count = u32_arg(child, &field("desired-count"))?,
                "min-healthy-percent" => {
                    target.min_healthy_percent = u32_arg(child, &field("min-healthy-percent"))?
                }
                "max-healthy-percent" => {
                    target.max_healthy_percent = u32_arg(child, &field("max-healthy-percent"))?
                }
                "grace-period-secs" => {
                    target.health_check_grace_period =
                        secs_arg(child, &field("grace-period-secs"))?
                }
                "deployment-timeout-secs" => {
                    deployment_timeout = Some(secs_arg(child, &field("deployment-timeout-secs"))?)
                }
                _ => {}
            }
        }
    }

    if target.image.is_empty() {
        return Err(ConfigError::MissingField(field("image")));
    }
    target
        .validate()
        .map_err(|e| ConfigError::invalid(field("rollout bounds"), e.to_string()))?;

    Ok(ServiceConfig {
        target,
        deployment_timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdl::KdlDocument;

    fn parse(kdl: &str) -> ConfigResult<ServiceConfig> {
        let doc: KdlDocument = kdl.parse()?;
        parse_service(&doc.nodes()[0])
    }

    #[test]
    fn test_parse_service() {
        let service = parse(
            r#"
            service "web" {
                image "app:1"
                desired-count 2
                min-healthy-percent 50
                max-healthy-percent 200
                grace-period-secs 30
                deployment-timeout-secs 900
            }
            "#,
        )
        .unwrap();

        assert_eq!(service.target.desired_count, 2);
        assert_eq!(service.target.min_healthy(), 1);
        assert_eq!(service.target.health_check_grace_period, Duration::from_secs(30));
        let policy = service.policy(&RolloutPolicy::default());
        assert_eq!(policy.deployment_timeout, Duration::from_secs(900));
    }

    #[test]
    fn test_service_requires_image() {
        assert!(matches!(
            parse(r#"service "web" { desired-count 2 }"#).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_service_rejects_stuck_bounds() {
        let err = parse(
            r#"
            service "web" {
                image "app:1"
                min-healthy-percent 100
                max-healthy-percent 100
            }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_service_rejects_negative_count() {
        assert!(parse(r#"service "web" { image "app:1"; desired-count -1 }"#).is_err());
    }
}
