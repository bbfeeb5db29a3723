//! Engine (system) configuration.

use conveyor_core::deployer::RolloutPolicy;
use kdl::{KdlDocument, KdlNode};
use std::path::PathBuf;
use std::time::Duration;

use crate::nodes::{bool_arg, first_string_arg, secs_arg, u32_arg, u64_arg};
use crate::{ConfigError, ConfigResult};

/// Engine-wide settings from the `engine` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    /// Directory for the JSON-lines execution log.
    pub history_dir: PathBuf,
    /// Keep artifacts after an execution completes (audit).
    pub retain_artifacts: bool,
    /// Timeout applied to actions that declare none.
    pub action_timeout: Option<Duration>,
    /// Scratch directory for shell actions.
    pub work_dir: Option<PathBuf>,
    /// Command run by provision actions (`$STACK` names the stack).
    pub provisioner: Option<String>,
    /// Defaults for every rollout.
    pub rollout: RolloutPolicy,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            history_dir: PathBuf::from(".conveyor/history"),
            retain_artifacts: false,
            action_timeout: None,
            work_dir: None,
            provisioner: None,
            rollout: RolloutPolicy::default(),
        }
    }
}

/// Parse system configuration from KDL text containing an `engine` block.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    match doc.nodes().iter().find(|n| n.name().value() == "engine") {
        Some(node) => parse_engine(node),
        None => Ok(SystemConfig::default()),
    }
}

pub(crate) fn parse_engine(node: &KdlNode) -> ConfigResult<SystemConfig> {
    let mut config = SystemConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value();
            match key {
                "history-dir" => {
                    config.history_dir = first_string_arg(child)
                        .map(PathBuf::from)
                        .ok_or_else(|| ConfigError::MissingField(key.to_string()))?;
                }
                "work-dir" => config.work_dir = first_string_arg(child).map(PathBuf::from),
                "retain-artifacts" => config.retain_artifacts = bool_arg(child, key)?,
                "action-timeout-secs" => config.action_timeout = Some(secs_arg(child, key)?),
                "provisioner" => config.provisioner = first_string_arg(child),
                "deployment-timeout-secs" => {
                    config.rollout.deployment_timeout = secs_arg(child, key)?
                }
                "poll-interval-ms" => {
                    config.rollout.poll_interval = Duration::from_millis(u64_arg(child, key)?)
                }
                "failure-threshold" => {
                    config.rollout.failure_threshold = Some(u32_arg(child, key)?)
                }
                other => {
                    return Err(ConfigError::invalid(
                        "engine",
                        format!("unknown setting '{}'", other),
                    ));
                }
            }
        }
    }

    if config.rollout.poll_interval.is_zero() {
        return Err(ConfigError::invalid(
            "poll-interval-ms",
            "must be greater than zero",
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_engine_block() {
        let config = parse_system_config(r#"pipeline "p""#).unwrap();
        assert_eq!(config, SystemConfig::default());
    }

    #[test]
    fn test_parse_engine_block() {
        let config = parse_system_config(
            r#"
            engine {
                history-dir "/var/lib/conveyor"
                retain-artifacts #true
                action-timeout-secs 1800
                poll-interval-ms 250
                failure-threshold 3
                provisioner "./infra/apply.sh"
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.history_dir, PathBuf::from("/var/lib/conveyor"));
        assert!(config.retain_artifacts);
        assert_eq!(config.action_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(config.rollout.poll_interval, Duration::from_millis(250));
        assert_eq!(config.rollout.failure_threshold, Some(3));
        assert_eq!(config.provisioner.as_deref(), Some("./infra/apply.sh"));
    }

    #[test]
    fn test_unknown_setting_is_rejected() {
        let err = parse_system_config(r#"engine { turbo "yes" }"#).unwrap_err();
        assert!(err.to_string().contains("turbo"));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        assert!(parse_system_config(r#"engine { poll-interval-ms 0 }"#).is_err());
    }
}
