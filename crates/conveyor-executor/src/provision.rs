//! Infrastructure provisioning.

use async_trait::async_trait;
use conveyor_core::executor::{ActionEnv, ActionOutput, ActionRunner, Blobs};
use conveyor_core::pipeline::{Action, Operation};
use conveyor_core::provision::{ProvisionOutput, Provisioner};
use conveyor_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

use crate::runner::action_failure;

/// Runs an external tool to apply a stack.
///
/// The command gets `STACK` plus one `PARAM_<NAME>` variable per parameter
/// and must print the stack outputs as a JSON object on stdout.
pub struct CommandProvisioner {
    shell: String,
    command: String,
}

impl CommandProvisioner {
    pub fn new(command: impl Into<String>) -> Self {
        let shell = std::env::var("CONVEYOR_SHELL").unwrap_or_else(|_| "sh".to_string());
        Self {
            shell,
            command: command.into(),
        }
    }

    fn param_var(name: &str) -> String {
        let name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("PARAM_{}", name)
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn apply(
        &self,
        stack: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<ProvisionOutput> {
        info!(stack = %stack, command = %self.command, "Applying stack");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&self.command)
            .env("STACK", stack)
            .envs(parameters.iter().map(|(k, v)| (Self::param_var(k), v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(Error::ActionFailed {
                action: format!("provision {}", stack),
                exit_code: output.status.code(),
                message: format!("provisioning of stack '{}' failed", stack),
                diagnostics: format!("{}\n{}", stdout, stderr),
            });
        }

        if stdout.trim().is_empty() {
            return Ok(ProvisionOutput::default());
        }
        serde_json::from_str(stdout.trim()).map_err(|e| Error::ActionFailed {
            action: format!("provision {}", stack),
            exit_code: None,
            message: format!("stack outputs are not a JSON object: {}", e),
            diagnostics: stdout.to_string(),
        })
    }
}

/// Answers every apply with preconfigured outputs.
#[derive(Debug, Clone, Default)]
pub struct StaticProvisioner {
    stacks: HashMap<String, ProvisionOutput>,
}

impl StaticProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack(mut self, stack: impl Into<String>, output: ProvisionOutput) -> Self {
        self.stacks.insert(stack.into(), output);
        self
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn apply(
        &self,
        stack: &str,
        _parameters: &BTreeMap<String, String>,
    ) -> Result<ProvisionOutput> {
        Ok(self.stacks.get(stack).cloned().unwrap_or_default())
    }
}

/// Serves `provision` actions from a [`Provisioner`].
pub struct ProvisionRunner {
    provisioner: Arc<dyn Provisioner>,
}

impl ProvisionRunner {
    pub fn new(provisioner: impl Provisioner + 'static) -> Self {
        Self {
            provisioner: Arc::new(provisioner),
        }
    }
}

#[async_trait]
impl ActionRunner for ProvisionRunner {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn supports(&self, operation: &Operation) -> bool {
        matches!(operation, Operation::Provision { .. })
    }

    async fn run(&self, action: &Action, _inputs: &Blobs, _env: &ActionEnv) -> Result<ActionOutput> {
        let Operation::Provision { stack, parameters } = &action.operation else {
            return Err(Error::InvalidInput(format!(
                "provision runner cannot execute {} operations",
                action.operation.kind()
            )));
        };

        let applied = self
            .provisioner
            .apply(stack, parameters)
            .await
            .map_err(|e| action_failure(action, e))?;
        debug!(stack = %stack, outputs = applied.values.len(), "Stack applied");

        let mut output = ActionOutput::default().with_diagnostics(format!(
            "applied stack '{}' ({} outputs)",
            stack,
            applied.values.len()
        ));
        if let Some(name) = action.outputs.first() {
            output = output.with_output(name.clone(), serde_json::to_vec(&applied)?);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provision_action(stack: &str) -> Action {
        let mut parameters = BTreeMap::new();
        parameters.insert("region".to_string(), "eu-west-1".to_string());
        parameters.insert("db-size".to_string(), "small".to_string());
        Action::new(
            "infra",
            Operation::Provision {
                stack: stack.to_string(),
                parameters,
            },
        )
        .output("InfraOutput")
    }

    #[tokio::test]
    async fn test_command_provisioner_parses_outputs() {
        let provisioner = CommandProvisioner::new(
            r#"printf '{"stack":"%s","region":"%s","size":"%s"}' "$STACK" "$PARAM_REGION" "$PARAM_DB_SIZE""#,
        );
        let runner = ProvisionRunner::new(provisioner);
        let out = runner
            .run(&provision_action("network"), &Blobs::new(), &ActionEnv::new("web", "Infra"))
            .await
            .unwrap();

        let values: ProvisionOutput = serde_json::from_slice(&out.outputs["InfraOutput"]).unwrap();
        assert_eq!(values.values["stack"], json!("network"));
        assert_eq!(values.values["region"], json!("eu-west-1"));
        assert_eq!(values.values["size"], json!("small"));
    }

    #[tokio::test]
    async fn test_command_failure_is_attributed_to_action() {
        let runner = ProvisionRunner::new(CommandProvisioner::new("echo quota exceeded >&2; exit 4"));
        let err = runner
            .run(&provision_action("db"), &Blobs::new(), &ActionEnv::new("web", "Infra"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(4));
        assert!(err.to_string().contains("'infra'"));
        assert!(err.diagnostics().unwrap().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_static_provisioner() {
        let mut output = ProvisionOutput::default();
        output.values.insert("endpoint".to_string(), json!("db.internal:5432"));
        let runner = ProvisionRunner::new(StaticProvisioner::new().with_stack("db", output.clone()));

        let out = runner
            .run(&provision_action("db"), &Blobs::new(), &ActionEnv::new("web", "Infra"))
            .await
            .unwrap();
        let values: ProvisionOutput = serde_json::from_slice(&out.outputs["InfraOutput"]).unwrap();
        assert_eq!(values, output);
    }
}
