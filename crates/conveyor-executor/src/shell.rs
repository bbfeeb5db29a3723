//! Shell command runner.

use async_trait::async_trait;
use conveyor_core::executor::{ActionEnv, ActionOutput, ActionRunner, Blobs};
use conveyor_core::pipeline::{Action, Operation};
use conveyor_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runs `run` actions through a shell in a scratch workspace.
///
/// Inputs are written to `$CONVEYOR_INPUTS/<name>` before the commands run;
/// each declared output is read back from `$CONVEYOR_OUTPUTS/<name>`.
pub struct ShellRunner {
    /// Path to the shell binary
    shell: String,
    /// Directory holding per-action workspaces
    work_root: PathBuf,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    pub fn new() -> Self {
        let shell = std::env::var("CONVEYOR_SHELL").unwrap_or_else(|_| "sh".to_string());
        Self {
            shell,
            work_root: std::env::temp_dir().join("conveyor"),
        }
    }

    pub fn with_work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
        self.work_root = work_root.into();
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    async fn run_in(
        &self,
        workspace: &Path,
        action: &Action,
        commands: &[String],
        inputs: &Blobs,
        env: &ActionEnv,
    ) -> Result<ActionOutput> {
        let inputs_dir = workspace.join("inputs");
        let outputs_dir = workspace.join("outputs");
        tokio::fs::create_dir_all(&inputs_dir).await?;
        tokio::fs::create_dir_all(&outputs_dir).await?;

        for (name, data) in inputs {
            tokio::fs::write(inputs_dir.join(name), data).await?;
        }

        let script = commands.join(" && ");
        debug!(action = %action.name, script = %env.mask(&script), "Spawning shell");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&script)
            .current_dir(workspace)
            .envs(&env.vars)
            .envs(env.secrets.iter().map(|(k, v)| (k, v.expose())))
            .env("CONVEYOR_INPUTS", &inputs_dir)
            .env("CONVEYOR_OUTPUTS", &outputs_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{}\n{}", stdout, stderr)
        };

        if !output.status.success() {
            return Err(Error::ActionFailed {
                action: action.name.clone(),
                exit_code: output.status.code(),
                message: "command exited unsuccessfully".to_string(),
                diagnostics: combined,
            });
        }

        let mut result = ActionOutput::default().with_diagnostics(combined);
        for name in &action.outputs {
            match tokio::fs::read(outputs_dir.join(name)).await {
                Ok(data) => result = result.with_output(name.clone(), data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl ActionRunner for ShellRunner {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn supports(&self, operation: &Operation) -> bool {
        matches!(operation, Operation::Run { .. })
    }

    async fn run(&self, action: &Action, inputs: &Blobs, env: &ActionEnv) -> Result<ActionOutput> {
        let Operation::Run { commands } = &action.operation else {
            return Err(Error::InvalidInput(format!(
                "shell runner cannot execute {} operations",
                action.operation.kind()
            )));
        };

        let workspace = Workspace(self.work_root.join(Uuid::new_v4().simple().to_string()));
        info!(action = %action.name, dir = %workspace.0.display(), "Running shell action");
        self.run_in(&workspace.0, action, commands, inputs, env).await
    }
}

/// Scratch directory removed when the run ends, including on timeout.
struct Workspace(PathBuf);

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.0.display(), error = %e, "Failed to remove workspace");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::execute;
    use bytes::Bytes;
    use conveyor_core::secret::SecretValue;
    use std::time::Duration;

    fn shell(name: &str, commands: &[&str]) -> Action {
        Action::new(
            name,
            Operation::Run {
                commands: commands.iter().map(|c| c.to_string()).collect(),
            },
        )
    }

    fn runner(dir: &tempfile::TempDir) -> ShellRunner {
        ShellRunner::new().with_shell("sh").with_work_root(dir.path())
    }

    #[tokio::test]
    async fn test_reads_inputs_and_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let action = shell(
            "build",
            &["tr a-z A-Z < \"$CONVEYOR_INPUTS/Source\" > \"$CONVEYOR_OUTPUTS/Binary\""],
        )
        .input("Source")
        .output("Binary");
        let mut inputs = Blobs::new();
        inputs.insert("Source".to_string(), Bytes::from_static(b"hello"));

        let out = runner(&dir)
            .run(&action, &inputs, &ActionEnv::new("web", "Build"))
            .await
            .unwrap();
        assert_eq!(out.outputs["Binary"], Bytes::from_static(b"HELLO"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure_with_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let action = shell("unit-tests", &["echo '3 passed, 1 failed'", "exit 3"]);
        let err = runner(&dir)
            .run(&action, &Blobs::new(), &ActionEnv::new("web", "Test"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.diagnostics().unwrap().contains("1 failed"));
    }

    #[tokio::test]
    async fn test_commands_stop_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let action = shell("steps", &["false", "echo after > \"$CONVEYOR_OUTPUTS/Out\""]).output("Out");
        let err = runner(&dir)
            .run(&action, &Blobs::new(), &ActionEnv::new("web", "Build"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn test_env_and_secrets_are_exposed() {
        let dir = tempfile::tempdir().unwrap();
        let action = shell(
            "publish",
            &["printf '%s:%s' \"$REGION\" \"$TOKEN\" > \"$CONVEYOR_OUTPUTS/Out\"", "echo \"$TOKEN\""],
        )
        .output("Out");
        let env = ActionEnv::new("web", "Publish")
            .with_var("REGION", "eu-west-1")
            .with_secret("TOKEN", SecretValue::new("s3cr3t"));

        let out = execute(&runner(&dir), &action, &Blobs::new(), &env, None)
            .await
            .unwrap();
        assert_eq!(out.outputs["Out"], Bytes::from_static(b"eu-west-1:s3cr3t"));
        assert!(!out.diagnostics.contains("s3cr3t"));
        assert!(out.diagnostics.contains("***"));
    }

    #[tokio::test]
    async fn test_missing_output_file_fails_contract() {
        let dir = tempfile::tempdir().unwrap();
        let action = shell("build", &["true"]).output("Binary");
        let err = execute(
            &runner(&dir),
            &action,
            &Blobs::new(),
            &ActionEnv::new("web", "Build"),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("did not produce declared output"));
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let action = shell("hang", &["sleep 10"]).timeout(Duration::from_millis(200));
        let err = execute(
            &runner(&dir),
            &action,
            &Blobs::new(),
            &ActionEnv::new("web", "Test"),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
