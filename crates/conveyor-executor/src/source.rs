//! Source snapshot fetching.

use async_trait::async_trait;
use bytes::Bytes;
use conveyor_core::executor::{ActionEnv, ActionOutput, ActionRunner, Blobs};
use conveyor_core::pipeline::{Action, Operation};
use conveyor_core::source::SourceProvider;
use conveyor_core::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

use crate::runner::action_failure;

/// Snapshots local git repositories with `git archive`.
///
/// Repositories are resolved relative to `base_dir`; the revision may be a
/// branch, tag, or commit.
pub struct GitSource {
    git_bin: String,
    base_dir: PathBuf,
}

impl Default for GitSource {
    fn default() -> Self {
        Self::new()
    }
}

impl GitSource {
    pub fn new() -> Self {
        let git_bin = std::env::var("CONVEYOR_GIT_BIN").unwrap_or_else(|_| "git".to_string());
        Self {
            git_bin,
            base_dir: PathBuf::from("."),
        }
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    async fn fetch(&self, repository: &str, branch: &str) -> Result<Bytes> {
        let repo_path = self.base_dir.join(repository);
        info!(repo = %repo_path.display(), revision = %branch, "Archiving repository");

        let output = Command::new(&self.git_bin)
            .arg("-C")
            .arg(&repo_path)
            .args(["archive", "--format=tar", branch])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            warn!(repo = %repo_path.display(), "git archive failed");
            return Err(Error::ActionFailed {
                action: format!("fetch {}", repository),
                exit_code: output.status.code(),
                message: format!("could not archive '{}' at '{}'", repository, branch),
                diagnostics: stderr,
            });
        }

        Ok(Bytes::from(output.stdout))
    }
}

/// Fixed snapshots keyed by repository and branch.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    snapshots: HashMap<(String, String), Bytes>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(
        mut self,
        repository: impl Into<String>,
        branch: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.snapshots
            .insert((repository.into(), branch.into()), data.into());
        self
    }
}

#[async_trait]
impl SourceProvider for MemorySource {
    async fn fetch(&self, repository: &str, branch: &str) -> Result<Bytes> {
        self.snapshots
            .get(&(repository.to_string(), branch.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("no snapshot of '{}' at '{}'", repository, branch))
            })
    }
}

/// Serves `source` actions from a [`SourceProvider`].
pub struct SourceRunner {
    provider: Arc<dyn SourceProvider>,
}

impl SourceRunner {
    pub fn new(provider: impl SourceProvider + 'static) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    pub fn from_arc(provider: Arc<dyn SourceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ActionRunner for SourceRunner {
    fn name(&self) -> &'static str {
        "source"
    }

    fn supports(&self, operation: &Operation) -> bool {
        matches!(operation, Operation::SourceFetch { .. })
    }

    async fn run(&self, action: &Action, _inputs: &Blobs, _env: &ActionEnv) -> Result<ActionOutput> {
        let Operation::SourceFetch { repository, branch } = &action.operation else {
            return Err(Error::InvalidInput(format!(
                "source runner cannot execute {} operations",
                action.operation.kind()
            )));
        };
        let output_name = action.outputs.first().ok_or_else(|| {
            Error::InvalidInput(format!("source action '{}' declares no output", action.name))
        })?;

        let snapshot = self
            .provider
            .fetch(repository, branch)
            .await
            .map_err(|e| action_failure(action, e))?;

        Ok(ActionOutput::default()
            .with_diagnostics(format!(
                "fetched {} bytes from {}@{}",
                snapshot.len(),
                repository,
                branch
            ))
            .with_output(output_name.clone(), snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_action(branch: &str) -> Action {
        Action::new(
            "checkout",
            Operation::SourceFetch {
                repository: "app".to_string(),
                branch: branch.to_string(),
            },
        )
        .output("SourceOutput")
    }

    #[tokio::test]
    async fn test_fetches_snapshot_into_declared_output() {
        let runner = SourceRunner::new(MemorySource::new().with_snapshot("app", "main", "tree"));
        let out = runner
            .run(&fetch_action("main"), &Blobs::new(), &ActionEnv::new("web", "Source"))
            .await
            .unwrap();
        assert_eq!(out.outputs["SourceOutput"], Bytes::from_static(b"tree"));
        assert!(out.diagnostics.contains("app@main"));
    }

    #[tokio::test]
    async fn test_unknown_branch_is_action_failure() {
        let runner = SourceRunner::new(MemorySource::new());
        let err = runner
            .run(&fetch_action("dev"), &Blobs::new(), &ActionEnv::new("web", "Source"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "action_failed");
        assert!(err.to_string().contains("checkout"));
    }

    #[test]
    fn test_supports_only_source_fetch() {
        let runner = SourceRunner::new(MemorySource::new());
        assert!(runner.supports(&fetch_action("main").operation));
        assert!(!runner.supports(&Operation::Run { commands: vec![] }));
    }
}
