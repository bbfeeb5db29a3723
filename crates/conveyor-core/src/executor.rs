//! Action runner trait and its inputs/outputs.
//!
//! Runners execute one unit of work. The engine only observes success or
//! failure and the declared outputs; whatever the work does externally
//! (network calls, image pushes) is opaque.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

use crate::Result;
use crate::id::ExecutionId;
use crate::pipeline::{Action, Operation};
use crate::secret::SecretValue;

/// Named blobs handed to or produced by an action.
pub type Blobs = BTreeMap<String, Bytes>;

/// Environment an action runs with.
#[derive(Debug, Clone, Default)]
pub struct ActionEnv {
    pub execution_id: Option<ExecutionId>,
    pub pipeline: String,
    pub stage: String,
    /// Configuration values, already interpolated.
    pub vars: BTreeMap<String, String>,
    /// Resolved secrets keyed by the environment variable they are exposed as.
    pub secrets: BTreeMap<String, SecretValue>,
}

impl ActionEnv {
    pub fn new(pipeline: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            stage: stage.into(),
            ..Default::default()
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: SecretValue) -> Self {
        self.secrets.insert(key.into(), value);
        self
    }

    /// Replace every secret value occurring in `text` with `***`.
    pub fn mask(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for secret in self.secrets.values() {
            let value = secret.expose();
            if !value.is_empty() {
                masked = masked.replace(value, "***");
            }
        }
        masked
    }
}

/// What a successful action hands back.
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    pub outputs: Blobs,
    /// Captured output for the execution record.
    pub diagnostics: String,
}

impl ActionOutput {
    pub fn with_output(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.outputs.insert(name.into(), data.into());
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: impl Into<String>) -> Self {
        self.diagnostics = diagnostics.into();
        self
    }
}

/// Trait for action runners.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Name of this runner.
    fn name(&self) -> &'static str;

    /// Check if this runner can execute the given operation.
    fn supports(&self, operation: &Operation) -> bool;

    /// Execute the action. Inputs are borrowed and never mutated.
    async fn run(&self, action: &Action, inputs: &Blobs, env: &ActionEnv) -> Result<ActionOutput>;
}
