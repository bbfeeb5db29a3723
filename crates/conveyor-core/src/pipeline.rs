//! Pipeline, stage and action definitions, and execution records.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use crate::artifact::ArtifactRef;
use crate::id::{ExecutionId, PipelineId};
use crate::source::SourceChanged;
use crate::{Error, Result};

/// A delivery pipeline definition.
///
/// Topology is data: every pipeline variant is a different list of stages,
/// built either with [`Pipeline::builder`] or parsed from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Unique identifier.
    pub id: PipelineId,
    /// Pipeline name (e.g., "web-service").
    pub name: String,
    /// Triggers that can start this pipeline.
    pub triggers: Vec<Trigger>,
    /// Stages, executed strictly in order.
    pub stages: Vec<Stage>,
    /// Environment shared by every action.
    pub env: BTreeMap<String, String>,
}

/// What may start an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Started by hand (CLI, API, retry).
    Manual,
    /// Started by a source-change notification on one of the branches.
    /// An empty list or `*` matches every branch.
    SourceChange {
        repository: Option<String>,
        branches: Vec<String>,
    },
}

/// A barrier-synchronized group of independent actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}

/// One unit of work inside a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    /// Artifact names consumed, in declaration order.
    pub inputs: Vec<String>,
    /// Artifact names this action promises to produce.
    pub outputs: Vec<String>,
    pub operation: Operation,
    /// Plain configuration values.
    pub env: BTreeMap<String, String>,
    /// Environment variable name -> secret name. Values are resolved at run time.
    pub secrets: BTreeMap<String, String>,
    /// Per-action timeout; expiry is an action failure.
    pub timeout: Option<Duration>,
}

impl Action {
    pub fn new(name: impl Into<String>, operation: Operation) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            operation,
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn secret(mut self, var: impl Into<String>, secret_name: impl Into<String>) -> Self {
        self.secrets.insert(var.into(), secret_name.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What an action does. The engine treats every operation as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Run shell commands (tests, builds, scripts).
    Run { commands: Vec<String> },
    /// Fetch a source snapshot.
    SourceFetch { repository: String, branch: String },
    /// Build and push a container image from the input artifact.
    /// Produces an image manifest.
    ImageBuild {
        repository: String,
        tag: String,
        container: String,
    },
    /// Apply declared infrastructure; produces the structured output map.
    Provision {
        stack: String,
        parameters: BTreeMap<String, String>,
    },
    /// Roll the service onto the image from the input manifest.
    Deploy {
        service: String,
        container: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[display("run")]
    Run,
    #[display("source_fetch")]
    SourceFetch,
    #[display("image_build")]
    ImageBuild,
    #[display("provision")]
    Provision,
    #[display("deploy")]
    Deploy,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Run { .. } => OperationKind::Run,
            Operation::SourceFetch { .. } => OperationKind::SourceFetch,
            Operation::ImageBuild { .. } => OperationKind::ImageBuild,
            Operation::Provision { .. } => OperationKind::Provision,
            Operation::Deploy { .. } => OperationKind::Deploy,
        }
    }
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The stage index and action that produce an artifact.
    pub fn producer_of(&self, artifact: &str) -> Option<(usize, &Action)> {
        self.stages.iter().enumerate().find_map(|(idx, stage)| {
            stage
                .actions
                .iter()
                .find(|a| a.outputs.iter().any(|o| o == artifact))
                .map(|a| (idx, a))
        })
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.stages.iter().flat_map(|s| s.actions.iter())
    }

    /// Whether a source-change notification should start this pipeline.
    pub fn watches(&self, event: &SourceChanged) -> bool {
        self.triggers.iter().any(|trigger| match trigger {
            Trigger::Manual => false,
            Trigger::SourceChange {
                repository,
                branches,
            } => {
                let repo_matches = repository
                    .as_deref()
                    .is_none_or(|r| r == event.repository);
                let branch_matches = branches.is_empty()
                    || branches.iter().any(|b| b == "*" || *b == event.branch);
                repo_matches && branch_matches
            }
        })
    }

    /// Check the wiring invariants: unique names, every input produced by an
    /// earlier stage, no intra-stage dependency, and per-operation shapes.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("pipeline name must not be empty"));
        }
        if self.stages.is_empty() {
            return Err(invalid(format!("pipeline '{}' has no stages", self.name)));
        }

        let mut stage_names = HashSet::new();
        // artifact name -> (stage index, producing operation)
        let mut produced: HashMap<&str, (usize, OperationKind)> = HashMap::new();

        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(invalid(format!("stage #{} has an empty name", idx + 1)));
            }
            if !stage_names.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage '{}'", stage.name)));
            }
            if stage.actions.is_empty() {
                return Err(invalid(format!("stage '{}' has no actions", stage.name)));
            }

            let mut action_names = HashSet::new();
            for action in &stage.actions {
                if !action_names.insert(action.name.as_str()) {
                    return Err(invalid(format!(
                        "duplicate action '{}' in stage '{}'",
                        action.name, stage.name
                    )));
                }
                for output in &action.outputs {
                    if !is_valid_artifact_name(output) {
                        return Err(invalid(format!(
                            "action '{}' declares invalid artifact name '{}'",
                            action.name, output
                        )));
                    }
                    if produced.contains_key(output.as_str()) {
                        return Err(invalid(format!(
                            "artifact '{}' is produced more than once",
                            output
                        )));
                    }
                    produced.insert(output.as_str(), (idx, action.operation.kind()));
                }
            }

            for action in &stage.actions {
                for input in &action.inputs {
                    match produced.get(input.as_str()) {
                        Some((producer, _)) if *producer < idx => {}
                        Some(_) => {
                            return Err(invalid(format!(
                                "action '{}' in stage '{}' depends on '{}' produced by a sibling action",
                                action.name, stage.name, input
                            )));
                        }
                        None => {
                            return Err(invalid(format!(
                                "action '{}' in stage '{}' declares input '{}' that no earlier stage produces",
                                action.name, stage.name, input
                            )));
                        }
                    }
                }
                validate_shape(stage, action, &produced)?;
            }
        }

        Ok(())
    }
}

fn validate_shape(
    stage: &Stage,
    action: &Action,
    produced: &HashMap<&str, (usize, OperationKind)>,
) -> Result<()> {
    let at = || format!("action '{}' in stage '{}'", action.name, stage.name);
    match &action.operation {
        Operation::SourceFetch { .. } => {
            if !action.inputs.is_empty() || action.outputs.len() != 1 {
                return Err(invalid(format!(
                    "{}: source fetch takes no inputs and produces exactly one output",
                    at()
                )));
            }
        }
        Operation::ImageBuild { .. } => {
            if action.inputs.len() != 1 || action.outputs.len() != 1 {
                return Err(invalid(format!(
                    "{}: image build consumes one input and produces one image manifest",
                    at()
                )));
            }
        }
        Operation::Provision { .. } => {
            if action.outputs.len() > 1 {
                return Err(invalid(format!(
                    "{}: provisioning produces at most one output map",
                    at()
                )));
            }
        }
        Operation::Deploy { .. } => {
            if action.inputs.len() != 1 || !action.outputs.is_empty() {
                return Err(invalid(format!(
                    "{}: deploy consumes exactly one image manifest and produces nothing",
                    at()
                )));
            }
            let input = &action.inputs[0];
            match produced.get(input.as_str()) {
                Some((_, OperationKind::ImageBuild)) => {}
                _ => {
                    return Err(invalid(format!(
                        "{}: deploy input '{}' must be the manifest produced by an image build",
                        at(),
                        input
                    )));
                }
            }
        }
        Operation::Run { commands } => {
            if commands.is_empty() {
                return Err(invalid(format!("{}: no commands to run", at())));
            }
        }
    }
    Ok(())
}

/// Artifact names double as file names for shell actions.
fn is_valid_artifact_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidPipeline(message.into())
}

/// Builder replacing hand-duplicated pipeline variants.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    triggers: Vec<Trigger>,
    stages: Vec<Stage>,
    env: BTreeMap<String, String>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            stages: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Validate the wiring and produce the pipeline.
    pub fn build(self) -> Result<Pipeline> {
        let triggers = if self.triggers.is_empty() {
            vec![Trigger::Manual]
        } else {
            self.triggers
        };
        let pipeline = Pipeline {
            id: PipelineId::for_name(&self.name),
            name: self.name,
            triggers,
            stages: self.stages,
            env: self.env,
        };
        pipeline.validate()?;
        Ok(pipeline)
    }
}

/// Why an execution was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCause {
    Manual {
        actor: Option<String>,
    },
    SourceChange {
        repository: String,
        branch: String,
        commit: String,
    },
    Retry {
        original: ExecutionId,
    },
}

impl TriggerCause {
    pub fn label(&self) -> &'static str {
        match self {
            TriggerCause::Manual { .. } => "manual",
            TriggerCause::SourceChange { .. } => "source_change",
            TriggerCause::Retry { .. } => "retry",
        }
    }
}

/// Overall execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Queued behind another execution, or not yet picked up.
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
    #[display("cancelled")]
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Status of a stage within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
    /// Never started because an earlier stage failed.
    #[display("skipped")]
    Skipped,
    /// Never started because the execution was cancelled.
    #[display("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
}

/// Outcome of one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub name: String,
    pub status: ActionStatus,
    pub exit_code: Option<i32>,
    /// Captured output, verbatim (secrets masked).
    pub diagnostics: String,
    /// Artifact names written.
    pub outputs: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One failed action, as surfaced in a stage failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub action: String,
    /// Error variant name, e.g. `action_failed` or `missing_input`.
    pub kind: String,
    pub message: String,
    pub exit_code: Option<i32>,
    pub diagnostics: String,
}

impl ActionFailure {
    pub fn from_error(action: impl Into<String>, error: &Error) -> Self {
        Self {
            action: action.into(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            exit_code: error.exit_code(),
            diagnostics: error.diagnostics().unwrap_or_default().to_string(),
        }
    }
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub actions: Vec<ActionResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Why an execution ended in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub stage: String,
    /// The first failing action, when the failure is attributable to one.
    pub action: Option<String>,
    pub message: String,
    pub failures: Vec<ActionFailure>,
}

/// One run of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    /// Run number (incrementing per pipeline).
    pub number: u64,
    pub trigger: TriggerCause,
    pub status: ExecutionStatus,
    pub stages: Vec<StageResult>,
    pub failure: Option<FailureReport>,
    /// Every artifact written during the run.
    pub artifacts: Vec<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(pipeline: &Pipeline, number: u64, trigger: TriggerCause) -> Self {
        Self {
            id: ExecutionId::new(),
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            number,
            trigger,
            status: ExecutionStatus::Pending,
            stages: pipeline
                .stages
                .iter()
                .map(|s| StageResult {
                    name: s.name.clone(),
                    status: StageStatus::Pending,
                    actions: Vec::new(),
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            failure: None,
            artifacts: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn failed_stage(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.stage.as_str())
    }

    /// The commit this run builds, when it was started by a source change.
    pub fn source_commit(&self) -> Option<&str> {
        match &self.trigger {
            TriggerCause::SourceChange { commit, .. } => Some(commit),
            _ => None,
        }
    }

    pub fn artifact(&self, name: &str) -> Option<&ArtifactRef> {
        self.artifacts.iter().find(|a| a.key.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Stage {
        Stage::new("Source").action(
            Action::new(
                "checkout",
                Operation::SourceFetch {
                    repository: "app".to_string(),
                    branch: "main".to_string(),
                },
            )
            .output("SourceOutput"),
        )
    }

    fn run(name: &str) -> Action {
        Action::new(
            name,
            Operation::Run {
                commands: vec!["true".to_string()],
            },
        )
    }

    fn build() -> Stage {
        Stage::new("Build").action(
            Action::new(
                "image",
                Operation::ImageBuild {
                    repository: "app".to_string(),
                    tag: "latest".to_string(),
                    container: "web".to_string(),
                },
            )
            .input("SourceOutput")
            .output("BuildOutput"),
        )
    }

    fn deploy(input: &str) -> Stage {
        Stage::new("Deploy").action(
            Action::new(
                "rollout",
                Operation::Deploy {
                    service: "web".to_string(),
                    container: None,
                },
            )
            .input(input),
        )
    }

    #[test]
    fn test_build_valid_pipeline() {
        let pipeline = Pipeline::builder("web")
            .stage(source())
            .stage(Stage::new("Test").action(run("unit").input("SourceOutput")))
            .stage(build())
            .stage(deploy("BuildOutput"))
            .build()
            .unwrap();

        assert_eq!(pipeline.stages.len(), 4);
        assert_eq!(pipeline.triggers, vec![Trigger::Manual]);
        let (idx, action) = pipeline.producer_of("BuildOutput").unwrap();
        assert_eq!(idx, 2);
        assert_eq!(action.name, "image");
    }

    #[test]
    fn test_reject_input_from_later_stage() {
        let result = Pipeline::builder("web")
            .stage(Stage::new("Test").action(run("unit").input("SourceOutput")))
            .stage(source())
            .build();
        let err = result.unwrap_err();
        assert!(matches!(err, Error::InvalidPipeline(_)));
        assert!(err.to_string().contains("no earlier stage produces"));
    }

    #[test]
    fn test_reject_intra_stage_dependency() {
        let result = Pipeline::builder("web")
            .stage(
                Stage::new("Mixed")
                    .action(run("produce").output("Report"))
                    .action(run("consume").input("Report")),
            )
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("sibling"));
    }

    #[test]
    fn test_reject_deploy_of_source_artifact() {
        let result = Pipeline::builder("web")
            .stage(source())
            .stage(build())
            .stage(deploy("SourceOutput"))
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("must be the manifest produced by an image build"));
    }

    #[test]
    fn test_reject_duplicate_outputs_and_stages() {
        let dup_output = Pipeline::builder("web")
            .stage(source())
            .stage(Stage::new("Again").action(run("x").output("SourceOutput")))
            .build();
        assert!(dup_output.is_err());

        let dup_stage = Pipeline::builder("web")
            .stage(source())
            .stage(Stage::new("Source").action(run("x")))
            .build();
        assert!(dup_stage.unwrap_err().to_string().contains("duplicate stage"));
    }

    #[test]
    fn test_reject_path_like_artifact_name() {
        let result = Pipeline::builder("web")
            .stage(Stage::new("Build").action(run("x").output("../escape")))
            .build();
        assert!(result.unwrap_err().to_string().contains("invalid artifact name"));
    }

    #[test]
    fn test_reject_empty_pipeline() {
        assert!(Pipeline::builder("web").build().is_err());
        assert!(
            Pipeline::builder("web")
                .stage(Stage::new("Empty"))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_watches_branch_filter() {
        let pipeline = Pipeline::builder("web")
            .trigger(Trigger::SourceChange {
                repository: None,
                branches: vec!["main".to_string()],
            })
            .stage(source())
            .build()
            .unwrap();

        let event = |branch: &str| SourceChanged {
            repository: "app".to_string(),
            branch: branch.to_string(),
            commit: "abc123".to_string(),
        };
        assert!(pipeline.watches(&event("main")));
        assert!(!pipeline.watches(&event("feature/x")));
    }

    #[test]
    fn test_manual_only_pipeline_ignores_source_changes() {
        let pipeline = Pipeline::builder("web").stage(source()).build().unwrap();
        let event = SourceChanged {
            repository: "app".to_string(),
            branch: "main".to_string(),
            commit: "abc123".to_string(),
        };
        assert!(!pipeline.watches(&event));
    }

    #[test]
    fn test_new_execution_is_pending() {
        let pipeline = Pipeline::builder("web").stage(source()).build().unwrap();
        let execution = Execution::new(&pipeline, 1, TriggerCause::Manual { actor: None });
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.stages.len(), 1);
        assert_eq!(execution.stages[0].status, StageStatus::Pending);
        assert!(execution.failed_stage().is_none());
    }
}
