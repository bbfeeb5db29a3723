//! Execution of one stage.
//!
//! Inputs of every action are resolved before anything is dispatched. The
//! actions then run as concurrent tasks and the stage waits for all of them,
//! so a failing action never cuts short the diagnostics of its siblings.

use chrono::{DateTime, Utc};
use conveyor_config::VariableContext;
use conveyor_core::artifact::{ArtifactKey, ArtifactRef, ArtifactStore};
use conveyor_core::executor::{ActionEnv, ActionOutput, Blobs};
use conveyor_core::pipeline::{
    Action, ActionFailure, ActionResult, ActionStatus, Operation, Pipeline, Stage, StageResult,
    StageStatus,
};
use conveyor_core::secret::SecretStore;
use conveyor_core::{Error, ExecutionId, Result};
use conveyor_executor::RunnerSet;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::event::PipelineEvent;

/// Everything a stage needs from its execution.
pub struct StageRun<'a> {
    pub execution_id: ExecutionId,
    pub pipeline: &'a Pipeline,
    pub stage: &'a Stage,
    /// Artifacts published by earlier stages of this execution, by name.
    pub visible: &'a BTreeMap<String, ArtifactRef>,
    /// Variable context, already entered into this stage.
    pub vars: &'a VariableContext,
    pub runners: &'a RunnerSet,
    pub store: &'a Arc<dyn ArtifactStore>,
    pub secrets: &'a Arc<dyn SecretStore>,
    pub default_timeout: Option<Duration>,
    pub events: &'a broadcast::Sender<PipelineEvent>,
}

/// How a stage ended.
#[derive(Debug)]
pub struct StageOutcome {
    pub result: StageResult,
    /// Every artifact written, including those of successful siblings in a
    /// failed stage.
    pub produced: Vec<ArtifactRef>,
    /// `MissingInput` when the stage could not start, `StageFailed` when
    /// actions failed.
    pub error: Option<Error>,
}

impl StageRun<'_> {
    pub async fn run(self) -> StageOutcome {
        let started_at = Utc::now();
        info!(stage = %self.stage.name, actions = self.stage.actions.len(), "Starting stage");

        let inputs = match self.resolve_inputs().await {
            Ok(inputs) => inputs,
            Err(e) => {
                error!(stage = %self.stage.name, error = %e, "Stage inputs unresolved");
                return StageOutcome {
                    result: self.result(StageStatus::Failed, Vec::new(), started_at),
                    produced: Vec::new(),
                    error: Some(e),
                };
            }
        };

        let handles = self
            .stage
            .actions
            .iter()
            .zip(inputs)
            .map(|(action, inputs)| self.dispatch(action, inputs));
        let finished = join_all(handles).await;

        let mut actions = Vec::new();
        let mut produced = Vec::new();
        let mut failures = Vec::new();

        for (action, joined) in self.stage.actions.iter().zip(finished) {
            let (started, outcome) = match joined {
                Ok(done) => done,
                Err(e) => (
                    started_at,
                    Err(Error::Internal(format!("action task aborted: {}", e))),
                ),
            };
            let outcome = match outcome {
                Ok(output) => self.store_outputs(action, output, &mut produced).await,
                Err(e) => Err(e),
            };

            let result = match outcome {
                Ok((outputs, diagnostics)) => ActionResult {
                    name: action.name.clone(),
                    status: ActionStatus::Succeeded,
                    exit_code: matches!(action.operation, Operation::Run { .. }).then_some(0),
                    diagnostics,
                    outputs,
                    started_at: started,
                    finished_at: Utc::now(),
                },
                Err(e) => {
                    warn!(stage = %self.stage.name, action = %action.name, error = %e, "Action failed");
                    failures.push(ActionFailure::from_error(&action.name, &e));
                    ActionResult {
                        name: action.name.clone(),
                        status: ActionStatus::Failed,
                        exit_code: e.exit_code(),
                        diagnostics: e.diagnostics().unwrap_or_default().to_string(),
                        outputs: Vec::new(),
                        started_at: started,
                        finished_at: Utc::now(),
                    }
                }
            };
            let _ = self.events.send(PipelineEvent::ActionCompleted {
                execution_id: self.execution_id,
                stage: self.stage.name.clone(),
                action: action.name.clone(),
                success: result.status == ActionStatus::Succeeded,
            });
            actions.push(result);
        }

        if failures.is_empty() {
            info!(stage = %self.stage.name, artifacts = produced.len(), "Stage succeeded");
            StageOutcome {
                result: self.result(StageStatus::Succeeded, actions, started_at),
                produced,
                error: None,
            }
        } else {
            error!(stage = %self.stage.name, failed = failures.len(), "Stage failed");
            StageOutcome {
                result: self.result(StageStatus::Failed, actions, started_at),
                produced,
                error: Some(Error::StageFailed {
                    stage: self.stage.name.clone(),
                    failures,
                }),
            }
        }
    }

    /// Resolve the declared inputs of every action, or fail with the first
    /// unresolvable one.
    async fn resolve_inputs(&self) -> Result<Vec<Blobs>> {
        let mut resolved = Vec::with_capacity(self.stage.actions.len());
        for action in &self.stage.actions {
            let mut blobs = Blobs::new();
            for input in &action.inputs {
                let missing = || Error::MissingInput {
                    action: action.name.clone(),
                    input: input.clone(),
                };
                let reference = self.visible.get(input).ok_or_else(missing)?;
                let data = self.store.get(reference).await.map_err(|_| missing())?;
                blobs.insert(input.clone(), data);
            }
            resolved.push(blobs);
        }
        Ok(resolved)
    }

    fn dispatch(
        &self,
        action: &Action,
        inputs: Blobs,
    ) -> tokio::task::JoinHandle<(DateTime<Utc>, Result<ActionOutput>)> {
        let prepared = self.prepare(action);
        let vars = self.action_vars(&prepared);
        let runners = self.runners.clone();
        let secrets = self.secrets.clone();
        let default_timeout = self.default_timeout;
        let mut env = ActionEnv::new(&self.pipeline.name, &self.stage.name);
        env.execution_id = Some(self.execution_id);
        env.vars = vars;

        tokio::spawn(async move {
            let started_at = Utc::now();
            let result = async {
                for (var, secret_name) in &prepared.secrets {
                    let value = secrets.resolve(secret_name).await?;
                    env.secrets.insert(var.clone(), value);
                }
                runners.run(&prepared, &inputs, &env, default_timeout).await
            }
            .await;
            (started_at, result)
        })
    }

    /// The action with variables substituted into its operation.
    fn prepare(&self, action: &Action) -> Action {
        let mut prepared = action.clone();
        prepared.operation = interpolate_operation(&action.operation, self.vars);
        prepared
    }

    /// Pipeline env, then action env, then the standard `CONVEYOR_*` values.
    fn action_vars(&self, action: &Action) -> BTreeMap<String, String> {
        let mut vars = self.vars.interpolate_map(&self.pipeline.env);
        vars.extend(self.vars.interpolate_map(&action.env));
        vars.insert("CONVEYOR_PIPELINE".to_string(), self.pipeline.name.clone());
        vars.insert("CONVEYOR_STAGE".to_string(), self.stage.name.clone());
        vars.insert("CONVEYOR_ACTION".to_string(), action.name.clone());
        vars.insert(
            "CONVEYOR_EXECUTION_ID".to_string(),
            self.execution_id.to_string(),
        );
        vars.insert(
            "CONVEYOR_EXECUTION_NUMBER".to_string(),
            self.vars.execution.number.to_string(),
        );
        if !self.vars.source.commit.is_empty() {
            vars.insert("CONVEYOR_COMMIT".to_string(), self.vars.source.commit.clone());
        }
        vars
    }

    async fn store_outputs(
        &self,
        action: &Action,
        output: ActionOutput,
        produced: &mut Vec<ArtifactRef>,
    ) -> Result<(Vec<String>, String)> {
        let mut names = Vec::with_capacity(output.outputs.len());
        for (name, data) in output.outputs {
            let key = ArtifactKey::new(self.execution_id, &self.stage.name, &action.name, &name);
            produced.push(self.store.put(key, data).await?);
            names.push(name);
        }
        Ok((names, output.diagnostics))
    }

    fn result(
        &self,
        status: StageStatus,
        actions: Vec<ActionResult>,
        started_at: DateTime<Utc>,
    ) -> StageResult {
        StageResult {
            name: self.stage.name.clone(),
            status,
            actions,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }
}

/// Substitute `${...}` variables into an operation's fields.
pub fn interpolate_operation(operation: &Operation, vars: &VariableContext) -> Operation {
    match operation {
        Operation::Run { commands } => Operation::Run {
            commands: vars.interpolate_vec(commands),
        },
        Operation::SourceFetch { repository, branch } => Operation::SourceFetch {
            repository: vars.interpolate(repository),
            branch: vars.interpolate(branch),
        },
        Operation::ImageBuild {
            repository,
            tag,
            container,
        } => Operation::ImageBuild {
            repository: vars.interpolate(repository),
            tag: vars.interpolate(tag),
            container: vars.interpolate(container),
        },
        Operation::Provision { stack, parameters } => Operation::Provision {
            stack: vars.interpolate(stack),
            parameters: vars.interpolate_map(parameters),
        },
        Operation::Deploy { service, container } => Operation::Deploy {
            service: service.clone(),
            container: container.as_deref().map(|c| vars.interpolate(c)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use conveyor_config::VariableContextBuilder;
    use conveyor_core::executor::ActionRunner;
    use conveyor_executor::MemorySecretStore;

    use crate::store::MemoryArtifactStore;

    /// Writes `<commands[0]>` to every declared output; fails when the first
    /// command is `fail`.
    struct EchoRunner;

    #[async_trait]
    impl ActionRunner for EchoRunner {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn supports(&self, operation: &Operation) -> bool {
            matches!(operation, Operation::Run { .. })
        }

        async fn run(&self, action: &Action, inputs: &Blobs, env: &ActionEnv) -> Result<ActionOutput> {
            let Operation::Run { commands } = &action.operation else {
                unreachable!()
            };
            if commands[0] == "fail" {
                return Err(Error::ActionFailed {
                    action: action.name.clone(),
                    exit_code: Some(1),
                    message: "command exited unsuccessfully".to_string(),
                    diagnostics: format!("{} failing", action.name),
                });
            }
            let mut out = ActionOutput::default().with_diagnostics(format!(
                "inputs={} token={}",
                inputs.len(),
                env.secrets.get("TOKEN").map(|s| s.expose()).unwrap_or("-")
            ));
            for name in &action.outputs {
                out = out.with_output(name.clone(), Bytes::from(commands[0].clone()));
            }
            Ok(out)
        }
    }

    fn run(name: &str, command: &str) -> Action {
        Action::new(
            name,
            Operation::Run {
                commands: vec![command.to_string()],
            },
        )
    }

    struct Fixture {
        pipeline: Pipeline,
        visible: BTreeMap<String, ArtifactRef>,
        vars: VariableContext,
        runners: RunnerSet,
        store: Arc<dyn ArtifactStore>,
        secrets: Arc<dyn SecretStore>,
        events: broadcast::Sender<PipelineEvent>,
        execution_id: ExecutionId,
    }

    impl Fixture {
        fn new(stage: Stage) -> Self {
            let pipeline = Pipeline::builder("web")
                .stage(Stage::new("Source").action(run("checkout", "src").output("Src")))
                .stage(stage)
                .build()
                .unwrap();
            let (events, _) = broadcast::channel(64);
            Self {
                pipeline,
                visible: BTreeMap::new(),
                vars: VariableContextBuilder::new()
                    .with_source("app", "main", "abc123")
                    .build(),
                runners: RunnerSet::new().with(EchoRunner),
                store: Arc::new(MemoryArtifactStore::new()),
                secrets: Arc::new(MemorySecretStore::new().with_secret("npm-token", "hunter2")),
                events,
                execution_id: ExecutionId::new(),
            }
        }

        async fn publish(&mut self, name: &str, data: &'static [u8]) {
            let key = ArtifactKey::new(self.execution_id, "Source", "checkout", name);
            let reference = self.store.put(key, Bytes::from_static(data)).await.unwrap();
            self.visible.insert(name.to_string(), reference);
        }

        async fn run_stage(&self, index: usize) -> StageOutcome {
            StageRun {
                execution_id: self.execution_id,
                pipeline: &self.pipeline,
                stage: &self.pipeline.stages[index],
                visible: &self.visible,
                vars: &self.vars,
                runners: &self.runners,
                store: &self.store,
                secrets: &self.secrets,
                default_timeout: None,
                events: &self.events,
            }
            .run()
            .await
        }
    }

    #[tokio::test]
    async fn test_all_actions_succeed() {
        let mut fixture = Fixture::new(
            Stage::new("Test")
                .action(run("unit", "ok").input("Src").output("UnitReport"))
                .action(run("lint", "ok").input("Src")),
        );
        fixture.publish("Src", b"tree").await;

        let outcome = fixture.run_stage(1).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.result.status, StageStatus::Succeeded);
        assert_eq!(outcome.result.actions.len(), 2);
        assert_eq!(outcome.produced.len(), 1);
        assert_eq!(outcome.produced[0].key.name, "UnitReport");
        assert_eq!(outcome.produced[0].key.stage, "Test");
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_dispatch() {
        let fixture = Fixture::new(
            Stage::new("Test").action(run("unit", "ok").input("Src").output("UnitReport")),
        );
        let mut events = fixture.events.subscribe();

        let outcome = fixture.run_stage(1).await;
        assert!(matches!(outcome.error, Some(Error::MissingInput { ref input, .. }) if input == "Src"));
        assert!(outcome.result.actions.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failure_lets_siblings_finish() {
        let mut fixture = Fixture::new(
            Stage::new("Test")
                .action(run("unit", "fail").input("Src"))
                .action(run("lint", "ok").input("Src").output("LintReport")),
        );
        fixture.publish("Src", b"tree").await;

        let outcome = fixture.run_stage(1).await;
        assert_eq!(outcome.result.status, StageStatus::Failed);
        let Some(Error::StageFailed { stage, failures }) = outcome.error else {
            panic!("expected a stage failure");
        };
        assert_eq!(stage, "Test");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].action, "unit");
        assert_eq!(failures[0].exit_code, Some(1));
        assert_eq!(failures[0].diagnostics, "unit failing");

        let lint = &outcome.result.actions[1];
        assert_eq!(lint.status, ActionStatus::Succeeded);
        assert_eq!(outcome.produced.len(), 1);
    }

    #[tokio::test]
    async fn test_secrets_resolved_and_masked() {
        let mut fixture = Fixture::new(
            Stage::new("Test").action(run("publish", "ok").input("Src").secret("TOKEN", "npm-token")),
        );
        fixture.publish("Src", b"tree").await;

        let outcome = fixture.run_stage(1).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.result.actions[0].diagnostics, "inputs=1 token=***");
    }

    #[tokio::test]
    async fn test_unknown_secret_fails_action() {
        let mut fixture = Fixture::new(
            Stage::new("Test").action(run("publish", "ok").input("Src").secret("TOKEN", "nope")),
        );
        fixture.publish("Src", b"tree").await;

        let outcome = fixture.run_stage(1).await;
        let Some(Error::StageFailed { failures, .. }) = outcome.error else {
            panic!("expected a stage failure");
        };
        assert_eq!(failures[0].kind, "not_found");
    }

    #[test]
    fn test_operation_interpolation() {
        let vars = VariableContextBuilder::new()
            .with_source("app", "main", "abc1234567")
            .build();
        let operation = Operation::ImageBuild {
            repository: "registry.local/${source.repository}".to_string(),
            tag: "${source.short_commit}".to_string(),
            container: "web".to_string(),
        };
        assert_eq!(
            interpolate_operation(&operation, &vars),
            Operation::ImageBuild {
                repository: "registry.local/app".to_string(),
                tag: "abc1234".to_string(),
                container: "web".to_string(),
            }
        );
    }
}
