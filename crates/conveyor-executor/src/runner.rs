//! Runner selection and the output contract every action is held to.

use conveyor_core::executor::{ActionEnv, ActionOutput, ActionRunner, Blobs};
use conveyor_core::pipeline::{Action, Operation, Pipeline};
use conveyor_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The runners an engine dispatches actions to.
///
/// The first runner that supports an operation wins.
#[derive(Clone, Default)]
pub struct RunnerSet {
    runners: Vec<Arc<dyn ActionRunner>>,
}

impl RunnerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, runner: impl ActionRunner + 'static) -> Self {
        self.runners.push(Arc::new(runner));
        self
    }

    pub fn runner_for(&self, operation: &Operation) -> Option<&Arc<dyn ActionRunner>> {
        self.runners.iter().find(|r| r.supports(operation))
    }

    /// Actions of the pipeline no runner can execute, as `stage/action`.
    pub fn unsupported(&self, pipeline: &Pipeline) -> Vec<String> {
        pipeline
            .stages
            .iter()
            .flat_map(|stage| {
                stage
                    .actions
                    .iter()
                    .filter(|a| self.runner_for(&a.operation).is_none())
                    .map(move |a| format!("{}/{} ({})", stage.name, a.name, a.operation.kind()))
            })
            .collect()
    }

    /// Check that every action of the pipeline has a runner.
    pub fn covers(&self, pipeline: &Pipeline) -> Result<()> {
        let missing = self.unsupported(pipeline);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidPipeline(format!(
                "no runner supports: {}",
                missing.join(", ")
            )))
        }
    }

    /// Dispatch an action to its runner under the output contract.
    pub async fn run(
        &self,
        action: &Action,
        inputs: &Blobs,
        env: &ActionEnv,
        default_timeout: Option<Duration>,
    ) -> Result<ActionOutput> {
        let runner = self.runner_for(&action.operation).ok_or_else(|| Error::ActionFailed {
            action: action.name.clone(),
            exit_code: None,
            message: format!("no runner supports {} operations", action.operation.kind()),
            diagnostics: String::new(),
        })?;
        execute(runner.as_ref(), action, inputs, env, default_timeout).await
    }
}

/// Run one action and enforce its contract.
///
/// Every declared input must be present before the runner is invoked, the
/// runner sees only its declared inputs, the action's timeout (or the
/// default) bounds the run, and the output set must equal the declared set.
/// Secret values are masked out of any diagnostics.
pub async fn execute(
    runner: &dyn ActionRunner,
    action: &Action,
    inputs: &Blobs,
    env: &ActionEnv,
    default_timeout: Option<Duration>,
) -> Result<ActionOutput> {
    let mut declared = Blobs::new();
    for input in &action.inputs {
        let data = inputs.get(input).ok_or_else(|| Error::MissingInput {
            action: action.name.clone(),
            input: input.clone(),
        })?;
        declared.insert(input.clone(), data.clone());
    }

    info!(
        action = %action.name,
        stage = %env.stage,
        runner = runner.name(),
        "Running action"
    );

    let result = match action.timeout.or(default_timeout) {
        Some(limit) => tokio::time::timeout(limit, runner.run(action, &declared, env))
            .await
            .unwrap_or_else(|_| {
                Err(Error::ActionFailed {
                    action: action.name.clone(),
                    exit_code: None,
                    message: format!("timed out after {}s", limit.as_secs_f64()),
                    diagnostics: String::new(),
                })
            }),
        None => runner.run(action, &declared, env).await,
    };

    let mut output = match result {
        Ok(output) => output,
        Err(e) => {
            let e = mask_error(e, env);
            warn!(action = %action.name, error = %e, "Action failed");
            return Err(e);
        }
    };
    output.diagnostics = env.mask(&output.diagnostics);

    if let Some(missing) = action
        .outputs
        .iter()
        .find(|name| !output.outputs.contains_key(*name))
    {
        return Err(Error::ActionFailed {
            action: action.name.clone(),
            exit_code: None,
            message: format!("did not produce declared output '{}'", missing),
            diagnostics: output.diagnostics,
        });
    }
    if let Some(extra) = output
        .outputs
        .keys()
        .find(|name| !action.outputs.contains(*name))
    {
        return Err(Error::ActionFailed {
            action: action.name.clone(),
            exit_code: None,
            message: format!("produced undeclared output '{}'", extra),
            diagnostics: output.diagnostics,
        });
    }

    debug!(action = %action.name, outputs = output.outputs.len(), "Action succeeded");
    Ok(output)
}

/// Re-attribute a collaborator error to the action that caused it.
pub(crate) fn action_failure(action: &Action, err: Error) -> Error {
    match err {
        Error::ActionFailed {
            exit_code,
            message,
            diagnostics,
            ..
        } => Error::ActionFailed {
            action: action.name.clone(),
            exit_code,
            message,
            diagnostics,
        },
        other => Error::ActionFailed {
            action: action.name.clone(),
            exit_code: None,
            message: other.to_string(),
            diagnostics: String::new(),
        },
    }
}

fn mask_error(err: Error, env: &ActionEnv) -> Error {
    match err {
        Error::ActionFailed {
            action,
            exit_code,
            message,
            diagnostics,
        } => Error::ActionFailed {
            action,
            exit_code,
            message: env.mask(&message),
            diagnostics: env.mask(&diagnostics),
        },
        Error::RolloutFailed {
            service,
            reason,
            diagnostics,
        } => Error::RolloutFailed {
            service,
            reason: env.mask(&reason),
            diagnostics: env.mask(&diagnostics),
        },
        Error::RolloutTimeout {
            service,
            timeout_secs,
            diagnostics,
        } => Error::RolloutTimeout {
            service,
            timeout_secs,
            diagnostics: env.mask(&diagnostics),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use conveyor_core::secret::SecretValue;

    /// Emits a fixed set of outputs after an optional delay.
    struct FakeRunner {
        emit: Vec<&'static str>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ActionRunner for FakeRunner {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn supports(&self, operation: &Operation) -> bool {
            matches!(operation, Operation::Run { .. })
        }

        async fn run(&self, _action: &Action, inputs: &Blobs, env: &ActionEnv) -> Result<ActionOutput> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut out = ActionOutput::default().with_diagnostics(format!(
                "saw {} inputs, token={}",
                inputs.len(),
                env.secrets
                    .get("TOKEN")
                    .map(|s| s.expose().to_string())
                    .unwrap_or_default()
            ));
            for name in &self.emit {
                out = out.with_output(*name, Bytes::from_static(b"data"));
            }
            Ok(out)
        }
    }

    fn action() -> Action {
        Action::new(
            "build",
            Operation::Run {
                commands: vec!["make".to_string()],
            },
        )
        .input("Source")
        .output("Binary")
    }

    fn inputs() -> Blobs {
        let mut blobs = Blobs::new();
        blobs.insert("Source".to_string(), Bytes::from_static(b"src"));
        blobs.insert("Unrelated".to_string(), Bytes::from_static(b"x"));
        blobs
    }

    fn runner(emit: Vec<&'static str>) -> FakeRunner {
        FakeRunner { emit, delay: None }
    }

    #[tokio::test]
    async fn test_only_declared_inputs_are_passed() {
        let env = ActionEnv::new("web", "Build");
        let out = execute(&runner(vec!["Binary"]), &action(), &inputs(), &env, None)
            .await
            .unwrap();
        assert!(out.diagnostics.starts_with("saw 1 inputs"));
        assert_eq!(out.outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_input_fails_before_running() {
        let env = ActionEnv::new("web", "Build");
        let err = execute(&runner(vec!["Binary"]), &action(), &Blobs::new(), &env, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingInput { ref input, .. } if input == "Source"));
    }

    #[tokio::test]
    async fn test_missing_declared_output_is_failure() {
        let env = ActionEnv::new("web", "Build");
        let err = execute(&runner(vec![]), &action(), &inputs(), &env, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "action_failed");
        assert!(err.to_string().contains("did not produce declared output 'Binary'"));
    }

    #[tokio::test]
    async fn test_undeclared_output_is_failure() {
        let env = ActionEnv::new("web", "Build");
        let err = execute(
            &runner(vec!["Binary", "Extra"]),
            &action(),
            &inputs(),
            &env,
            None,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("undeclared output 'Extra'"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_action_failure() {
        let slow = FakeRunner {
            emit: vec!["Binary"],
            delay: Some(Duration::from_secs(60)),
        };
        let env = ActionEnv::new("web", "Build");
        let err = execute(
            &slow,
            &action().timeout(Duration::from_secs(5)),
            &inputs(),
            &env,
            Some(Duration::from_secs(600)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_code(), None);
        assert!(err.to_string().contains("timed out after 5s"));
    }

    #[tokio::test]
    async fn test_secrets_masked_in_diagnostics() {
        let env = ActionEnv::new("web", "Build").with_secret("TOKEN", SecretValue::new("hunter2"));
        let out = execute(&runner(vec!["Binary"]), &action(), &inputs(), &env, None)
            .await
            .unwrap();
        assert!(out.diagnostics.contains("token=***"));
        assert!(!out.diagnostics.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_runner_set_coverage() {
        let set = RunnerSet::new().with(runner(vec![]));
        let pipeline = Pipeline::builder("web")
            .stage(
                conveyor_core::pipeline::Stage::new("Source").action(
                    Action::new(
                        "fetch",
                        Operation::SourceFetch {
                            repository: "app".to_string(),
                            branch: "main".to_string(),
                        },
                    )
                    .output("Src"),
                ),
            )
            .build()
            .unwrap();
        let err = set.covers(&pipeline).unwrap_err();
        assert!(err.to_string().contains("Source/fetch (source_fetch)"));

        let env = ActionEnv::new("web", "Source");
        let err = set
            .run(&pipeline.stages[0].actions[0], &Blobs::new(), &env, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "action_failed");
    }
}
