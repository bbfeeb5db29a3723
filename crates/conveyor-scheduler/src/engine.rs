//! Pipeline engine - runs executions one at a time, stage by stage.
//!
//! Executions move `Pending -> Running -> {Succeeded | Failed | Cancelled}`.
//! New executions queue behind the one in flight and start in trigger order.
//! Cancellation is observed between stages only.
//!
//! The engine keeps unfinished executions in memory; finished ones are read
//! back from the [`ExecutionLog`]. One engine owns a pipeline's log at a time.

use chrono::Utc;
use conveyor_config::{SystemConfig, VariableContext, VariableContextBuilder};
use conveyor_core::artifact::{ArtifactRef, ArtifactStore};
use conveyor_core::history::ExecutionLog;
use conveyor_core::pipeline::{
    ActionFailure, Execution, ExecutionStatus, FailureReport, Pipeline, StageStatus, TriggerCause,
};
use conveyor_core::secret::SecretStore;
use conveyor_core::source::SourceChanged;
use conveyor_core::{Error, ExecutionId, Result};
use conveyor_executor::{MemorySecretStore, RunnerSet};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::event::PipelineEvent;
use crate::history::MemoryExecutionLog;
use crate::stage::StageRun;
use crate::store::MemoryArtifactStore;

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Keep an execution's artifacts after it finishes.
    pub retain_artifacts: bool,
    /// Timeout for actions that declare none.
    pub default_action_timeout: Option<Duration>,
    /// Buffer of the event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retain_artifacts: false,
            default_action_timeout: None,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn from_system(system: &SystemConfig) -> Self {
        Self {
            retain_artifacts: system.retain_artifacts,
            default_action_timeout: system.action_timeout,
            ..Self::default()
        }
    }
}

/// A triggered execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub id: ExecutionId,
    pub number: u64,
    done: oneshot::Receiver<Execution>,
}

impl ExecutionHandle {
    /// Wait for the execution to reach a terminal state.
    pub async fn wait(self) -> Result<Execution> {
        self.done.await.map_err(|_| {
            Error::Internal(format!(
                "engine stopped before execution {} finished",
                self.id
            ))
        })
    }
}

/// Builder for [`PipelineEngine`].
pub struct PipelineEngineBuilder {
    pipeline: Pipeline,
    runners: RunnerSet,
    store: Option<Arc<dyn ArtifactStore>>,
    secrets: Option<Arc<dyn SecretStore>>,
    log: Option<Arc<dyn ExecutionLog>>,
    config: EngineConfig,
}

impl PipelineEngineBuilder {
    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn execution_log(mut self, log: Arc<dyn ExecutionLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the pipeline and check every action has a runner.
    pub fn build(self) -> Result<PipelineEngine> {
        self.pipeline.validate()?;
        self.runners.covers(&self.pipeline)?;

        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        Ok(PipelineEngine {
            inner: Arc::new(EngineInner {
                pipeline: self.pipeline,
                runners: self.runners,
                store: self
                    .store
                    .unwrap_or_else(|| Arc::new(MemoryArtifactStore::new())),
                secrets: self
                    .secrets
                    .unwrap_or_else(|| Arc::new(MemorySecretStore::new())),
                log: self
                    .log
                    .unwrap_or_else(|| Arc::new(MemoryExecutionLog::new())),
                config: self.config,
                state: Mutex::new(EngineState::default()),
                queue: OnceLock::new(),
                events,
            }),
        })
    }
}

/// Runs executions of one pipeline.
///
/// Cheap to clone; clones share the queue and state.
#[derive(Clone)]
pub struct PipelineEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    pipeline: Pipeline,
    runners: RunnerSet,
    store: Arc<dyn ArtifactStore>,
    secrets: Arc<dyn SecretStore>,
    log: Arc<dyn ExecutionLog>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    queue: OnceLock<mpsc::UnboundedSender<ExecutionId>>,
    events: broadcast::Sender<PipelineEvent>,
}

#[derive(Default)]
struct EngineState {
    /// Executions that are not terminal yet.
    records: HashMap<ExecutionId, ExecutionRecord>,
    /// Set once the log has been read.
    next_number: Option<u64>,
}

struct ExecutionRecord {
    execution: Execution,
    source: Option<SourceChanged>,
    cancel_requested: bool,
    done: Option<oneshot::Sender<Execution>>,
}

impl PipelineEngine {
    pub fn builder(pipeline: Pipeline, runners: RunnerSet) -> PipelineEngineBuilder {
        PipelineEngineBuilder {
            pipeline,
            runners,
            store: None,
            secrets: None,
            log: None,
            config: EngineConfig::default(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// Queue a new execution. It starts once every earlier execution is terminal.
    pub async fn trigger(&self, cause: TriggerCause) -> Result<ExecutionHandle> {
        let inner = &self.inner;
        let (done_tx, done_rx) = oneshot::channel();

        let mut state = inner.loaded().await?;
        let source = inner.source_for(&state, &cause).await?;
        let number = state.next_number.unwrap_or(1);
        state.next_number = Some(number + 1);

        let execution = Execution::new(&inner.pipeline, number, cause);
        let id = execution.id;
        inner.append(&execution).await;
        state.records.insert(
            id,
            ExecutionRecord {
                execution,
                source,
                cancel_requested: false,
                done: Some(done_tx),
            },
        );
        let _ = inner
            .events
            .send(PipelineEvent::ExecutionQueued { execution_id: id, number });
        queue(inner)
            .send(id)
            .map_err(|_| Error::Internal("execution queue closed".to_string()))?;
        drop(state);

        info!(
            pipeline = %inner.pipeline.name,
            execution = %id,
            number,
            "Execution queued"
        );
        Ok(ExecutionHandle {
            id,
            number,
            done: done_rx,
        })
    }

    /// Trigger and wait for the terminal state.
    pub async fn run(&self, cause: TriggerCause) -> Result<Execution> {
        self.trigger(cause).await?.wait().await
    }

    /// Start an execution for a source change the pipeline watches.
    pub async fn on_source_changed(&self, event: &SourceChanged) -> Result<Option<ExecutionHandle>> {
        if !self.inner.pipeline.watches(event) {
            debug!(
                pipeline = %self.inner.pipeline.name,
                repository = %event.repository,
                branch = %event.branch,
                "Ignoring source change"
            );
            return Ok(None);
        }
        let cause = TriggerCause::SourceChange {
            repository: event.repository.clone(),
            branch: event.branch.clone(),
            commit: event.commit.clone(),
        };
        self.trigger(cause).await.map(Some)
    }

    /// Start a fresh execution with the same source as a finished one.
    pub async fn retry(&self, original: ExecutionId) -> Result<ExecutionHandle> {
        let previous = self.execution(original).await?;
        if !previous.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "execution {} is still {}",
                original, previous.status
            )));
        }
        self.trigger(TriggerCause::Retry { original }).await
    }

    /// Cancel an execution. A queued execution is cancelled at once; a
    /// running one stops before its next stage.
    pub async fn cancel(&self, id: ExecutionId) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.loaded().await?;
        let Some(status) = state.records.get(&id).map(|r| r.execution.status) else {
            drop(state);
            let finished = inner.log.execution(&inner.pipeline.id, &id).await?;
            return Err(Error::Conflict(format!(
                "execution {} already {}",
                id, finished.status
            )));
        };

        match status {
            status if status.is_terminal() => Err(Error::Conflict(format!(
                "execution {} already {}",
                id, status
            ))),
            ExecutionStatus::Pending => {
                let Some(mut record) = state.records.remove(&id) else {
                    return Err(Error::NotFound(format!("execution {}", id)));
                };
                let execution = &mut record.execution;
                execution.status = ExecutionStatus::Cancelled;
                execution.finished_at = Some(Utc::now());
                for stage in &mut execution.stages {
                    stage.status = StageStatus::Cancelled;
                }
                let snapshot = execution.clone();
                inner.append(&snapshot).await;
                drop(state);

                info!(execution = %id, "Queued execution cancelled");
                inner.finish(snapshot, record.done.take()).await;
                Ok(())
            }
            _ => {
                if let Some(record) = state.records.get_mut(&id) {
                    record.cancel_requested = true;
                }
                info!(execution = %id, "Cancellation requested");
                Ok(())
            }
        }
    }

    /// Current state of an execution, falling back to the history log.
    pub async fn execution(&self, id: ExecutionId) -> Result<Execution> {
        {
            let state = self.inner.loaded().await?;
            if let Some(record) = state.records.get(&id) {
                return Ok(record.execution.clone());
            }
        }
        self.inner.log.execution(&self.inner.pipeline.id, &id).await
    }

    /// Executions queued or in flight, oldest first.
    pub async fn executions(&self) -> Vec<Execution> {
        let state = self.inner.state.lock().await;
        let mut unfinished: Vec<Execution> =
            state.records.values().map(|r| r.execution.clone()).collect();
        unfinished.sort_by_key(|e| e.number);
        unfinished
    }

    /// Every recorded execution of the pipeline, oldest first.
    pub async fn history(&self) -> Result<Vec<Execution>> {
        drop(self.inner.loaded().await?);
        self.inner.log.executions(&self.inner.pipeline.id).await
    }
}

/// The execution queue, with its worker started on first use.
fn queue(inner: &Arc<EngineInner>) -> &mpsc::UnboundedSender<ExecutionId> {
    inner.queue.get_or_init(|| {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(Arc::downgrade(inner), rx));
        tx
    })
}

async fn worker(inner: Weak<EngineInner>, mut rx: mpsc::UnboundedReceiver<ExecutionId>) {
    while let Some(id) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.run_execution(id).await;
    }
    debug!("Execution worker stopped");
}

impl EngineInner {
    async fn run_execution(&self, id: ExecutionId) {
        let claimed = {
            let mut state = self.state.lock().await;
            match state.records.get_mut(&id) {
                Some(record) if !record.execution.status.is_terminal() => {
                    record.execution.status = ExecutionStatus::Running;
                    record.execution.started_at = Some(Utc::now());
                    Some((record.execution.clone(), record.source.clone()))
                }
                _ => None,
            }
        };
        let Some((mut execution, source)) = claimed else {
            return;
        };

        info!(
            pipeline = %self.pipeline.name,
            execution = %id,
            number = execution.number,
            trigger = execution.trigger.label(),
            "Execution started"
        );
        self.publish(&execution).await;
        let _ = self
            .events
            .send(PipelineEvent::ExecutionStarted { execution_id: id });

        let mut vars = self.variables(&execution, source.as_ref());
        let mut visible: BTreeMap<String, ArtifactRef> = BTreeMap::new();

        for (index, stage) in self.pipeline.stages.iter().enumerate() {
            if self.cancel_requested(id).await {
                info!(execution = %id, stage = %stage.name, "Execution cancelled");
                for pending in &mut execution.stages[index..] {
                    pending.status = StageStatus::Cancelled;
                }
                execution.status = ExecutionStatus::Cancelled;
                break;
            }

            execution.stages[index].status = StageStatus::Running;
            execution.stages[index].started_at = Some(Utc::now());
            self.publish(&execution).await;
            let _ = self.events.send(PipelineEvent::StageStarted {
                execution_id: id,
                stage: stage.name.clone(),
            });

            vars.enter_stage(&stage.name, index);
            let outcome = StageRun {
                execution_id: id,
                pipeline: &self.pipeline,
                stage,
                visible: &visible,
                vars: &vars,
                runners: &self.runners,
                store: &self.store,
                secrets: &self.secrets,
                default_timeout: self.config.default_action_timeout,
                events: &self.events,
            }
            .run()
            .await;

            let status = outcome.result.status;
            execution.stages[index] = outcome.result;
            execution.artifacts.extend(outcome.produced.iter().cloned());
            let _ = self.events.send(PipelineEvent::StageCompleted {
                execution_id: id,
                stage: stage.name.clone(),
                status,
            });

            if let Some(err) = outcome.error {
                error!(execution = %id, stage = %stage.name, error = %err, "Execution failed");
                execution.failure = Some(failure_report(&stage.name, &err));
                execution.status = ExecutionStatus::Failed;
                for skipped in &mut execution.stages[index + 1..] {
                    skipped.status = StageStatus::Skipped;
                }
                break;
            }

            for reference in outcome.produced {
                visible.insert(reference.key.name.clone(), reference);
            }
            self.publish(&execution).await;
        }

        if execution.status == ExecutionStatus::Running {
            execution.status = ExecutionStatus::Succeeded;
        }
        execution.finished_at = Some(Utc::now());
        info!(
            pipeline = %self.pipeline.name,
            execution = %id,
            status = %execution.status,
            "Execution finished"
        );

        let done = {
            let mut state = self.state.lock().await;
            self.append(&execution).await;
            state.records.remove(&id).and_then(|mut r| r.done.take())
        };

        if !self.config.retain_artifacts {
            match self.store.evict(&id).await {
                Ok(stats) => debug!(
                    execution = %id,
                    artifacts = stats.artifacts_deleted,
                    bytes = stats.bytes_freed,
                    "Evicted artifacts"
                ),
                Err(e) => warn!(execution = %id, error = %e, "Failed to evict artifacts"),
            }
        }
        self.finish(execution, done).await;
    }

    /// Broadcast the terminal state and wake the waiter.
    async fn finish(&self, execution: Execution, done: Option<oneshot::Sender<Execution>>) {
        let _ = self.events.send(PipelineEvent::ExecutionFinished {
            execution_id: execution.id,
            status: execution.status,
        });
        if let Some(done) = done {
            let _ = done.send(execution);
        }
    }

    /// Store a snapshot in the in-memory record and the log.
    async fn publish(&self, execution: &Execution) {
        {
            let mut state = self.state.lock().await;
            if let Some(record) = state.records.get_mut(&execution.id) {
                record.execution = execution.clone();
            }
        }
        self.append(execution).await;
    }

    async fn append(&self, execution: &Execution) {
        if let Err(e) = self.log.append(execution).await {
            error!(execution = %execution.id, error = %e, "Failed to append execution history");
        }
    }

    async fn cancel_requested(&self, id: ExecutionId) -> bool {
        let state = self.state.lock().await;
        state.records.get(&id).is_some_and(|r| r.cancel_requested)
    }

    /// Lock the state, reading the log on first use. Executions the log
    /// still shows as unfinished were left behind by a stopped engine and
    /// are closed out.
    async fn loaded(&self) -> Result<MutexGuard<'_, EngineState>> {
        let mut state = self.state.lock().await;
        if state.next_number.is_none() {
            let history = self.log.executions(&self.pipeline.id).await?;
            for orphan in history.iter().filter(|e| !e.status.is_terminal()) {
                let closed = close_orphan(orphan.clone());
                warn!(
                    execution = %closed.id,
                    number = closed.number,
                    status = %closed.status,
                    "Closing execution left unfinished by a stopped engine"
                );
                self.append(&closed).await;
            }
            state.next_number = Some(history.iter().map(|e| e.number).max().unwrap_or(0) + 1);
        }
        Ok(state)
    }

    /// Source a new execution builds from.
    async fn source_for(
        &self,
        state: &EngineState,
        cause: &TriggerCause,
    ) -> Result<Option<SourceChanged>> {
        match cause {
            TriggerCause::Manual { .. } => Ok(None),
            TriggerCause::SourceChange {
                repository,
                branch,
                commit,
            } => Ok(Some(SourceChanged {
                repository: repository.clone(),
                branch: branch.clone(),
                commit: commit.clone(),
            })),
            TriggerCause::Retry { original } => {
                if let Some(record) = state.records.get(original) {
                    return Ok(record.source.clone());
                }
                // Follow retries of retries back to the change that started them.
                let mut current = *original;
                loop {
                    let previous = self.log.execution(&self.pipeline.id, &current).await?;
                    match previous.trigger {
                        TriggerCause::SourceChange {
                            repository,
                            branch,
                            commit,
                        } => {
                            return Ok(Some(SourceChanged {
                                repository,
                                branch,
                                commit,
                            }));
                        }
                        TriggerCause::Retry { original } if original != current => {
                            current = original;
                        }
                        _ => return Ok(None),
                    }
                }
            }
        }
    }

    fn variables(&self, execution: &Execution, source: Option<&SourceChanged>) -> VariableContext {
        let mut builder = VariableContextBuilder::new()
            .with_pipeline(self.pipeline.id.to_string(), &self.pipeline.name)
            .with_execution(
                execution.id.to_string(),
                execution.number,
                execution.trigger.label(),
            );
        if let Some(source) = source {
            builder = builder.with_source(&source.repository, &source.branch, &source.commit);
        }
        for (key, value) in &self.pipeline.env {
            builder = builder.with_env(key, value);
        }
        builder.build()
    }
}

/// Terminal form of an execution whose engine stopped before it finished.
/// A queued execution is cancelled; a running one fails at the stage it was in.
fn close_orphan(mut execution: Execution) -> Execution {
    let now = Utc::now();
    if execution.status == ExecutionStatus::Pending {
        execution.status = ExecutionStatus::Cancelled;
        for stage in &mut execution.stages {
            stage.status = StageStatus::Cancelled;
        }
    } else {
        let interrupted = execution
            .stages
            .iter()
            .find(|s| matches!(s.status, StageStatus::Running | StageStatus::Pending))
            .map(|s| s.name.clone())
            .unwrap_or_default();
        for stage in &mut execution.stages {
            match stage.status {
                StageStatus::Running => {
                    stage.status = StageStatus::Failed;
                    stage.finished_at = Some(now);
                }
                StageStatus::Pending => stage.status = StageStatus::Skipped,
                _ => {}
            }
        }
        execution.status = ExecutionStatus::Failed;
        execution.failure = Some(FailureReport {
            stage: interrupted,
            action: None,
            message: "engine stopped before the execution finished".to_string(),
            failures: Vec::new(),
        });
    }
    execution.finished_at = Some(now);
    execution
}

/// Why an execution failed, attributed to a stage and, when possible, an action.
fn failure_report(stage: &str, err: &Error) -> FailureReport {
    let failures = match err {
        Error::StageFailed { failures, .. } => failures.clone(),
        Error::MissingInput { action, .. } => vec![ActionFailure::from_error(action, err)],
        _ => Vec::new(),
    };
    FailureReport {
        stage: stage.to_string(),
        action: failures.first().map(|f| f.action.clone()),
        message: err.to_string(),
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_report_attributes_first_action() {
        let err = Error::StageFailed {
            stage: "Test".to_string(),
            failures: vec![ActionFailure {
                action: "unit".to_string(),
                kind: "action_failed".to_string(),
                message: "exit 1".to_string(),
                exit_code: Some(1),
                diagnostics: "1 failed".to_string(),
            }],
        };
        let report = failure_report("Test", &err);
        assert_eq!(report.stage, "Test");
        assert_eq!(report.action.as_deref(), Some("unit"));
        assert_eq!(report.failures[0].diagnostics, "1 failed");
    }

    #[test]
    fn test_failure_report_for_missing_input() {
        let err = Error::MissingInput {
            action: "deploy".to_string(),
            input: "BuildOutput".to_string(),
        };
        let report = failure_report("Deploy", &err);
        assert_eq!(report.action.as_deref(), Some("deploy"));
        assert_eq!(report.failures[0].kind, "missing_input");
    }

    fn two_stage_pipeline() -> Pipeline {
        use conveyor_core::pipeline::{Action, Operation, Stage};
        let run = |name: &str| {
            Action::new(
                name,
                Operation::Run {
                    commands: vec!["true".to_string()],
                },
            )
        };
        Pipeline::builder("web")
            .stage(Stage::new("Build").action(run("compile")))
            .stage(Stage::new("Test").action(run("unit")))
            .build()
            .unwrap()
    }

    #[test]
    fn test_interrupted_execution_fails_at_its_stage() {
        let pipeline = two_stage_pipeline();
        let mut execution = Execution::new(&pipeline, 1, TriggerCause::Manual { actor: None });
        execution.status = ExecutionStatus::Running;
        execution.stages[0].status = StageStatus::Succeeded;
        execution.stages[1].status = StageStatus::Running;

        let closed = close_orphan(execution);
        assert_eq!(closed.status, ExecutionStatus::Failed);
        assert_eq!(closed.stages[1].status, StageStatus::Failed);
        assert_eq!(closed.failure.unwrap().stage, "Test");
        assert!(closed.finished_at.is_some());
    }

    #[test]
    fn test_queued_orphan_is_cancelled() {
        let pipeline = two_stage_pipeline();
        let execution = Execution::new(&pipeline, 1, TriggerCause::Manual { actor: None });

        let closed = close_orphan(execution);
        assert_eq!(closed.status, ExecutionStatus::Cancelled);
        assert!(closed.stages.iter().all(|s| s.status == StageStatus::Cancelled));
        assert!(closed.failure.is_none());
    }

    #[test]
    fn test_config_from_system() {
        let system = SystemConfig {
            retain_artifacts: true,
            action_timeout: Some(Duration::from_secs(90)),
            ..SystemConfig::default()
        };
        let config = EngineConfig::from_system(&system);
        assert!(config.retain_artifacts);
        assert_eq!(config.default_action_timeout, Some(Duration::from_secs(90)));
    }
}
