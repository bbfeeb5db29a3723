//! Local pipeline execution command.

use anyhow::{Context, Result};
use conveyor_config::ProjectConfig;
use conveyor_core::pipeline::{Execution, ExecutionStatus, StageStatus, Trigger, TriggerCause};
use conveyor_deployer::{DeployRunner, RolloutController, SimulatedOrchestrator};
use conveyor_executor::{
    CommandProvisioner, EnvSecretStore, GitSource, ImageBuildRunner, LocalRegistry,
    ProvisionRunner, RunnerSet, ShellRunner, SourceRunner, StaticProvisioner,
};
use conveyor_scheduler::{EngineConfig, JsonlExecutionLog, PipelineEngine, PipelineEvent};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use super::{history_dir, load, project_dir, resolve};

/// Source coordinates given on the command line.
#[derive(Debug, Default)]
pub struct SourceArgs {
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

/// Run a pipeline once with local collaborators.
pub async fn run(config_path: &str, source: SourceArgs) -> Result<()> {
    let project = load(config_path)?;
    let base = project_dir(config_path)?;

    println!("Running pipeline: {}", project.pipeline.name);
    println!("Stages: {}", project.pipeline.stages.len());
    println!("Working directory: {}", base.display());

    let runners = runners(&project, &base);
    let log = Arc::new(JsonlExecutionLog::new(history_dir(config_path, &project)?));
    let engine = PipelineEngine::builder(project.pipeline.clone(), runners)
        .secret_store(Arc::new(EnvSecretStore::new()))
        .execution_log(log)
        .config(EngineConfig::from_system(&project.system))
        .build()
        .context("Pipeline cannot run with the local runners")?;

    let cause = trigger_cause(&project, source);
    info!(trigger = cause.label(), "Triggering execution");

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if print_event(&event) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    println!("  ({} events skipped)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("\n--- Starting pipeline execution ---\n");
    let execution = engine.run(cause).await?;
    let _ = printer.await;

    print_summary(&execution);
    match execution.status {
        ExecutionStatus::Succeeded => {
            println!("\n✓ Pipeline succeeded!");
            Ok(())
        }
        status => anyhow::bail!("Pipeline {} (execution {})", status, execution.id),
    }
}

/// Runners for every operation kind, backed by local collaborators.
fn runners(project: &ProjectConfig, base: &Path) -> RunnerSet {
    let system = &project.system;

    let mut shell = ShellRunner::new();
    if let Some(work_dir) = &system.work_dir {
        shell = shell.with_work_root(resolve(base, work_dir));
    }

    let provision = match &system.provisioner {
        Some(command) => ProvisionRunner::new(CommandProvisioner::new(command.clone())),
        None => ProvisionRunner::new(StaticProvisioner::new()),
    };

    let mut orchestrator = SimulatedOrchestrator::new();
    for service in &project.services {
        orchestrator = orchestrator.with_service(service.target.clone());
    }
    let mut controller = RolloutController::new(Arc::new(orchestrator), system.rollout.clone());
    for service in &project.services {
        controller = controller
            .with_service_policy(service.target.name.clone(), service.policy(&system.rollout));
    }

    RunnerSet::new()
        .with(shell)
        .with(SourceRunner::new(GitSource::new().with_base_dir(base)))
        .with(ImageBuildRunner::new(Arc::new(LocalRegistry::new())))
        .with(provision)
        .with(DeployRunner::new(Arc::new(controller)))
}

/// A source change when any coordinate is given, otherwise a manual run.
fn trigger_cause(project: &ProjectConfig, source: SourceArgs) -> TriggerCause {
    if source.repository.is_none() && source.branch.is_none() && source.commit.is_none() {
        return TriggerCause::Manual {
            actor: std::env::var("USER").ok(),
        };
    }

    let watched = project.pipeline.triggers.iter().find_map(|t| match t {
        Trigger::SourceChange { repository, .. } => repository.clone(),
        Trigger::Manual => None,
    });
    TriggerCause::SourceChange {
        repository: source
            .repository
            .or(watched)
            .unwrap_or_else(|| project.pipeline.name.clone()),
        branch: source.branch.unwrap_or_else(|| "main".to_string()),
        commit: source.commit.unwrap_or_else(|| "HEAD".to_string()),
    }
}

/// Print one event; true once the execution has finished.
fn print_event(event: &PipelineEvent) -> bool {
    match event {
        PipelineEvent::ExecutionQueued { number, .. } => {
            println!("Execution #{} queued", number);
        }
        PipelineEvent::ExecutionStarted { .. } => {}
        PipelineEvent::StageStarted { stage, .. } => {
            println!("▶ Stage '{}' started", stage);
        }
        PipelineEvent::ActionCompleted {
            stage,
            action,
            success,
            ..
        } => {
            let marker = if *success { "✓" } else { "✗" };
            println!("  [{}] {} {}", stage, marker, action);
        }
        PipelineEvent::StageCompleted { stage, status, .. } => match status {
            StageStatus::Succeeded => println!("✓ Stage '{}' completed successfully\n", stage),
            other => println!("✗ Stage '{}' {}\n", stage, other),
        },
        PipelineEvent::ExecutionFinished { status, .. } => {
            println!("--- Pipeline {} ---", status);
            return true;
        }
    }
    false
}

pub(super) fn print_summary(execution: &Execution) {
    println!("\n--- Stage Summary ---");
    for stage in &execution.stages {
        let status = match stage.status {
            StageStatus::Succeeded => "✓ succeeded",
            StageStatus::Failed => "✗ failed",
            StageStatus::Skipped => "⊘ skipped",
            StageStatus::Cancelled => "⊘ cancelled",
            StageStatus::Pending => "○ pending",
            StageStatus::Running => "▶ running",
        };
        println!("  {} - {}", stage.name, status);
    }

    if let Some(failure) = &execution.failure {
        println!("\n--- Failure ---");
        println!("  stage: {}", failure.stage);
        if let Some(action) = &failure.action {
            println!("  action: {}", action);
        }
        println!("  {}", failure.message);
        for action in &failure.failures {
            if !action.diagnostics.is_empty() {
                println!("\n  [{}] diagnostics:", action.action);
                for line in action.diagnostics.lines() {
                    println!("    {}", line);
                }
            }
        }
    }
}
