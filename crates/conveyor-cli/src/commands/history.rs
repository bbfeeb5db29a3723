//! Execution history commands.

use anyhow::{Context, Result};
use conveyor_core::history::ExecutionLog;
use conveyor_core::pipeline::Execution;
use conveyor_scheduler::JsonlExecutionLog;

use super::{history_dir, load};

pub async fn list(config_path: &str, limit: usize) -> Result<()> {
    let (pipeline_id, log) = open(config_path)?;
    let executions = log
        .executions(&pipeline_id)
        .await
        .context("Failed to read execution history")?;

    if executions.is_empty() {
        println!("No executions recorded");
        return Ok(());
    }

    let skip = executions.len().saturating_sub(limit);
    for execution in executions.iter().skip(skip).rev() {
        let failed_stage = execution
            .failure
            .as_ref()
            .map(|f| format!("  (failed in {})", f.stage))
            .unwrap_or_default();
        println!(
            "#{:<4} {}  {:<10} {:<14} {}{}",
            execution.number,
            execution.id.short(),
            execution.status,
            execution.trigger.label(),
            execution.created_at.format("%Y-%m-%d %H:%M:%S"),
            failed_stage
        );
    }
    Ok(())
}

/// Show one execution. `id` may be a full id, an id prefix, or `#<number>`.
pub async fn show(config_path: &str, id: &str, json: bool) -> Result<()> {
    let (pipeline_id, log) = open(config_path)?;
    let executions = log
        .executions(&pipeline_id)
        .await
        .context("Failed to read execution history")?;
    let execution = find(&executions, id)
        .with_context(|| format!("No execution matching '{}'", id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(execution)?);
        return Ok(());
    }

    println!("Execution #{} ({})", execution.number, execution.id);
    println!("  pipeline: {}", execution.pipeline_name);
    println!("  status:   {}", execution.status);
    println!("  trigger:  {}", execution.trigger.label());
    if let (Some(started), Some(finished)) = (execution.started_at, execution.finished_at) {
        println!("  duration: {}s", (finished - started).num_seconds());
    }
    for artifact in &execution.artifacts {
        println!(
            "  artifact: {} ({} bytes, sha256:{})",
            artifact.key,
            artifact.size,
            &artifact.checksum[..artifact.checksum.len().min(12)]
        );
    }
    super::run::print_summary(execution);
    Ok(())
}

fn open(config_path: &str) -> Result<(conveyor_core::PipelineId, JsonlExecutionLog)> {
    let project = load(config_path)?;
    let dir = history_dir(config_path, &project)?;
    Ok((project.pipeline.id, JsonlExecutionLog::new(dir)))
}

fn find<'a>(executions: &'a [Execution], id: &str) -> Option<&'a Execution> {
    if let Some(number) = id.strip_prefix('#') {
        let number: u64 = number.parse().ok()?;
        return executions.iter().find(|e| e.number == number);
    }
    let id = id.to_ascii_lowercase();
    executions.iter().find(|e| {
        let full = e.id.to_string();
        full == id || full.replace('-', "").starts_with(&id.replace('-', ""))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::pipeline::{Action, Operation, Pipeline, Stage, TriggerCause};

    fn executions() -> Vec<Execution> {
        let pipeline = Pipeline::builder("web")
            .stage(Stage::new("Build").action(Action::new(
                "compile",
                Operation::Run {
                    commands: vec!["make".to_string()],
                },
            )))
            .build()
            .unwrap();
        (1..=3)
            .map(|n| Execution::new(&pipeline, n, TriggerCause::Manual { actor: None }))
            .collect()
    }

    #[test]
    fn test_find_by_number() {
        let all = executions();
        assert_eq!(find(&all, "#2").unwrap().number, 2);
        assert!(find(&all, "#9").is_none());
    }

    #[test]
    fn test_find_by_id() {
        let all = executions();
        let target = &all[1];
        assert_eq!(find(&all, &target.id.to_string()).unwrap().id, target.id);
        let simple = target.id.as_uuid().simple().to_string();
        assert_eq!(find(&all, &simple).unwrap().id, target.id);
        assert!(find(&all, "zzzz").is_none());
    }
}
