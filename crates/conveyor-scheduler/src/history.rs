//! Execution history backends.

use async_trait::async_trait;
use conveyor_core::history::{ExecutionLog, HistoryEntry, fold_entries};
use conveyor_core::pipeline::Execution;
use conveyor_core::{Error, ExecutionId, PipelineId, Result};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// History kept for the life of the process.
#[derive(Default)]
pub struct MemoryExecutionLog {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionLog for MemoryExecutionLog {
    async fn append(&self, execution: &Execution) -> Result<()> {
        self.entries.lock().await.push(HistoryEntry::new(execution));
        Ok(())
    }

    async fn executions(&self, pipeline_id: &PipelineId) -> Result<Vec<Execution>> {
        let entries = self.entries.lock().await;
        Ok(fold_entries(
            entries
                .iter()
                .filter(|e| e.pipeline_id == *pipeline_id)
                .cloned(),
        ))
    }

    async fn execution(
        &self,
        pipeline_id: &PipelineId,
        execution_id: &ExecutionId,
    ) -> Result<Execution> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .rev()
            .find(|e| e.pipeline_id == *pipeline_id && e.execution_id == *execution_id)
            .map(|e| e.execution.clone())
            .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))
    }
}

/// One JSON line per state transition in `<dir>/<pipeline-id>.jsonl`.
pub struct JsonlExecutionLog {
    dir: PathBuf,
    write: Mutex<()>,
}

impl JsonlExecutionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write: Mutex::new(()),
        }
    }

    fn path(&self, pipeline_id: &PipelineId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", pipeline_id))
    }

    async fn read(&self, pipeline_id: &PipelineId) -> Result<Vec<HistoryEntry>> {
        let path = self.path(pipeline_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                // A torn final write leaves a partial line behind.
                Err(e) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable history line"
                ),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl ExecutionLog for JsonlExecutionLog {
    async fn append(&self, execution: &Execution) -> Result<()> {
        let mut line = serde_json::to_string(&HistoryEntry::new(execution))?;
        line.push('\n');

        let _guard = self.write.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(&execution.pipeline_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn executions(&self, pipeline_id: &PipelineId) -> Result<Vec<Execution>> {
        Ok(fold_entries(self.read(pipeline_id).await?))
    }

    async fn execution(
        &self,
        pipeline_id: &PipelineId,
        execution_id: &ExecutionId,
    ) -> Result<Execution> {
        self.read(pipeline_id)
            .await?
            .into_iter()
            .rev()
            .find(|e| e.execution_id == *execution_id)
            .map(|e| e.execution)
            .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::pipeline::{
        Action, ExecutionStatus, Operation, Pipeline, Stage, TriggerCause,
    };

    fn pipeline() -> Pipeline {
        Pipeline::builder("web")
            .stage(Stage::new("Test").action(Action::new(
                "unit",
                Operation::Run {
                    commands: vec!["true".to_string()],
                },
            )))
            .build()
            .unwrap()
    }

    fn manual() -> TriggerCause {
        TriggerCause::Manual { actor: None }
    }

    #[tokio::test]
    async fn test_memory_log_keeps_latest_state() {
        let log = MemoryExecutionLog::new();
        let pipeline = pipeline();
        let mut execution = Execution::new(&pipeline, 1, manual());
        log.append(&execution).await.unwrap();
        execution.status = ExecutionStatus::Succeeded;
        log.append(&execution).await.unwrap();

        let all = log.executions(&pipeline.id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ExecutionStatus::Succeeded);
        assert_eq!(
            log.execution(&pipeline.id, &execution.id).await.unwrap().status,
            ExecutionStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_memory_log_unknown_execution() {
        let log = MemoryExecutionLog::new();
        let err = log
            .execution(&pipeline().id, &ExecutionId::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_jsonl_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline();
        let first = Execution::new(&pipeline, 1, manual());
        let mut second = Execution::new(&pipeline, 2, manual());

        {
            let log = JsonlExecutionLog::new(dir.path());
            log.append(&first).await.unwrap();
            log.append(&second).await.unwrap();
            second.status = ExecutionStatus::Failed;
            log.append(&second).await.unwrap();
        }

        let reopened = JsonlExecutionLog::new(dir.path());
        let all = reopened.executions(&pipeline.id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].number, 1);
        assert_eq!(all[1].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_jsonl_log_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline();
        let log = JsonlExecutionLog::new(dir.path());
        let execution = Execution::new(&pipeline, 1, manual());
        log.append(&execution).await.unwrap();

        let path = dir.path().join(format!("{}.jsonl", pipeline.id));
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"pipeline_id\":");
        std::fs::write(&path, content).unwrap();

        assert_eq!(log.executions(&pipeline.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_log_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlExecutionLog::new(dir.path().join("history"));
        assert!(log.executions(&PipelineId::new()).await.unwrap().is_empty());
    }
}
