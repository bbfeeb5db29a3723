//! Execution history persistence.
//!
//! History is an ordered append log: every state transition of an execution
//! appends a full record keyed by pipeline id and execution id. Readers fold
//! the log, keeping the last record per execution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::id::{ExecutionId, PipelineId};
use crate::pipeline::Execution;

/// One line of the append log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub pipeline_id: PipelineId,
    pub execution_id: ExecutionId,
    pub recorded_at: DateTime<Utc>,
    pub execution: Execution,
}

impl HistoryEntry {
    pub fn new(execution: &Execution) -> Self {
        Self {
            pipeline_id: execution.pipeline_id,
            execution_id: execution.id,
            recorded_at: Utc::now(),
            execution: execution.clone(),
        }
    }
}

/// Trait for execution history backends.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    /// Append the current state of an execution.
    async fn append(&self, execution: &Execution) -> Result<()>;

    /// Latest state of every execution of a pipeline, oldest first.
    async fn executions(&self, pipeline_id: &PipelineId) -> Result<Vec<Execution>>;

    /// Latest state of one execution.
    async fn execution(
        &self,
        pipeline_id: &PipelineId,
        execution_id: &ExecutionId,
    ) -> Result<Execution>;
}

/// Fold log entries into the latest record per execution, in first-seen order.
pub fn fold_entries(entries: impl IntoIterator<Item = HistoryEntry>) -> Vec<Execution> {
    let mut order: Vec<ExecutionId> = Vec::new();
    let mut latest: std::collections::HashMap<ExecutionId, Execution> =
        std::collections::HashMap::new();
    for entry in entries {
        if !latest.contains_key(&entry.execution_id) {
            order.push(entry.execution_id);
        }
        latest.insert(entry.execution_id, entry.execution);
    }
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{
        Action, ExecutionStatus, Operation, Pipeline, Stage, TriggerCause,
    };

    #[test]
    fn test_fold_keeps_last_record_in_first_seen_order() {
        let pipeline = Pipeline::builder("web")
            .stage(Stage::new("Test").action(Action::new(
                "unit",
                Operation::Run {
                    commands: vec!["true".to_string()],
                },
            )))
            .build()
            .unwrap();

        let mut first = Execution::new(&pipeline, 1, TriggerCause::Manual { actor: None });
        let second = Execution::new(&pipeline, 2, TriggerCause::Manual { actor: None });
        let mut entries = vec![HistoryEntry::new(&first), HistoryEntry::new(&second)];
        first.status = ExecutionStatus::Succeeded;
        entries.push(HistoryEntry::new(&first));

        let folded = fold_entries(entries);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].number, 1);
        assert_eq!(folded[0].status, ExecutionStatus::Succeeded);
        assert_eq!(folded[1].status, ExecutionStatus::Pending);
    }
}
