//! Engine progress events.

use conveyor_core::ExecutionId;
use conveyor_core::pipeline::{ExecutionStatus, StageStatus};
use serde::Serialize;

/// Event emitted while executions progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    ExecutionQueued {
        execution_id: ExecutionId,
        number: u64,
    },
    ExecutionStarted {
        execution_id: ExecutionId,
    },
    StageStarted {
        execution_id: ExecutionId,
        stage: String,
    },
    ActionCompleted {
        execution_id: ExecutionId,
        stage: String,
        action: String,
        success: bool,
    },
    StageCompleted {
        execution_id: ExecutionId,
        stage: String,
        status: StageStatus,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
}

impl PipelineEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            PipelineEvent::ExecutionQueued { execution_id, .. }
            | PipelineEvent::ExecutionStarted { execution_id }
            | PipelineEvent::StageStarted { execution_id, .. }
            | PipelineEvent::ActionCompleted { execution_id, .. }
            | PipelineEvent::StageCompleted { execution_id, .. }
            | PipelineEvent::ExecutionFinished { execution_id, .. } => *execution_id,
        }
    }
}
