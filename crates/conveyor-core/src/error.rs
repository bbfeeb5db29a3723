//! Error types for Conveyor.

use thiserror::Error;

use crate::pipeline::ActionFailure;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A declared input could not be resolved before the action ran.
    #[error("action '{action}' is missing input artifact '{input}'")]
    MissingInput { action: String, input: String },

    /// Non-zero exit, timeout, or broken output contract of a unit of work.
    #[error("action '{action}' failed{}: {message}", exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    ActionFailed {
        action: String,
        exit_code: Option<i32>,
        message: String,
        diagnostics: String,
    },

    #[error("stage '{stage}' failed: {} action(s) failed", failures.len())]
    StageFailed {
        stage: String,
        failures: Vec<ActionFailure>,
    },

    /// `diagnostics` carries the rollout report summary.
    #[error("rollout of service '{service}' did not converge within {timeout_secs}s")]
    RolloutTimeout {
        service: String,
        timeout_secs: u64,
        diagnostics: String,
    },

    #[error("rollout of service '{service}' failed: {reason}")]
    RolloutFailed {
        service: String,
        reason: String,
        diagnostics: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Captured output of the failing unit of work, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Error::ActionFailed { diagnostics, .. }
            | Error::RolloutTimeout { diagnostics, .. }
            | Error::RolloutFailed { diagnostics, .. }
                if !diagnostics.is_empty() =>
            {
                Some(diagnostics)
            }
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::ActionFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Short machine-readable name of the error variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::InvalidInput(_) => "invalid_input",
            Error::InvalidPipeline(_) => "invalid_pipeline",
            Error::Conflict(_) => "conflict",
            Error::MissingInput { .. } => "missing_input",
            Error::ActionFailed { .. } => "action_failed",
            Error::StageFailed { .. } => "stage_failed",
            Error::RolloutTimeout { .. } => "rollout_timeout",
            Error::RolloutFailed { .. } => "rollout_failed",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
