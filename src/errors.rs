//! Typed error hierarchy for the autoflow pipeline.
//!
//! Two top-level enums cover the two failure domains:
//! - `SupervisorError`: sandbox provisioning and subprocess execution
//! - `PipelineError`: everything the controller can surface to a caller

use std::time::Duration;

use thiserror::Error;

use crate::models::{Phase, TaskStatus};

/// Errors from the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Sandbox setup failed for task {task_id}: {message}")]
    Environment { task_id: i64, message: String },

    #[error("Dependency install exited with code {exit_code}: {stderr}")]
    Dependency { exit_code: i32, stderr: String },

    #[error("Tool '{tool}' not reachable after {waited:?}")]
    ToolUnavailable { tool: String, waited: Duration },

    #[error("Failed to run artifact {artifact}: {source}")]
    Execution {
        artifact: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} exceeded time limit ({limit:?})")]
    Timeout {
        operation: String,
        limit: Duration,
    },
}

impl SupervisorError {
    /// Timeouts and execution failures count against the attempt budget.
    /// Environment, dependency and tool errors are fatal to the task.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Execution { .. })
    }
}

/// Errors surfaced by the pipeline controller and runner.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Dependency install failed: {0}")]
    Dependency(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Collaboration budget exhausted after {attempts} attempts")]
    CollaborationExhausted { attempts: u32 },

    #[error("Persistence failure: {0:#}")]
    Persistence(anyhow::Error),

    #[error("{phase} collaborator failed: {message}")]
    Collaborator { phase: Phase, message: String },

    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {id} was cancelled")]
    Cancelled { id: i64 },
}

impl PipelineError {
    /// Wrap a store failure. Persistence errors are never swallowed.
    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(err)
    }

    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

impl From<SupervisorError> for PipelineError {
    fn from(err: SupervisorError) -> Self {
        let message = err.to_string();
        match err {
            SupervisorError::Environment { .. } => Self::Environment(message),
            SupervisorError::Dependency { .. } => Self::Dependency(message),
            SupervisorError::ToolUnavailable { .. } => Self::Environment(message),
            SupervisorError::Execution { .. } => Self::Execution(message),
            SupervisorError::Timeout { .. } => Self::Timeout(message),
        }
    }
}
