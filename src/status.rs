//! Read-only projections of task state for callers and the CLI.

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::models::{Phase, Task, TaskStatus};
use crate::store::DbHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: i64,
    pub status: TaskStatus,
    pub phase: Option<Phase>,
    pub progress_percent: u8,
    pub has_issues: bool,
    pub last_error: Option<String>,
    pub failed_phase: Option<Phase>,
}

impl TaskStatusView {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            phase: task.current_phase,
            progress_percent: progress_percent(task),
            has_issues: task.has_issues,
            last_error: task.last_error.clone(),
            failed_phase: task.failed_phase,
        }
    }
}

/// 25 per completed phase; 100 once the task completed.
pub fn progress_percent(task: &Task) -> u8 {
    if matches!(
        task.status,
        TaskStatus::Completed | TaskStatus::CompletedWithIssues
    ) {
        return 100;
    }
    [
        task.blueprint_done,
        task.code_done,
        task.test_done,
        task.report_done,
    ]
    .iter()
    .filter(|done| **done)
    .count() as u8
        * 25
}

#[derive(Clone)]
pub struct StatusProjector {
    db: DbHandle,
}

impl StatusProjector {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn get_status(&self, task_id: i64) -> Result<TaskStatusView, PipelineError> {
        let task = self
            .db
            .call(move |db| db.get_task(task_id))
            .await
            .map_err(PipelineError::persistence)?
            .ok_or(PipelineError::TaskNotFound { id: task_id })?;
        Ok(TaskStatusView::from_task(&task))
    }

    /// Most recent tasks first.
    pub async fn list(&self, limit: usize) -> Result<Vec<Task>, PipelineError> {
        self.db
            .call(move |db| db.list_tasks(limit))
            .await
            .map_err(PipelineError::persistence)
    }
}
