use anyhow::{Context, Result};
use rusqlite::params;

use super::{TaskDb, parse_column};
use crate::models::{Phase, StepSpec, StepStatus, WorkflowStep};

const STEP_COLUMNS: &str = "id, task_id, phase, name, step_order, action_type, expected_result, actual_result, status, attempt_count, started_at, completed_at, duration_ms, error";

fn read_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowStep> {
    Ok(WorkflowStep {
        id: row.get(0)?,
        task_id: row.get(1)?,
        phase: parse_column(row, 2)?,
        name: row.get(3)?,
        step_order: row.get(4)?,
        action_type: row.get(5)?,
        expected_result: row.get(6)?,
        actual_result: row.get(7)?,
        status: parse_column(row, 8)?,
        attempt_count: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        duration_ms: row.get(12)?,
        error: row.get(13)?,
    })
}

/// Result of running one step during a test attempt.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub actual_result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

impl TaskDb {
    /// Persist the blueprint's step list with orders 1..N.
    ///
    /// A task's steps are written exactly once; a second call fails instead
    /// of appending, so the orders stay gap-free.
    pub fn create_steps(
        &self,
        task_id: i64,
        phase: Phase,
        specs: &[StepSpec],
    ) -> Result<Vec<WorkflowStep>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let existing: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM workflow_steps WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to count steps")?;
        if existing > 0 {
            anyhow::bail!("Task {} already has {} steps", task_id, existing);
        }

        for (i, spec) in specs.iter().enumerate() {
            tx.execute(
                "INSERT INTO workflow_steps (task_id, phase, name, step_order, action_type, expected_result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task_id,
                    phase.as_str(),
                    spec.name,
                    (i + 1) as i64,
                    spec.action_type,
                    spec.expected_result
                ],
            )
            .with_context(|| format!("Failed to insert step {}", i + 1))?;
        }
        tx.commit().context("Failed to commit steps")?;

        self.list_steps(task_id)
    }

    pub fn list_steps(&self, task_id: i64) -> Result<Vec<WorkflowStep>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM workflow_steps WHERE task_id = ?1 ORDER BY step_order",
                STEP_COLUMNS
            ))
            .context("Failed to prepare list_steps")?;
        let rows = stmt
            .query_map(params![task_id], read_step)
            .context("Failed to query steps")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read step row")?);
        }
        Ok(steps)
    }

    /// Record the outcome of one step for the current attempt.
    pub fn record_step_outcome(
        &self,
        task_id: i64,
        step_order: i64,
        outcome: &StepOutcome,
    ) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE workflow_steps SET
                    status = ?1,
                    actual_result = COALESCE(?2, actual_result),
                    error = ?3,
                    duration_ms = ?4,
                    attempt_count = attempt_count + 1,
                    started_at = COALESCE(started_at, datetime('now')),
                    completed_at = CASE WHEN ?1 IN ('completed', 'failed') THEN datetime('now') ELSE NULL END
                 WHERE task_id = ?5 AND step_order = ?6",
                params![
                    outcome.status.as_str(),
                    outcome.actual_result,
                    outcome.error,
                    outcome.duration_ms,
                    task_id,
                    step_order
                ],
            )
            .context("Failed to update step")?;
        if updated == 0 {
            anyhow::bail!("Task {} has no step {}", task_id, step_order);
        }
        Ok(())
    }
}
