use anyhow::{Context, Result};
use rusqlite::params;

use super::{TaskDb, json_column};
use crate::models::{NewExecution, TestExecution};

const EXEC_COLUMNS: &str = "id, task_id, step_id, artifact_version, attempt_number, success, output, error, exit_code, duration_ms, evidence, created_at";

fn read_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestExecution> {
    let evidence = match json_column(row, 10)? {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    Ok(TestExecution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        step_id: row.get(2)?,
        artifact_version: row.get(3)?,
        attempt_number: row.get(4)?,
        success: row.get(5)?,
        output: row.get(6)?,
        error: row.get(7)?,
        exit_code: row.get(8)?,
        duration_ms: row.get(9)?,
        evidence,
        created_at: row.get(11)?,
    })
}

impl TaskDb {
    /// Append one attempt to the execution audit trail.
    ///
    /// Attempt numbers outside `1..=max_attempts` are rejected, as is a second
    /// task-level row for the same attempt.
    pub fn record_execution(
        &self,
        task_id: i64,
        execution: &NewExecution,
        max_attempts: u32,
    ) -> Result<TestExecution> {
        if execution.attempt_number < 1 || execution.attempt_number > i64::from(max_attempts) {
            anyhow::bail!(
                "Attempt {} is outside 1..={} for task {}",
                execution.attempt_number,
                max_attempts,
                task_id
            );
        }
        let evidence =
            serde_json::to_string(&execution.evidence).context("Failed to serialize evidence")?;
        self.conn
            .execute(
                "INSERT INTO test_executions
                    (task_id, step_id, artifact_version, attempt_number, success, output, error, exit_code, duration_ms, evidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    task_id,
                    execution.step_id,
                    execution.artifact_version,
                    execution.attempt_number,
                    execution.success,
                    execution.output,
                    execution.error,
                    execution.exit_code,
                    execution.duration_ms,
                    evidence
                ],
            )
            .with_context(|| {
                format!(
                    "Failed to insert execution for attempt {}",
                    execution.attempt_number
                )
            })?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                &format!("SELECT {} FROM test_executions WHERE id = ?1", EXEC_COLUMNS),
                params![id],
                read_execution,
            )
            .context("Execution not found after insert")
    }

    pub fn list_executions(&self, task_id: i64) -> Result<Vec<TestExecution>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM test_executions WHERE task_id = ?1 ORDER BY attempt_number, id",
                EXEC_COLUMNS
            ))
            .context("Failed to prepare list_executions")?;
        let rows = stmt
            .query_map(params![task_id], read_execution)
            .context("Failed to query executions")?;
        let mut executions = Vec::new();
        for row in rows {
            executions.push(row.context("Failed to read execution row")?);
        }
        Ok(executions)
    }

    /// Task-level attempts only (rows without a step).
    pub fn count_executions(&self, task_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM test_executions WHERE task_id = ?1 AND step_id IS NULL",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to count executions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;

    fn setup() -> Result<(TaskDb, i64)> {
        let db = TaskDb::new_in_memory()?;
        let id = db.allocate_task_id()?;
        db.create_task(id, "x", Platform::Web, &Default::default(), "generated_code/1")?;
        Ok((db, id))
    }

    fn attempt(n: i64, success: bool) -> NewExecution {
        NewExecution {
            artifact_version: n,
            attempt_number: n,
            success,
            output: Some("ran".into()),
            exit_code: Some(if success { 0 } else { 1 }),
            duration_ms: 120,
            evidence: vec![format!("screenshots/attempt_{n}.png")],
            ..Default::default()
        }
    }

    #[test]
    fn test_record_and_list_executions() -> Result<()> {
        let (db, id) = setup()?;
        db.record_execution(id, &attempt(1, false), 3)?;
        let second = db.record_execution(id, &attempt(2, true), 3)?;
        assert!(second.success);
        assert_eq!(second.evidence, vec!["screenshots/attempt_2.png".to_string()]);
        assert_eq!(second.exit_code, Some(0));

        let all = db.list_executions(id)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].attempt_number, 1);
        assert_eq!(db.count_executions(id)?, 2);
        Ok(())
    }

    #[test]
    fn test_attempt_bound_is_enforced() -> Result<()> {
        let (db, id) = setup()?;
        assert!(db.record_execution(id, &attempt(4, false), 3).is_err());
        assert!(db.record_execution(id, &attempt(0, false), 3).is_err());
        assert_eq!(db.count_executions(id)?, 0);
        Ok(())
    }

    #[test]
    fn test_duplicate_attempt_rejected() -> Result<()> {
        let (db, id) = setup()?;
        db.record_execution(id, &attempt(1, false), 3)?;
        assert!(db.record_execution(id, &attempt(1, true), 3).is_err());
        Ok(())
    }
}
