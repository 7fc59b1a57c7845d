use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::TaskDb;
use crate::models::{Phase, Platform, Task, TaskRow, TaskStatus};

const TASK_COLUMNS: &str = "id, instruction, platform, additional_data, status, blueprint_done, code_done, test_done, report_done, has_issues, base_path, current_phase, last_error, failed_phase, created_at, updated_at";

fn read_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        instruction: row.get(1)?,
        platform: row.get(2)?,
        additional_data: row.get(3)?,
        status: row.get(4)?,
        blueprint_done: row.get(5)?,
        code_done: row.get(6)?,
        test_done: row.get(7)?,
        report_done: row.get(8)?,
        has_issues: row.get(9)?,
        base_path: row.get(10)?,
        current_phase: row.get(11)?,
        last_error: row.get(12)?,
        failed_phase: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

/// One persisted status transition, applied with compare-and-set on `from`.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub from: TaskStatus,
    pub to: TaskStatus,
    /// Phase now in progress (left unchanged when `None`).
    pub phase: Option<Phase>,
    /// Phase whose progress flag is set by this transition.
    pub completed: Option<Phase>,
    pub has_issues: bool,
    pub error: Option<String>,
    pub failed_phase: Option<Phase>,
}

impl StatusChange {
    pub fn new(from: TaskStatus, to: TaskStatus) -> Self {
        Self {
            from,
            to,
            phase: to.phase(),
            completed: None,
            has_issues: false,
            error: None,
            failed_phase: None,
        }
    }

    pub fn completing(mut self, phase: Phase) -> Self {
        self.completed = Some(phase);
        self
    }

    pub fn with_issues(mut self, reason: impl Into<String>) -> Self {
        self.has_issues = true;
        self.error = Some(reason.into());
        self
    }

    pub fn failing(mut self, phase: Option<Phase>, error: impl Into<String>) -> Self {
        self.failed_phase = phase;
        self.error = Some(error.into());
        self
    }
}

impl TaskDb {
    pub fn create_task(
        &self,
        id: i64,
        instruction: &str,
        platform: Platform,
        additional_data: &serde_json::Map<String, serde_json::Value>,
        base_path: &str,
    ) -> Result<Task> {
        let data = serde_json::to_string(additional_data)
            .context("Failed to serialize additional data")?;
        self.conn
            .execute(
                "INSERT INTO tasks (id, instruction, platform, additional_data, status, base_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    instruction,
                    platform.as_str(),
                    data,
                    TaskStatus::Created.as_str(),
                    base_path
                ],
            )
            .context("Failed to insert task")?;
        self.get_task(id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                read_task_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Most recent tasks first.
    pub fn list_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM tasks ORDER BY id DESC LIMIT ?1",
                TASK_COLUMNS
            ))
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(params![limit as i64], read_task_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    /// Tasks that have not reached a terminal status, oldest first.
    pub fn list_unfinished_tasks(&self) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE status NOT IN ('completed', 'completed_with_issues', 'failed') ORDER BY id",
                TASK_COLUMNS
            ))
            .context("Failed to prepare list_unfinished_tasks")?;
        let rows = stmt
            .query_map([], read_task_row)
            .context("Failed to query unfinished tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    /// Apply a status transition if the task is still in `change.from`.
    ///
    /// Progress flags, `has_issues`, `last_error` and `failed_phase` only
    /// ever get set, never cleared. Fails if the stored status differs from
    /// `change.from`, which means another writer got there first.
    pub fn transition_task(&self, id: i64, change: &StatusChange) -> Result<Task> {
        let done = |phase: Phase| change.completed == Some(phase);
        let updated = self
            .conn
            .execute(
                "UPDATE tasks SET
                    status = ?1,
                    current_phase = COALESCE(?2, current_phase),
                    blueprint_done = blueprint_done OR ?3,
                    code_done = code_done OR ?4,
                    test_done = test_done OR ?5,
                    report_done = report_done OR ?6,
                    has_issues = has_issues OR ?7,
                    last_error = COALESCE(?8, last_error),
                    failed_phase = COALESCE(?9, failed_phase),
                    updated_at = datetime('now')
                 WHERE id = ?10 AND status = ?11",
                params![
                    change.to.as_str(),
                    change.phase.map(|p| p.as_str()),
                    done(Phase::Blueprint),
                    done(Phase::CodeGen),
                    done(Phase::Test),
                    done(Phase::Report),
                    change.has_issues,
                    change.error.as_deref(),
                    change.failed_phase.map(|p| p.as_str()),
                    id,
                    change.from.as_str(),
                ],
            )
            .context("Failed to update task status")?;

        if updated == 0 {
            let current = self.get_task(id)?;
            match current {
                Some(task) => anyhow::bail!(
                    "Task {} is {} but transition expected {} -> {}",
                    id,
                    task.status,
                    change.from,
                    change.to
                ),
                None => anyhow::bail!("Task {} not found", id),
            }
        }

        self.get_task(id)?
            .context("Task not found after status update")
    }

    pub fn count_tasks(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .context("Failed to count tasks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(db: &TaskDb, instruction: &str) -> Result<Task> {
        let id = db.allocate_task_id()?;
        let mut data = serde_json::Map::new();
        data.insert("url".into(), serde_json::json!("https://example.com"));
        db.create_task(
            id,
            instruction,
            Platform::Web,
            &data,
            &format!("generated_code/{}", id),
        )
    }

    #[test]
    fn test_create_and_reload_task() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        let task = new_task(&db, "log into the dashboard")?;
        let fetched = db.get_task(task.id)?.expect("task should exist");
        assert_eq!(fetched.instruction, "log into the dashboard");
        assert_eq!(fetched.platform, Platform::Web);
        assert_eq!(fetched.status, TaskStatus::Created);
        assert_eq!(fetched.base_path, format!("generated_code/{}", task.id));
        assert_eq!(
            fetched.additional_data.get("url").unwrap(),
            "https://example.com"
        );
        assert!(fetched.current_phase.is_none());
        Ok(())
    }

    #[test]
    fn test_get_missing_task_is_none() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        assert!(db.get_task(99)?.is_none());
        Ok(())
    }

    #[test]
    fn test_list_tasks_newest_first_with_limit() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        for i in 0..4 {
            new_task(&db, &format!("task {}", i))?;
        }
        let tasks = db.list_tasks(3)?;
        let ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![4, 3, 2]);
        Ok(())
    }

    #[test]
    fn test_transition_sets_flags_and_phase() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        let task = new_task(&db, "x")?;
        db.transition_task(
            task.id,
            &StatusChange::new(TaskStatus::Created, TaskStatus::BlueprintRunning),
        )?;
        let task = db.transition_task(
            task.id,
            &StatusChange::new(TaskStatus::BlueprintRunning, TaskStatus::BlueprintDone)
                .completing(Phase::Blueprint),
        )?;
        assert_eq!(task.status, TaskStatus::BlueprintDone);
        assert_eq!(task.current_phase, Some(Phase::Blueprint));
        assert!(task.blueprint_done);
        assert!(!task.code_done);
        Ok(())
    }

    #[test]
    fn test_transition_rejects_stale_from_status() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        let task = new_task(&db, "x")?;
        let err = db
            .transition_task(
                task.id,
                &StatusChange::new(TaskStatus::TestRunning, TaskStatus::TestDone),
            )
            .unwrap_err();
        assert!(err.to_string().contains("is created"));
        let reloaded = db.get_task(task.id)?.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Created);
        Ok(())
    }

    #[test]
    fn test_failure_records_error_and_phase() -> Result<()> {
        let db = TaskDb::new_in_memory()?;
        let task = new_task(&db, "x")?;
        let task = db.transition_task(
            task.id,
            &StatusChange::new(TaskStatus::Created, TaskStatus::Failed)
                .failing(Some(Phase::Blueprint), "cancelled"),
        )?;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("cancelled"));
        assert_eq!(task.failed_phase, Some(Phase::Blueprint));
        assert!(db.list_unfinished_tasks()?.is_empty());
        Ok(())
    }
}
