use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::{TaskDb, json_column, parse_column};
use crate::models::{EnvironmentStatus, TestingEnvironment};

const ENV_COLUMNS: &str = "id, task_id, environment_type, location, dependencies_installed, tools_ready, setup_status, error, created_at, updated_at";

fn read_environment(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestingEnvironment> {
    let tools_ready = match json_column(row, 5)? {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Ok(TestingEnvironment {
        id: row.get(0)?,
        task_id: row.get(1)?,
        environment_type: row.get(2)?,
        location: row.get(3)?,
        dependencies_installed: row.get(4)?,
        tools_ready,
        setup_status: parse_column(row, 6)?,
        error: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Partial update of a task's environment row; `None` leaves a column as is.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentUpdate {
    pub location: Option<String>,
    pub setup_status: Option<EnvironmentStatus>,
    pub dependencies_installed: Option<bool>,
    pub tools_ready: Option<serde_json::Map<String, serde_json::Value>>,
    pub error: Option<String>,
}

impl TaskDb {
    /// Create the task's environment row, or reset it when the sandbox is
    /// recreated for another attempt.
    pub fn upsert_environment(
        &self,
        task_id: i64,
        environment_type: &str,
        location: &str,
    ) -> Result<TestingEnvironment> {
        self.conn
            .execute(
                "INSERT INTO testing_environments (task_id, environment_type, location, setup_status)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task_id) DO UPDATE SET
                    environment_type = excluded.environment_type,
                    location = excluded.location,
                    dependencies_installed = 0,
                    tools_ready = '{}',
                    setup_status = excluded.setup_status,
                    error = NULL,
                    updated_at = datetime('now')",
                params![
                    task_id,
                    environment_type,
                    location,
                    EnvironmentStatus::Pending.as_str()
                ],
            )
            .context("Failed to upsert environment")?;
        self.get_environment(task_id)?
            .context("Environment not found after upsert")
    }

    pub fn update_environment(&self, task_id: i64, update: &EnvironmentUpdate) -> Result<()> {
        let tools = update
            .tools_ready
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize tool readiness")?;
        let updated = self
            .conn
            .execute(
                "UPDATE testing_environments SET
                    location = COALESCE(?6, location),
                    setup_status = COALESCE(?1, setup_status),
                    dependencies_installed = COALESCE(?2, dependencies_installed),
                    tools_ready = COALESCE(?3, tools_ready),
                    error = COALESCE(?4, error),
                    updated_at = datetime('now')
                 WHERE task_id = ?5",
                params![
                    update.setup_status.map(|s| s.as_str()),
                    update.dependencies_installed,
                    tools,
                    update.error,
                    task_id,
                    update.location
                ],
            )
            .context("Failed to update environment")?;
        if updated == 0 {
            anyhow::bail!("Task {} has no environment", task_id);
        }
        Ok(())
    }

    pub fn get_environment(&self, task_id: i64) -> Result<Option<TestingEnvironment>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM testing_environments WHERE task_id = ?1",
                    ENV_COLUMNS
                ),
                params![task_id],
                read_environment,
            )
            .optional()
            .context("Failed to query environment")
    }
}
