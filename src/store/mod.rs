//! Durable task store backed by SQLite.
//!
//! `TaskDb` owns the connection and the schema; each submodule adds one
//! table's worth of queries as an `impl TaskDb` block. Async callers go
//! through `DbHandle`, which serializes every access behind one mutex and
//! runs it on tokio's blocking pool. That single writer is what makes the
//! sequence allocator and the per-task compare-and-set transitions safe
//! under concurrent pipelines.

mod artifacts;
mod communications;
mod environments;
mod executions;
mod sequence;
mod steps;
mod tasks;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use rusqlite::types::Type;

pub use artifacts::NewArtifact;
pub use environments::EnvironmentUpdate;
pub use sequence::{SequenceAllocator, TASK_SEQUENCE};
pub use steps::StepOutcome;
pub use tasks::StatusChange;

/// Async-safe handle to the task database.
///
/// Wraps `TaskDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TaskDb>>,
}

impl DbHandle {
    pub fn new(db: TaskDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self::new(TaskDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(TaskDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TaskDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup code,
    /// the CLI and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, TaskDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct TaskDb {
    conn: Connection,
}

impl TaskDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        self.seed_sequences().context("Failed to seed sequences")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sequences (
                    name TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY,
                    instruction TEXT NOT NULL,
                    platform TEXT NOT NULL DEFAULT 'auto-detect',
                    additional_data TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL DEFAULT 'created',
                    blueprint_done INTEGER NOT NULL DEFAULT 0,
                    code_done INTEGER NOT NULL DEFAULT 0,
                    test_done INTEGER NOT NULL DEFAULT 0,
                    report_done INTEGER NOT NULL DEFAULT 0,
                    has_issues INTEGER NOT NULL DEFAULT 0,
                    base_path TEXT NOT NULL,
                    current_phase TEXT,
                    last_error TEXT,
                    failed_phase TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    name TEXT NOT NULL,
                    step_order INTEGER NOT NULL,
                    action_type TEXT NOT NULL,
                    expected_result TEXT,
                    actual_result TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    started_at TEXT,
                    completed_at TEXT,
                    duration_ms INTEGER,
                    error TEXT,
                    UNIQUE(task_id, step_order)
                );

                CREATE TABLE IF NOT EXISTS agent_communications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    from_phase TEXT NOT NULL,
                    to_phase TEXT NOT NULL,
                    message_type TEXT NOT NULL,
                    attempt INTEGER NOT NULL,
                    request_payload TEXT NOT NULL,
                    response_payload TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    resolved_at TEXT,
                    UNIQUE(task_id, attempt, message_type)
                );

                CREATE TABLE IF NOT EXISTS generated_artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    phase TEXT NOT NULL,
                    name TEXT NOT NULL,
                    path TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    size INTEGER NOT NULL DEFAULT 0,
                    checksum TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(task_id, kind, version)
                );

                CREATE TABLE IF NOT EXISTS testing_environments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL UNIQUE REFERENCES tasks(id) ON DELETE CASCADE,
                    environment_type TEXT NOT NULL,
                    location TEXT NOT NULL,
                    dependencies_installed INTEGER NOT NULL DEFAULT 0,
                    tools_ready TEXT NOT NULL DEFAULT '{}',
                    setup_status TEXT NOT NULL DEFAULT 'pending',
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS test_executions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    step_id INTEGER REFERENCES workflow_steps(id),
                    artifact_version INTEGER NOT NULL,
                    attempt_number INTEGER NOT NULL,
                    success INTEGER NOT NULL DEFAULT 0,
                    output TEXT,
                    error TEXT,
                    exit_code INTEGER,
                    duration_ms INTEGER NOT NULL DEFAULT 0,
                    evidence TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_steps_task ON workflow_steps(task_id);
                CREATE INDEX IF NOT EXISTS idx_comms_task ON agent_communications(task_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_task ON generated_artifacts(task_id, kind);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_artifacts_one_active
                    ON generated_artifacts(task_id, kind) WHERE is_active = 1;
                CREATE INDEX IF NOT EXISTS idx_execs_task ON test_executions(task_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_execs_attempt
                    ON test_executions(task_id, attempt_number) WHERE step_id IS NULL;
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Names of the tables this store manages, for diagnostics.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .context("Failed to prepare table_names")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query sqlite_master")?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.context("Failed to read table name")?);
        }
        Ok(names)
    }
}

/// Read a text column and parse it with the type's `FromStr`.
pub(crate) fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Read a text column holding JSON.
pub(crate) fn json_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a nullable text column holding JSON.
pub(crate) fn optional_json_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        serde_json::from_str(&r)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}
