use anyhow::{Context, Result};
use rusqlite::params;

use super::{DbHandle, TaskDb};

/// Counter name backing task ids.
pub const TASK_SEQUENCE: &str = "task_id";

impl TaskDb {
    /// Make sure every counter exists and is never behind the ids already in
    /// use (e.g. a database written before the counter table existed).
    pub(super) fn seed_sequences(&self) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO sequences (name, value) VALUES (?1, 0)",
                params![TASK_SEQUENCE],
            )
            .context("Failed to insert task sequence")?;
        self.conn
            .execute(
                "UPDATE sequences
                 SET value = MAX(value, (SELECT COALESCE(MAX(id), 0) FROM tasks))
                 WHERE name = ?1",
                params![TASK_SEQUENCE],
            )
            .context("Failed to align task sequence")?;
        Ok(())
    }

    /// Increment and return the named counter.
    pub fn next_sequence_value(&self, name: &str) -> Result<i64> {
        self.conn
            .query_row(
                "UPDATE sequences SET value = value + 1 WHERE name = ?1 RETURNING value",
                params![name],
                |row| row.get(0),
            )
            .with_context(|| format!("Failed to advance sequence '{}'", name))
    }

    pub fn allocate_task_id(&self) -> Result<i64> {
        self.next_sequence_value(TASK_SEQUENCE)
    }

    /// Current value of the counter without advancing it.
    pub fn peek_sequence_value(&self, name: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT value FROM sequences WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .with_context(|| format!("Failed to read sequence '{}'", name))
    }
}

/// Issues unique, strictly increasing task ids.
///
/// The counter is a row in the database, so ids survive restarts and an id
/// handed out for a task that later failed (or was never persisted) is never
/// reissued. Concurrent callers are serialized by the `DbHandle` mutex.
#[derive(Clone)]
pub struct SequenceAllocator {
    db: DbHandle,
}

impl SequenceAllocator {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn allocate(&self) -> Result<i64> {
        self.db.call(|db| db.allocate_task_id()).await
    }
}
