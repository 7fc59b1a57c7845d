use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::{TaskDb, parse_column};
use crate::models::{ArtifactKind, GeneratedArtifact, Phase};

const ARTIFACT_COLUMNS: &str =
    "id, task_id, phase, name, path, kind, version, is_active, size, checksum, created_at";

fn read_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<GeneratedArtifact> {
    Ok(GeneratedArtifact {
        id: row.get(0)?,
        task_id: row.get(1)?,
        phase: parse_column(row, 2)?,
        name: row.get(3)?,
        path: row.get(4)?,
        kind: parse_column(row, 5)?,
        version: row.get(6)?,
        is_active: row.get(7)?,
        size: row.get(8)?,
        checksum: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// A file already written to the task tree, about to be registered.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub task_id: i64,
    pub phase: Phase,
    pub kind: ArtifactKind,
    pub name: String,
    pub path: String,
    pub size: i64,
    pub checksum: String,
}

impl TaskDb {
    /// Version the next artifact of `kind` would receive.
    pub fn next_artifact_version(&self, task_id: i64, kind: ArtifactKind) -> Result<i64> {
        let max: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM generated_artifacts
                 WHERE task_id = ?1 AND kind = ?2",
                params![task_id, kind.as_str()],
                |row| row.get(0),
            )
            .context("Failed to read artifact version")?;
        Ok(max + 1)
    }

    /// Append a new version and make it the only active one for its kind.
    pub fn record_artifact(&self, artifact: &NewArtifact) -> Result<GeneratedArtifact> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let version: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM generated_artifacts
                 WHERE task_id = ?1 AND kind = ?2",
                params![artifact.task_id, artifact.kind.as_str()],
                |row| row.get(0),
            )
            .context("Failed to compute artifact version")?;

        tx.execute(
            "UPDATE generated_artifacts SET is_active = 0
             WHERE task_id = ?1 AND kind = ?2 AND is_active = 1",
            params![artifact.task_id, artifact.kind.as_str()],
        )
        .context("Failed to deactivate previous artifact")?;

        tx.execute(
            "INSERT INTO generated_artifacts
                (task_id, phase, name, path, kind, version, is_active, size, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
            params![
                artifact.task_id,
                artifact.phase.as_str(),
                artifact.name,
                artifact.path,
                artifact.kind.as_str(),
                version,
                artifact.size,
                artifact.checksum
            ],
        )
        .context("Failed to insert artifact")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("Failed to commit artifact")?;

        self.conn
            .query_row(
                &format!("SELECT {} FROM generated_artifacts WHERE id = ?1", ARTIFACT_COLUMNS),
                params![id],
                read_artifact,
            )
            .context("Artifact not found after insert")
    }

    /// The current version of `kind`. This is the only notion of "latest".
    pub fn active_artifact(
        &self,
        task_id: i64,
        kind: ArtifactKind,
    ) -> Result<Option<GeneratedArtifact>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM generated_artifacts
                     WHERE task_id = ?1 AND kind = ?2 AND is_active = 1",
                    ARTIFACT_COLUMNS
                ),
                params![task_id, kind.as_str()],
                read_artifact,
            )
            .optional()
            .context("Failed to query active artifact")
    }

    pub fn list_artifacts(&self, task_id: i64) -> Result<Vec<GeneratedArtifact>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM generated_artifacts WHERE task_id = ?1 ORDER BY kind, version",
                ARTIFACT_COLUMNS
            ))
            .context("Failed to prepare list_artifacts")?;
        let rows = stmt
            .query_map(params![task_id], read_artifact)
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row.context("Failed to read artifact row")?);
        }
        Ok(artifacts)
    }
}
