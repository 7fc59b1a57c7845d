use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, params};

use super::{TaskDb, json_column, optional_json_column, parse_column};
use crate::models::{AgentCommunication, CommunicationStatus, MessageType, Phase};

const COMM_COLUMNS: &str = "id, task_id, from_phase, to_phase, message_type, attempt, request_payload, response_payload, status, created_at, resolved_at";

fn read_communication(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentCommunication> {
    Ok(AgentCommunication {
        id: row.get(0)?,
        task_id: row.get(1)?,
        from_phase: parse_column(row, 2)?,
        to_phase: parse_column(row, 3)?,
        message_type: parse_column(row, 4)?,
        attempt: row.get(5)?,
        request_payload: json_column(row, 6)?,
        response_payload: optional_json_column(row, 7)?,
        status: parse_column(row, 8)?,
        created_at: row.get(9)?,
        resolved_at: row.get(10)?,
    })
}

impl TaskDb {
    /// Record Test → CodeGen feedback for `attempt` as a pending exchange.
    ///
    /// Idempotent per attempt: if feedback for this attempt already exists,
    /// that row is returned with `false` and nothing is written. Refuses to
    /// create a row once the task already holds `max_attempts - 1` exchanges.
    pub fn record_feedback(
        &self,
        task_id: i64,
        attempt: u32,
        payload: &serde_json::Value,
        max_attempts: u32,
    ) -> Result<(AgentCommunication, bool)> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {} FROM agent_communications
                     WHERE task_id = ?1 AND attempt = ?2 AND message_type = ?3",
                    COMM_COLUMNS
                ),
                params![task_id, attempt, MessageType::CodeIssue.as_str()],
                read_communication,
            )
            .optional()
            .context("Failed to look up feedback")?;
        if let Some(comm) = existing {
            return Ok((comm, false));
        }

        let count: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM agent_communications WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to count communications")?;
        let bound = i64::from(max_attempts.saturating_sub(1));
        if count >= bound {
            anyhow::bail!(
                "Task {} already has {} collaborations (bound {})",
                task_id,
                count,
                bound
            );
        }

        let payload_json =
            serde_json::to_string(payload).context("Failed to serialize feedback")?;
        tx.execute(
            "INSERT INTO agent_communications
                (task_id, from_phase, to_phase, message_type, attempt, request_payload, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task_id,
                Phase::Test.as_str(),
                Phase::CodeGen.as_str(),
                MessageType::CodeIssue.as_str(),
                attempt,
                payload_json,
                CommunicationStatus::Pending.as_str()
            ],
        )
        .context("Failed to insert communication")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("Failed to commit communication")?;

        let comm = self
            .get_communication(id)?
            .context("Communication not found after insert")?;
        Ok((comm, true))
    }

    pub fn get_communication(&self, id: i64) -> Result<Option<AgentCommunication>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM agent_communications WHERE id = ?1", COMM_COLUMNS),
                params![id],
                read_communication,
            )
            .optional()
            .context("Failed to query communication")
    }

    /// Attach CodeGen's answer to a pending exchange.
    pub fn resolve_communication(&self, id: i64, response: &serde_json::Value) -> Result<()> {
        let response_json =
            serde_json::to_string(response).context("Failed to serialize response")?;
        let updated = self
            .conn
            .execute(
                "UPDATE agent_communications
                 SET response_payload = ?1, status = ?2, resolved_at = datetime('now')
                 WHERE id = ?3 AND status = ?4",
                params![
                    response_json,
                    CommunicationStatus::Resolved.as_str(),
                    id,
                    CommunicationStatus::Pending.as_str()
                ],
            )
            .context("Failed to resolve communication")?;
        if updated == 0 {
            anyhow::bail!("Communication {} is not pending", id);
        }
        Ok(())
    }

    pub fn list_communications(&self, task_id: i64) -> Result<Vec<AgentCommunication>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM agent_communications WHERE task_id = ?1 ORDER BY attempt, id",
                COMM_COLUMNS
            ))
            .context("Failed to prepare list_communications")?;
        let rows = stmt
            .query_map(params![task_id], read_communication)
            .context("Failed to query communications")?;
        let mut comms = Vec::new();
        for row in rows {
            comms.push(row.context("Failed to read communication row")?);
        }
        Ok(comms)
    }

    pub fn count_communications(&self, task_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM agent_communications WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to count communications")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use serde_json::json;

    fn setup() -> Result<(TaskDb, i64)> {
        let db = TaskDb::new_in_memory()?;
        let id = db.allocate_task_id()?;
        db.create_task(id, "x", Platform::Web, &Default::default(), "generated_code/1")?;
        Ok((db, id))
    }

    #[test]
    fn test_feedback_is_idempotent_per_attempt() -> Result<()> {
        let (db, id) = setup()?;
        let payload = json!({"issues": ["timeout on login"]});
        let (first, created) = db.record_feedback(id, 1, &payload, 3)?;
        assert!(created);
        assert_eq!(first.status, CommunicationStatus::Pending);
        assert_eq!(first.from_phase, Phase::Test);
        assert_eq!(first.to_phase, Phase::CodeGen);

        let (again, created) = db.record_feedback(id, 1, &json!({"different": true}), 3)?;
        assert!(!created);
        assert_eq!(again.id, first.id);
        assert_eq!(again.request_payload, payload);
        assert_eq!(db.count_communications(id)?, 1);
        Ok(())
    }

    #[test]
    fn test_feedback_bound_is_enforced() -> Result<()> {
        let (db, id) = setup()?;
        db.record_feedback(id, 1, &json!({}), 3)?;
        db.record_feedback(id, 2, &json!({}), 3)?;
        let err = db.record_feedback(id, 3, &json!({}), 3).unwrap_err();
        assert!(err.to_string().contains("bound 2"));
        assert_eq!(db.count_communications(id)?, 2);
        Ok(())
    }

    #[test]
    fn test_resolve_sets_response_once() -> Result<()> {
        let (db, id) = setup()?;
        let (comm, _) = db.record_feedback(id, 1, &json!({"issues": []}), 3)?;
        db.resolve_communication(comm.id, &json!({"outcome": "improved", "version": 2}))?;
        let resolved = db.get_communication(comm.id)?.unwrap();
        assert_eq!(resolved.status, CommunicationStatus::Resolved);
        assert_eq!(resolved.response_payload.unwrap()["version"], 2);
        assert!(resolved.resolved_at.is_some());
        assert!(db.resolve_communication(comm.id, &json!({})).is_err());
        Ok(())
    }

    #[test]
    fn test_list_orders_by_attempt() -> Result<()> {
        let (db, id) = setup()?;
        db.record_feedback(id, 2, &json!({}), 5)?;
        db.record_feedback(id, 1, &json!({}), 5)?;
        let attempts: Vec<i64> = db
            .list_communications(id)?
            .iter()
            .map(|c| c.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
        Ok(())
    }
}
