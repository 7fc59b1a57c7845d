//! Full audit bundle of one task, for offline inspection.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{
    AgentCommunication, GeneratedArtifact, Task, TestExecution, TestingEnvironment, WorkflowStep,
};
use crate::store::{DbHandle, TaskDb};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAudit {
    pub exported_at: String,
    pub task: Task,
    pub steps: Vec<WorkflowStep>,
    pub communications: Vec<AgentCommunication>,
    pub artifacts: Vec<GeneratedArtifact>,
    pub environment: Option<TestingEnvironment>,
    pub executions: Vec<TestExecution>,
}

impl TaskAudit {
    pub fn collect(db: &TaskDb, task_id: i64) -> Result<Self> {
        let task = db
            .get_task(task_id)?
            .with_context(|| format!("Task {} not found", task_id))?;
        Ok(Self {
            exported_at: chrono::Utc::now().to_rfc3339(),
            task,
            steps: db.list_steps(task_id)?,
            communications: db.list_communications(task_id)?,
            artifacts: db.list_artifacts(task_id)?,
            environment: db.get_environment(task_id)?,
            executions: db.list_executions(task_id)?,
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize audit")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write audit to {}", path.display()))
    }
}

pub async fn export_task(db: &DbHandle, task_id: i64) -> Result<TaskAudit> {
    db.call(move |db| TaskAudit::collect(db, task_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewExecution, Phase, Platform, StepSpec};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_export_bundles_everything() -> Result<()> {
        let db = DbHandle::in_memory()?;
        let id = db
            .call(|db| {
                let id = db.allocate_task_id()?;
                db.create_task(id, "search", Platform::Web, &Default::default(), "generated_code/1")?;
                db.create_steps(
                    id,
                    Phase::Blueprint,
                    &[StepSpec {
                        name: "open".into(),
                        action_type: "navigate".into(),
                        expected_result: None,
                        extra: Default::default(),
                    }],
                )?;
                db.upsert_environment(id, "process", "/tmp/task-1")?;
                db.record_execution(
                    id,
                    &NewExecution {
                        artifact_version: 1,
                        attempt_number: 1,
                        success: true,
                        ..Default::default()
                    },
                    3,
                )?;
                Ok(id)
            })
            .await?;

        let audit = export_task(&db, id).await?;
        assert_eq!(audit.task.id, id);
        assert_eq!(audit.steps.len(), 1);
        assert_eq!(audit.executions.len(), 1);
        assert!(audit.environment.is_some());
        assert!(audit.communications.is_empty());

        let dir = tempdir()?;
        let path = dir.path().join("out").join("audit.json");
        audit.write_json(&path)?;
        let back: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(back["task"]["instruction"], "search");
        assert_eq!(back["steps"][0]["name"], "open");
        Ok(())
    }

    #[tokio::test]
    async fn test_export_unknown_task() -> Result<()> {
        let db = DbHandle::in_memory()?;
        let err = export_task(&db, 42).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        Ok(())
    }
}
