//! Collaborators backed by external commands.
//!
//! Each phase is served by a shell command that reads the request as JSON on
//! stdin and prints its JSON response on stdout. A non-zero exit or output
//! that does not parse is a collaborator failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::collaborators::{
    Blueprint, BlueprintCollaborator, BlueprintRequest, CodeArtifact, CodeGenCollaborator,
    CodeGenRequest, Collaborators, ImproveOutcome, ImproveRequest, ReportArtifact,
    ReportCollaborator, ReportRequest, TestCollaborator, TestReport, TestRequest,
};
use crate::config::CollaboratorsSection;
use crate::models::Phase;

const STDERR_EXCERPT_CHARS: usize = 2000;

#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    phase: Phase,
    command: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandCollaborator {
    pub fn new(phase: Phase, command: impl Into<String>, working_dir: &Path, limit: Duration) -> Self {
        Self {
            phase,
            command: command.into(),
            working_dir: working_dir.to_path_buf(),
            timeout: limit,
        }
    }

    /// Run the command once for `operation`, feeding `request` on stdin.
    async fn invoke<Req, Resp>(&self, operation: &str, task_id: i64, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let input = serde_json::to_vec(request)
            .with_context(|| format!("Failed to serialize {} request", self.phase))?;
        tracing::debug!(phase = %self.phase, operation, task_id, command = %self.command, "Invoking collaborator");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("AUTOFLOW_PHASE", self.phase.as_str())
            .env("AUTOFLOW_OPERATION", operation)
            .env("AUTOFLOW_TASK_ID", task_id.to_string())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {} collaborator: {}", self.phase, self.command))?;

        // Feed stdin while draining output, both under the one timeout.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(&input).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };
        let exchange = async {
            let (fed, waited) = tokio::join!(feed, child.wait_with_output());
            fed.context("Failed to write request to collaborator stdin")?;
            waited.context("Failed to wait for collaborator")
        };

        let output = match timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => anyhow::bail!(
                "{} collaborator timed out after {:?}",
                self.phase,
                self.timeout
            ),
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            anyhow::bail!(
                "{} collaborator exited with code {}: {}",
                self.phase,
                output.status.code().unwrap_or(-1),
                super::collaborators::tail(stderr.trim(), STDERR_EXCERPT_CHARS)
            );
        }
        if !stderr.trim().is_empty() {
            tracing::debug!(phase = %self.phase, stderr = %stderr.trim(), "Collaborator stderr");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim()).with_context(|| {
            format!("{} collaborator returned invalid JSON", self.phase)
        })
    }
}

#[async_trait]
impl BlueprintCollaborator for CommandCollaborator {
    async fn generate(&self, request: &BlueprintRequest) -> Result<Blueprint> {
        self.invoke("generate", request.task_id, request).await
    }
}

#[async_trait]
impl CodeGenCollaborator for CommandCollaborator {
    async fn generate(&self, request: &CodeGenRequest) -> Result<CodeArtifact> {
        self.invoke("generate", request.task_id, request).await
    }

    async fn improve(&self, request: &ImproveRequest) -> Result<ImproveOutcome> {
        self.invoke("improve", request.task_id, request).await
    }
}

#[async_trait]
impl TestCollaborator for CommandCollaborator {
    async fn run(&self, request: &TestRequest) -> Result<TestReport> {
        self.invoke("run", request.task_id, request).await
    }
}

#[async_trait]
impl ReportCollaborator for CommandCollaborator {
    async fn summarize(&self, request: &ReportRequest) -> Result<Vec<ReportArtifact>> {
        self.invoke("summarize", request.task_id, request).await
    }
}

/// Build all four collaborators from the `[collaborators]` section.
pub fn collaborators_from_config(
    section: &CollaboratorsSection,
    working_dir: &Path,
) -> Result<Collaborators> {
    let limit = Duration::from_secs(section.timeout_secs);
    let build = |phase: Phase, command: &Option<String>| -> Result<Arc<CommandCollaborator>> {
        let command = command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .with_context(|| {
                format!(
                    "No {} collaborator configured. Set collaborators.{}_command in autoflow.toml",
                    phase,
                    phase.as_str().replace("code_gen", "codegen")
                )
            })?;
        Ok(Arc::new(CommandCollaborator::new(phase, command, working_dir, limit)))
    };
    Ok(Collaborators {
        blueprint: build(Phase::Blueprint, &section.blueprint_command)?,
        codegen: build(Phase::CodeGen, &section.codegen_command)?,
        test: build(Phase::Test, &section.test_command)?,
        report: build(Phase::Report, &section.report_command)?,
    })
}
