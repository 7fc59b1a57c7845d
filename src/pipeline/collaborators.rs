//! Contracts for the four external phase collaborators and the payloads
//! exchanged with them.
//!
//! Every payload carries an `extra` map flattened into its JSON form, so a
//! collaborator can return fields this crate does not know about yet and
//! they survive a round trip.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{GeneratedArtifact, Platform, StepSpec, TestExecution, WorkflowStep};
use crate::supervisor::{ExecutionOutput, SandboxHandle};

pub type Extra = serde_json::Map<String, serde_json::Value>;

const OUTPUT_TAIL_CHARS: usize = 4000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintRequest {
    pub task_id: i64,
    pub instruction: String,
    pub platform: Platform,
    pub attachments: Vec<PathBuf>,
    pub additional_data: Extra,
}

/// The plan produced by the blueprint phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    #[serde(default)]
    pub summary: String,
    pub steps: Vec<StepSpec>,
    #[serde(default, flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeGenRequest {
    pub task_id: i64,
    pub instruction: String,
    pub platform: Platform,
    pub blueprint: Blueprint,
    pub additional_data: Extra,
}

/// One generated script plus the packages it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeArtifact {
    #[serde(default = "default_file_name")]
    pub file_name: String,
    pub content: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, flatten)]
    pub extra: Extra,
}

fn default_file_name() -> String {
    "script.py".to_string()
}

/// Execution facts attached to feedback and test requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout_tail: String,
    pub stderr_tail: String,
    /// Set when the run did not finish (timeout, spawn failure).
    pub error: Option<String>,
}

impl ExecutionSummary {
    pub fn from_output(output: &ExecutionOutput) -> Self {
        Self {
            exit_code: output.exit_code,
            duration_ms: output.duration.as_millis() as u64,
            stdout_tail: tail(&output.stdout, OUTPUT_TAIL_CHARS),
            stderr_tail: tail(&output.stderr, OUTPUT_TAIL_CHARS),
            error: None,
        }
    }

    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Last `max` characters of `s`.
pub fn tail(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}

/// Test → CodeGen feedback for one failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub attempt: u32,
    pub artifact_version: i64,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub execution: ExecutionSummary,
    #[serde(default)]
    pub failed_steps: Vec<StepResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImproveRequest {
    pub task_id: i64,
    pub instruction: String,
    pub blueprint: Blueprint,
    pub previous: CodeArtifact,
    pub previous_version: i64,
    pub feedback: Feedback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImproveOutcome {
    Improved(CodeArtifact),
    Declined { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRequest {
    pub task_id: i64,
    pub attempt: u32,
    pub platform: Platform,
    pub artifact_path: PathBuf,
    pub artifact_version: i64,
    pub sandbox: SandboxHandle,
    pub execution: ExecutionSummary,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_order: i64,
    pub success: bool,
    #[serde(default)]
    pub actual_result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub success: bool,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    /// References (paths, URLs) to screenshots, logs and the like.
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default, flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub task_id: i64,
    pub instruction: String,
    pub has_issues: bool,
    pub last_error: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub artifacts: Vec<GeneratedArtifact>,
    pub executions: Vec<TestExecution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportArtifact {
    pub name: String,
    pub content: String,
    #[serde(default, flatten)]
    pub extra: Extra,
}

#[async_trait]
pub trait BlueprintCollaborator: Send + Sync {
    async fn generate(&self, request: &BlueprintRequest) -> Result<Blueprint>;
}

#[async_trait]
pub trait CodeGenCollaborator: Send + Sync {
    async fn generate(&self, request: &CodeGenRequest) -> Result<CodeArtifact>;

    async fn improve(&self, request: &ImproveRequest) -> Result<ImproveOutcome>;
}

#[async_trait]
pub trait TestCollaborator: Send + Sync {
    async fn run(&self, request: &TestRequest) -> Result<TestReport>;
}

#[async_trait]
pub trait ReportCollaborator: Send + Sync {
    async fn summarize(&self, request: &ReportRequest) -> Result<Vec<ReportArtifact>>;
}

/// The set of collaborators a controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub blueprint: Arc<dyn BlueprintCollaborator>,
    pub codegen: Arc<dyn CodeGenCollaborator>,
    pub test: Arc<dyn TestCollaborator>,
    pub report: Arc<dyn ReportCollaborator>,
}
