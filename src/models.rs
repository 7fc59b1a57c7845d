//! Persisted domain types shared by the store, the pipeline and the CLI.
//!
//! Every enum that is written to SQLite has an `as_str()` / `FromStr` pair so
//! the database holds stable snake_case strings instead of discriminants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a task as driven by the pipeline controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    BlueprintRunning,
    BlueprintDone,
    CodeGenRunning,
    CodeGenDone,
    TestRunning,
    TestDone,
    ReportRunning,
    Completed,
    CompletedWithIssues,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::BlueprintRunning => "blueprint_running",
            Self::BlueprintDone => "blueprint_done",
            Self::CodeGenRunning => "code_gen_running",
            Self::CodeGenDone => "code_gen_done",
            Self::TestRunning => "test_running",
            Self::TestDone => "test_done",
            Self::ReportRunning => "report_running",
            Self::Completed => "completed",
            Self::CompletedWithIssues => "completed_with_issues",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithIssues | Self::Failed
        )
    }

    /// True for the `*Running` states, i.e. a phase body is in flight.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::BlueprintRunning | Self::CodeGenRunning | Self::TestRunning | Self::ReportRunning
        )
    }

    /// The phase this status belongs to, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::BlueprintRunning | Self::BlueprintDone => Some(Phase::Blueprint),
            Self::CodeGenRunning | Self::CodeGenDone => Some(Phase::CodeGen),
            Self::TestRunning | Self::TestDone => Some(Phase::Test),
            Self::ReportRunning | Self::Completed | Self::CompletedWithIssues => {
                Some(Phase::Report)
            }
            Self::Created | Self::Failed => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "blueprint_running" => Ok(Self::BlueprintRunning),
            "blueprint_done" => Ok(Self::BlueprintDone),
            "code_gen_running" => Ok(Self::CodeGenRunning),
            "code_gen_done" => Ok(Self::CodeGenDone),
            "test_running" => Ok(Self::TestRunning),
            "test_done" => Ok(Self::TestDone),
            "report_running" => Ok(Self::ReportRunning),
            "completed" => Ok(Self::Completed),
            "completed_with_issues" => Ok(Self::CompletedWithIssues),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// One of the four fixed pipeline stages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Blueprint,
    CodeGen,
    Test,
    Report,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blueprint => "blueprint",
            Self::CodeGen => "code_gen",
            Self::Test => "test",
            Self::Report => "report",
        }
    }

    /// Subdirectory of the task tree that holds this phase's artifacts.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Blueprint => "blueprint",
            Self::CodeGen => "code",
            Self::Test => "test",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blueprint" => Ok(Self::Blueprint),
            "code_gen" => Ok(Self::CodeGen),
            "test" => Ok(Self::Test),
            "report" => Ok(Self::Report),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Target platform of the automation request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    #[default]
    AutoDetect,
    Web,
    Mobile,
    Both,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoDetect => "auto-detect",
            Self::Web => "web",
            Self::Mobile => "mobile",
            Self::Both => "both",
        }
    }

    /// Whether a tool declared for `other` must be ready for this platform.
    pub fn covers(&self, other: Platform) -> bool {
        match (self, other) {
            (_, Platform::AutoDetect) => true,
            (Platform::Both, _) => true,
            (a, b) => *a == b,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto-detect" | "auto" => Ok(Self::AutoDetect),
            "web" | "browser" => Ok(Self::Web),
            "mobile" | "android" | "ios" => Ok(Self::Mobile),
            "both" => Ok(Self::Both),
            _ => Err(format!(
                "Invalid platform '{}'. Valid values: auto-detect, web, mobile, both",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub instruction: String,
    pub platform: Platform,
    pub additional_data: serde_json::Map<String, serde_json::Value>,
    pub status: TaskStatus,
    pub blueprint_done: bool,
    pub code_done: bool,
    pub test_done: bool,
    pub report_done: bool,
    /// Set when the test phase ended without an accepted attempt.
    pub has_issues: bool,
    pub base_path: String,
    pub current_phase: Option<Phase>,
    pub last_error: Option<String>,
    pub failed_phase: Option<Phase>,
    pub created_at: String,
    pub updated_at: String,
}

/// Raw row before enum/JSON parsing, mirrors the `tasks` table column order.
pub(crate) struct TaskRow {
    pub id: i64,
    pub instruction: String,
    pub platform: String,
    pub additional_data: String,
    pub status: String,
    pub blueprint_done: bool,
    pub code_done: bool,
    pub test_done: bool,
    pub report_done: bool,
    pub has_issues: bool,
    pub base_path: String,
    pub current_phase: Option<String>,
    pub last_error: Option<String>,
    pub failed_phase: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    pub fn into_task(self) -> anyhow::Result<Task> {
        let additional_data = match serde_json::from_str::<serde_json::Value>(&self.additional_data)
        {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) | Err(_) => serde_json::Map::new(),
        };
        Ok(Task {
            id: self.id,
            instruction: self.instruction,
            platform: self.platform.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            additional_data,
            status: self.status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            blueprint_done: self.blueprint_done,
            code_done: self.code_done,
            test_done: self.test_done,
            report_done: self.report_done,
            has_issues: self.has_issues,
            base_path: self.base_path,
            current_phase: parse_optional(self.current_phase)?,
            last_error: self.last_error,
            failed_phase: parse_optional(self.failed_phase)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub(crate) fn parse_optional<T>(value: Option<String>) -> anyhow::Result<Option<T>>
where
    T: FromStr<Err = String>,
{
    value
        .map(|v| v.parse::<T>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// A step declared by the blueprint phase, before it is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub name: String,
    pub action_type: String,
    #[serde(default)]
    pub expected_result: Option<String>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: i64,
    pub task_id: i64,
    pub phase: Phase,
    pub name: String,
    pub step_order: i64,
    pub action_type: String,
    pub expected_result: Option<String>,
    pub actual_result: Option<String>,
    pub status: StepStatus,
    pub attempt_count: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Test → CodeGen: the attempt failed, here is what went wrong.
    CodeIssue,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeIssue => "code_issue",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code_issue" => Ok(Self::CodeIssue),
            _ => Err(format!("Invalid message type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationStatus {
    Pending,
    Resolved,
}

impl CommunicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }
}

impl FromStr for CommunicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("Invalid communication status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommunication {
    pub id: i64,
    pub task_id: i64,
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub message_type: MessageType,
    pub attempt: i64,
    pub request_payload: serde_json::Value,
    pub response_payload: Option<serde_json::Value>,
    pub status: CommunicationStatus,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Blueprint,
    Script,
    Requirements,
    Report,
    Log,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blueprint => "blueprint",
            Self::Script => "script",
            Self::Requirements => "requirements",
            Self::Report => "report",
            Self::Log => "log",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blueprint" => Ok(Self::Blueprint),
            "script" => Ok(Self::Script),
            "requirements" => Ok(Self::Requirements),
            "report" => Ok(Self::Report),
            "log" => Ok(Self::Log),
            _ => Err(format!("Invalid artifact kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub id: i64,
    pub task_id: i64,
    pub phase: Phase,
    pub name: String,
    pub path: String,
    pub kind: ArtifactKind,
    pub version: i64,
    pub is_active: bool,
    pub size: i64,
    pub checksum: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Pending,
    Setup,
    Ready,
    Failed,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Setup => "setup",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for EnvironmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "setup" => Ok(Self::Setup),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid environment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestingEnvironment {
    pub id: i64,
    pub task_id: i64,
    pub environment_type: String,
    pub location: String,
    pub dependencies_installed: bool,
    pub tools_ready: serde_json::Map<String, serde_json::Value>,
    pub setup_status: EnvironmentStatus,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestExecution {
    pub id: i64,
    pub task_id: i64,
    pub step_id: Option<i64>,
    pub artifact_version: i64,
    pub attempt_number: i64,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub duration_ms: i64,
    pub evidence: Vec<String>,
    pub created_at: String,
}

/// Values for a new `test_executions` row.
#[derive(Debug, Clone, Default)]
pub struct NewExecution {
    pub step_id: Option<i64>,
    pub artifact_version: i64,
    pub attempt_number: i64,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i64>,
    pub duration_ms: i64,
    pub evidence: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_str() {
        let all = [
            TaskStatus::Created,
            TaskStatus::BlueprintRunning,
            TaskStatus::BlueprintDone,
            TaskStatus::CodeGenRunning,
            TaskStatus::CodeGenDone,
            TaskStatus::TestRunning,
            TaskStatus::TestDone,
            TaskStatus::ReportRunning,
            TaskStatus::Completed,
            TaskStatus::CompletedWithIssues,
            TaskStatus::Failed,
        ];
        for status in all {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::CompletedWithIssues.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::TestDone.is_terminal());
        assert!(TaskStatus::TestRunning.is_running());
        assert!(!TaskStatus::TestDone.is_running());
    }

    #[test]
    fn platform_aliases_parse() {
        assert_eq!("browser".parse::<Platform>().unwrap(), Platform::Web);
        assert_eq!("Android".parse::<Platform>().unwrap(), Platform::Mobile);
        assert_eq!("auto".parse::<Platform>().unwrap(), Platform::AutoDetect);
        assert!("desktop".parse::<Platform>().is_err());
    }

    #[test]
    fn platform_covers_tools() {
        assert!(Platform::Both.covers(Platform::Mobile));
        assert!(Platform::Web.covers(Platform::AutoDetect));
        assert!(!Platform::Web.covers(Platform::Mobile));
        assert!(Platform::Mobile.covers(Platform::Mobile));
    }

    #[test]
    fn step_spec_keeps_unknown_fields() {
        let spec: StepSpec = serde_json::from_str(
            r##"{"name":"open","action_type":"navigate","selector":"#login"}"##,
        )
        .unwrap();
        assert_eq!(spec.name, "open");
        assert!(spec.expected_result.is_none());
        assert_eq!(spec.extra.get("selector").unwrap(), "#login");
    }

    #[test]
    fn task_row_tolerates_non_object_additional_data() {
        let row = TaskRow {
            id: 1,
            instruction: "x".into(),
            platform: "web".into(),
            additional_data: "[1,2]".into(),
            status: "created".into(),
            blueprint_done: false,
            code_done: false,
            test_done: false,
            report_done: false,
            has_issues: false,
            base_path: "generated_code/1".into(),
            current_phase: Some("blueprint".into()),
            last_error: None,
            failed_phase: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let task = row.into_task().unwrap();
        assert!(task.additional_data.is_empty());
        assert_eq!(task.current_phase, Some(Phase::Blueprint));
    }
}
