//! The pipeline controller: drives one task through Blueprint → CodeGen →
//! Test → Report, persisting every transition before the next phase starts.
//!
//! The controller never trusts in-memory state across phases. Each turn of
//! the run loop re-reads the task and dispatches on the stored status, which
//! is also what makes `resume` work after a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::collaborators::{
    Blueprint, BlueprintRequest, CodeArtifact, CodeGenRequest, Collaborators, ReportRequest,
};
use super::retry::RetryCollaborationLoop;
use super::state::validate_transition;
use crate::config::AutoflowConfig;
use crate::errors::PipelineError;
use crate::models::{ArtifactKind, GeneratedArtifact, Phase, Platform, Task, TaskStatus};
use crate::store::{DbHandle, NewArtifact, SequenceAllocator, StatusChange, TaskDb};
use crate::supervisor::EnvironmentSupervisor;

/// Reason recorded on a task stopped by its caller.
pub const CANCELLED_REASON: &str = "cancelled";

/// Tunables for the controller and its retry loop.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_attempts: u32,
    pub acceptance_threshold: f64,
    pub pacing_delay: Duration,
    pub execute_timeout: Duration,
    pub generated_root: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            acceptance_threshold: 1.0,
            pacing_delay: Duration::ZERO,
            execute_timeout: Duration::from_secs(120),
            generated_root: PathBuf::from("generated_code"),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &AutoflowConfig) -> Self {
        let pipeline = &config.toml.pipeline;
        Self {
            max_attempts: pipeline.max_attempts,
            acceptance_threshold: pipeline.acceptance_threshold,
            pacing_delay: Duration::from_millis(pipeline.pacing_delay_ms),
            execute_timeout: Duration::from_secs(config.toml.supervisor.execute_timeout_secs),
            generated_root: config.generated_root(),
        }
    }
}

/// A caller's automation request, validated by `submit`.
#[derive(Debug, Clone, Default)]
pub struct TaskRequest {
    pub instruction: String,
    /// Empty means auto-detect.
    pub platform: String,
    pub attachments: Vec<PathBuf>,
    pub additional_data: serde_json::Map<String, serde_json::Value>,
}

pub struct PipelineController {
    db: DbHandle,
    allocator: SequenceAllocator,
    supervisor: Arc<dyn EnvironmentSupervisor>,
    collaborators: Collaborators,
    settings: PipelineSettings,
    poisoned: AtomicBool,
}

impl PipelineController {
    pub fn new(
        db: DbHandle,
        supervisor: Arc<dyn EnvironmentSupervisor>,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            allocator: SequenceAllocator::new(db.clone()),
            db,
            supervisor,
            collaborators,
            settings,
            poisoned: AtomicBool::new(false),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub(crate) fn supervisor(&self) -> &Arc<dyn EnvironmentSupervisor> {
        &self.supervisor
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// True once a store write has failed; the controller refuses further work.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn ensure_healthy(&self) -> Result<(), PipelineError> {
        if self.is_poisoned() {
            return Err(PipelineError::persistence(anyhow::anyhow!(
                "controller halted after an earlier persistence failure"
            )));
        }
        Ok(())
    }

    /// Run `f` against the store. Any failure poisons the controller.
    pub(crate) async fn store<F, R>(&self, f: F) -> Result<R, PipelineError>
    where
        F: FnOnce(&TaskDb) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.db.call(f).await.map_err(|e| self.halt(e))
    }

    /// Poison the controller and wrap `err` as a persistence failure.
    fn halt(&self, err: anyhow::Error) -> PipelineError {
        if !self.poisoned.swap(true, Ordering::SeqCst) {
            tracing::error!(error = %format!("{:#}", err), "Persistence failure, halting controller");
        }
        PipelineError::persistence(err)
    }

    pub(crate) async fn load_task(&self, task_id: i64) -> Result<Task, PipelineError> {
        self.store(move |db| db.get_task(task_id))
            .await?
            .ok_or(PipelineError::TaskNotFound { id: task_id })
    }

    /// Validate against the state machine, then compare-and-set in the store.
    pub(crate) async fn transition(
        &self,
        task_id: i64,
        change: StatusChange,
    ) -> Result<Task, PipelineError> {
        validate_transition(change.from, change.to)?;
        let (from, to) = (change.from, change.to);
        let task = self
            .store(move |db| db.transition_task(task_id, &change))
            .await?;
        tracing::info!(task_id, %from, %to, "Task status changed");
        Ok(task)
    }

    /// Await the configured delay before talking to a collaborator.
    pub(crate) async fn pace(&self) {
        if !self.settings.pacing_delay.is_zero() {
            tokio::time::sleep(self.settings.pacing_delay).await;
        }
    }

    /// Validate a request, allocate an id and persist the task.
    pub async fn submit(&self, request: TaskRequest) -> Result<Task, PipelineError> {
        self.ensure_healthy()?;

        let instruction = request.instruction.trim().to_string();
        if instruction.is_empty() {
            return Err(PipelineError::Validation(
                "instruction must not be empty".to_string(),
            ));
        }
        let platform = if request.platform.trim().is_empty() {
            Platform::AutoDetect
        } else {
            request
                .platform
                .trim()
                .parse::<Platform>()
                .map_err(PipelineError::Validation)?
        };
        for attachment in &request.attachments {
            if !attachment.is_file() {
                return Err(PipelineError::Validation(format!(
                    "attachment not found: {}",
                    attachment.display()
                )));
            }
        }

        let mut additional_data = request.additional_data;
        if !request.attachments.is_empty() {
            let paths = request
                .attachments
                .iter()
                .map(|p| serde_json::Value::String(p.display().to_string()))
                .collect();
            additional_data.insert("attachments".to_string(), serde_json::Value::Array(paths));
        }

        let task_id = self.allocator.allocate().await.map_err(|e| self.halt(e))?;

        let base = self.settings.generated_root.join(task_id.to_string());
        for phase in [Phase::Blueprint, Phase::CodeGen, Phase::Test, Phase::Report] {
            let dir = base.join(phase.dir_name());
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))
                .map_err(|e| self.halt(e))?;
        }

        let base_path = base.display().to_string();
        let task = self
            .store(move |db| {
                db.create_task(task_id, &instruction, platform, &additional_data, &base_path)
            })
            .await?;
        tracing::info!(task_id, platform = %platform, "Task submitted");
        Ok(task)
    }

    /// Submit and drive the task to a terminal status.
    pub async fn submit_and_run(&self, request: TaskRequest) -> Result<Task, PipelineError> {
        let task = self.submit(request).await?;
        self.run(task.id).await
    }

    pub async fn run(&self, task_id: i64) -> Result<Task, PipelineError> {
        self.run_with_cancel(task_id, &CancellationToken::new()).await
    }

    /// Continue a task from its stored status.
    ///
    /// Tasks left in a `*Running` status were interrupted mid-phase and are
    /// failed; `*Done` and `Created` tasks pick up with the next phase.
    pub async fn resume(&self, task_id: i64) -> Result<Task, PipelineError> {
        self.run(task_id).await
    }

    /// Drive a task until it reaches a terminal status.
    ///
    /// Phase failures are recorded on the task and returned as `Ok` with
    /// status `Failed`; only errors that stop state tracking itself
    /// (persistence, unknown task) come back as `Err`.
    pub async fn run_with_cancel(
        &self,
        task_id: i64,
        cancel: &CancellationToken,
    ) -> Result<Task, PipelineError> {
        loop {
            self.ensure_healthy()?;
            let task = self.load_task(task_id).await?;
            if task.status.is_terminal() {
                tracing::info!(task_id, status = %task.status, "Task finished");
                return Ok(task);
            }
            if cancel.is_cancelled() {
                self.cancel_task(task_id).await?;
                continue;
            }

            let result = match task.status {
                TaskStatus::Created => self.blueprint_phase(&task).await,
                TaskStatus::BlueprintDone => self.codegen_phase(&task).await,
                TaskStatus::CodeGenDone => self.test_phase(&task, cancel).await,
                TaskStatus::TestDone => self.report_phase(&task).await,
                running => {
                    let phase = running.phase().map(|p| p.as_str()).unwrap_or("unknown");
                    tracing::warn!(task_id, status = %running, "Found interrupted task");
                    self.fail_task(task_id, &format!("interrupted during {}", phase))
                        .await?;
                    continue;
                }
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_persistence() => return Err(e),
                Err(PipelineError::Cancelled { .. }) => {
                    self.cancel_task(task_id).await?;
                }
                Err(e) if cancel.is_cancelled() => {
                    tracing::debug!(task_id, error = %e, "Phase error after cancellation");
                    self.cancel_task(task_id).await?;
                }
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "Phase failed");
                    self.fail_task(task_id, &e.to_string()).await?;
                }
            }
        }
    }

    /// Move a non-terminal task to `Failed`, recording the phase it was in.
    pub(crate) async fn fail_task(&self, task_id: i64, reason: &str) -> Result<Task, PipelineError> {
        let task = self.load_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        let phase = task
            .status
            .phase()
            .or(task.current_phase)
            .or(Some(Phase::Blueprint));
        let task = self
            .transition(
                task_id,
                StatusChange::new(task.status, TaskStatus::Failed).failing(phase, reason),
            )
            .await?;
        self.supervisor.teardown_task(task_id).await;
        Ok(task)
    }

    /// Record a cancellation and release the task's sandbox.
    pub async fn cancel_task(&self, task_id: i64) -> Result<Task, PipelineError> {
        tracing::info!(task_id, "Cancelling task");
        self.fail_task(task_id, CANCELLED_REASON).await
    }

    async fn blueprint_phase(&self, task: &Task) -> Result<(), PipelineError> {
        let task_id = task.id;
        self.transition(
            task_id,
            StatusChange::new(TaskStatus::Created, TaskStatus::BlueprintRunning),
        )
        .await?;

        let attachments = task
            .additional_data
            .get("attachments")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(PathBuf::from))
                    .collect()
            })
            .unwrap_or_default();
        let request = BlueprintRequest {
            task_id,
            instruction: task.instruction.clone(),
            platform: task.platform,
            attachments,
            additional_data: task.additional_data.clone(),
        };

        self.pace().await;
        let blueprint = self
            .collaborators
            .blueprint
            .generate(&request)
            .await
            .map_err(|e| collaborator_error(Phase::Blueprint, e))?;
        tracing::info!(task_id, steps = blueprint.steps.len(), "Blueprint generated");

        let content = serde_json::to_vec_pretty(&blueprint)
            .context("Failed to serialize blueprint")
            .map_err(|e| self.halt(e))?;
        self.write_artifact(task, Phase::Blueprint, ArtifactKind::Blueprint, "blueprint.json", &content)
            .await?;
        let steps = blueprint.steps.clone();
        self.store(move |db| db.create_steps(task_id, Phase::Blueprint, &steps))
            .await?;

        self.transition(
            task_id,
            StatusChange::new(TaskStatus::BlueprintRunning, TaskStatus::BlueprintDone)
                .completing(Phase::Blueprint),
        )
        .await?;
        Ok(())
    }

    async fn codegen_phase(&self, task: &Task) -> Result<(), PipelineError> {
        let task_id = task.id;
        self.transition(
            task_id,
            StatusChange::new(TaskStatus::BlueprintDone, TaskStatus::CodeGenRunning),
        )
        .await?;

        let blueprint = self.load_blueprint(task_id).await?;
        let request = CodeGenRequest {
            task_id,
            instruction: task.instruction.clone(),
            platform: task.platform,
            blueprint,
            additional_data: task.additional_data.clone(),
        };

        self.pace().await;
        let artifact = self
            .collaborators
            .codegen
            .generate(&request)
            .await
            .map_err(|e| collaborator_error(Phase::CodeGen, e))?;
        let script = self.store_code_artifact(task, &artifact).await?;
        tracing::info!(task_id, version = script.version, file = %script.name, "Code generated");

        self.transition(
            task_id,
            StatusChange::new(TaskStatus::CodeGenRunning, TaskStatus::CodeGenDone)
                .completing(Phase::CodeGen),
        )
        .await?;
        Ok(())
    }

    async fn test_phase(&self, task: &Task, cancel: &CancellationToken) -> Result<(), PipelineError> {
        self.transition(
            task.id,
            StatusChange::new(TaskStatus::CodeGenDone, TaskStatus::TestRunning),
        )
        .await?;
        let outcome = RetryCollaborationLoop::new(self, task.id, cancel)
            .run()
            .await?;
        tracing::info!(task_id = task.id, outcome = ?outcome, "Test phase finished");
        Ok(())
    }

    async fn report_phase(&self, task: &Task) -> Result<(), PipelineError> {
        let task_id = task.id;
        self.transition(
            task_id,
            StatusChange::new(TaskStatus::TestDone, TaskStatus::ReportRunning),
        )
        .await?;

        let (steps, artifacts, executions) = self
            .store(move |db| {
                Ok((
                    db.list_steps(task_id)?,
                    db.list_artifacts(task_id)?,
                    db.list_executions(task_id)?,
                ))
            })
            .await?;
        let request = ReportRequest {
            task_id,
            instruction: task.instruction.clone(),
            has_issues: task.has_issues,
            last_error: task.last_error.clone(),
            steps,
            artifacts,
            executions,
        };

        self.pace().await;
        let reports = self
            .collaborators
            .report
            .summarize(&request)
            .await
            .map_err(|e| collaborator_error(Phase::Report, e))?;
        for report in &reports {
            self.write_artifact(
                task,
                Phase::Report,
                ArtifactKind::Report,
                &report.name,
                report.content.as_bytes(),
            )
            .await?;
        }

        let final_status = if task.has_issues {
            TaskStatus::CompletedWithIssues
        } else {
            TaskStatus::Completed
        };
        self.transition(
            task_id,
            StatusChange::new(TaskStatus::ReportRunning, final_status).completing(Phase::Report),
        )
        .await?;
        Ok(())
    }

    /// Write `content` into the task tree as the next version of `kind` and
    /// register it. The new row becomes the only active one of its kind.
    pub(crate) async fn write_artifact(
        &self,
        task: &Task,
        phase: Phase,
        kind: ArtifactKind,
        file_name: &str,
        content: &[u8],
    ) -> Result<GeneratedArtifact, PipelineError> {
        let task_id = task.id;
        let version = self
            .store(move |db| db.next_artifact_version(task_id, kind))
            .await?;
        let name = versioned_name(file_name, version);
        let dir = Path::new(&task.base_path).join(phase.dir_name());
        let path = dir.join(&name);

        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))
            .map_err(|e| self.halt(e))?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write artifact {}", path.display()))
            .map_err(|e| self.halt(e))?;

        let record = NewArtifact {
            task_id,
            phase,
            kind,
            name,
            path: path.display().to_string(),
            size: content.len() as i64,
            checksum: checksum(content),
        };
        let artifact = self.store(move |db| db.record_artifact(&record)).await?;
        if artifact.version != version {
            return Err(self.halt(anyhow::anyhow!(
                "artifact version raced for task {}: expected {}, stored {}",
                task_id,
                version,
                artifact.version
            )));
        }
        tracing::debug!(task_id, kind = kind.as_str(), version, path = %artifact.path, "Artifact stored");
        Ok(artifact)
    }

    /// Store a script and its requirements list as a matching version pair.
    pub(crate) async fn store_code_artifact(
        &self,
        task: &Task,
        artifact: &CodeArtifact,
    ) -> Result<GeneratedArtifact, PipelineError> {
        let script = self
            .write_artifact(
                task,
                Phase::CodeGen,
                ArtifactKind::Script,
                &artifact.file_name,
                artifact.content.as_bytes(),
            )
            .await?;
        let mut requirements = artifact.dependencies.join("\n");
        if !requirements.is_empty() {
            requirements.push('\n');
        }
        self.write_artifact(
            task,
            Phase::CodeGen,
            ArtifactKind::Requirements,
            "requirements.txt",
            requirements.as_bytes(),
        )
        .await?;
        Ok(script)
    }

    pub(crate) async fn load_blueprint(&self, task_id: i64) -> Result<Blueprint, PipelineError> {
        let artifact = self
            .store(move |db| db.active_artifact(task_id, ArtifactKind::Blueprint))
            .await?
            .ok_or_else(|| {
                self.halt(anyhow::anyhow!("task {} has no blueprint", task_id))
            })?;
        let raw = tokio::fs::read(&artifact.path)
            .await
            .with_context(|| format!("Failed to read blueprint {}", artifact.path))
            .map_err(|e| self.halt(e))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse blueprint {}", artifact.path))
            .map_err(|e| self.halt(e))
    }

    /// The active script, its content and its requirements.
    pub(crate) async fn load_code_artifact(
        &self,
        task_id: i64,
    ) -> Result<(GeneratedArtifact, CodeArtifact), PipelineError> {
        let (script, requirements) = self
            .store(move |db| {
                Ok((
                    db.active_artifact(task_id, ArtifactKind::Script)?,
                    db.active_artifact(task_id, ArtifactKind::Requirements)?,
                ))
            })
            .await?;
        let script = script.ok_or_else(|| {
            self.halt(anyhow::anyhow!("task {} has no script", task_id))
        })?;
        let content = tokio::fs::read_to_string(&script.path)
            .await
            .with_context(|| format!("Failed to read script {}", script.path))
            .map_err(|e| self.halt(e))?;
        let dependencies = match requirements {
            Some(req) => tokio::fs::read_to_string(&req.path)
                .await
                .with_context(|| format!("Failed to read requirements {}", req.path))
                .map_err(|e| self.halt(e))?
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };
        let code = CodeArtifact {
            file_name: unversioned_name(&script.name, script.version),
            content,
            dependencies,
            extra: Default::default(),
        };
        Ok((script, code))
    }
}

pub(crate) fn collaborator_error(phase: Phase, err: anyhow::Error) -> PipelineError {
    PipelineError::Collaborator {
        phase,
        message: format!("{:#}", err),
    }
}

fn checksum(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// `script.py` + 2 → `script_v2.py`. Directory components are dropped.
pub fn versioned_name(file_name: &str, version: i64) -> String {
    let base = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "..")
        .unwrap_or("artifact");
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_v{}.{}", stem, version, ext),
        _ => format!("{}_v{}", base, version),
    }
}

/// Inverse of `versioned_name`.
pub fn unversioned_name(name: &str, version: i64) -> String {
    let suffix = format!("_v{}", version);
    match name.rsplit_once('.') {
        Some((stem, ext)) if stem.ends_with(&suffix) => {
            format!("{}.{}", &stem[..stem.len() - suffix.len()], ext)
        }
        _ => name.strip_suffix(&suffix).unwrap_or(name).to_string(),
    }
}
