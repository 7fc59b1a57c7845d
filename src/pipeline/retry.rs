//! The Test ⇄ CodeGen retry loop.
//!
//! Each attempt provisions a fresh sandbox, runs the active script, asks the
//! test collaborator to judge it and tears the sandbox down again. A rejected
//! attempt becomes a feedback exchange with the code generator; the loop stops
//! on acceptance, on a declined improvement or once `max_attempts` executions
//! have been recorded.

use std::path::PathBuf;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::collaborators::{
    CodeArtifact, ExecutionSummary, Feedback, ImproveOutcome, ImproveRequest, StepResult,
    TestReport, TestRequest,
};
use super::controller::{PipelineController, collaborator_error};
use crate::errors::PipelineError;
use crate::models::{
    EnvironmentStatus, GeneratedArtifact, NewExecution, Phase, StepStatus, Task, TaskStatus,
};
use crate::store::{EnvironmentUpdate, StatusChange, StepOutcome};
use crate::supervisor::{ProvisionRequest, SandboxHandle};

/// Decides whether a test report is good enough to stop retrying.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptancePolicy {
    /// Share of passed steps, in `0.0..=1.0`, that accepts an attempt the
    /// collaborator itself did not mark successful.
    pub threshold: f64,
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        Self { threshold: 1.0 }
    }
}

impl AcceptancePolicy {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn accepts(&self, report: &TestReport) -> bool {
        if report.success {
            return true;
        }
        if report.step_results.is_empty() {
            return false;
        }
        let passed = report.step_results.iter().filter(|r| r.success).count();
        passed as f64 / report.step_results.len() as f64 >= self.threshold
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Accepted { attempts: u32 },
    Declined { attempts: u32, reason: String },
    Exhausted { attempts: u32 },
}

/// Result of a single provision → execute → judge round.
struct Attempt {
    accepted: bool,
    feedback: Feedback,
}

pub struct RetryCollaborationLoop<'a> {
    controller: &'a PipelineController,
    task_id: i64,
    cancel: &'a CancellationToken,
    policy: AcceptancePolicy,
    max_attempts: u32,
}

impl<'a> RetryCollaborationLoop<'a> {
    pub fn new(
        controller: &'a PipelineController,
        task_id: i64,
        cancel: &'a CancellationToken,
    ) -> Self {
        let settings = controller.settings();
        Self {
            controller,
            task_id,
            cancel,
            policy: AcceptancePolicy::new(settings.acceptance_threshold),
            max_attempts: settings.max_attempts.max(1),
        }
    }

    /// Drive the loop from `TestRunning` until the task reaches `TestDone`.
    ///
    /// The attempt number is derived from the recorded executions, so a task
    /// resumed after an improvement continues where it stopped.
    pub async fn run(self) -> Result<LoopOutcome, PipelineError> {
        let task_id = self.task_id;
        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { id: task_id });
            }

            let recorded = self
                .controller
                .store(move |db| db.count_executions(task_id))
                .await?;
            let attempt = u32::try_from(recorded).unwrap_or(u32::MAX).saturating_add(1);
            if attempt > self.max_attempts {
                return self.finish_exhausted(self.max_attempts).await;
            }

            let task = self.controller.load_task(task_id).await?;
            let (script, code) = self.controller.load_code_artifact(task_id).await?;
            tracing::info!(task_id, attempt, version = script.version, "Starting test attempt");

            let result = self.attempt(&task, attempt, &script, &code).await?;
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { id: task_id });
            }
            if result.accepted {
                self.controller
                    .transition(
                        task_id,
                        StatusChange::new(TaskStatus::TestRunning, TaskStatus::TestDone)
                            .completing(Phase::Test),
                    )
                    .await?;
                tracing::info!(task_id, attempt, "Attempt accepted");
                return Ok(LoopOutcome::Accepted { attempts: attempt });
            }
            if attempt >= self.max_attempts {
                return self.finish_exhausted(attempt).await;
            }

            if let Some(reason) = self
                .collaborate(&task, attempt, &script, code, result.feedback)
                .await?
            {
                return Ok(LoopOutcome::Declined {
                    attempts: attempt,
                    reason,
                });
            }
        }
    }

    async fn finish_exhausted(&self, attempts: u32) -> Result<LoopOutcome, PipelineError> {
        let reason = PipelineError::CollaborationExhausted { attempts }.to_string();
        tracing::warn!(task_id = self.task_id, attempts, "No attempt was accepted");
        self.controller
            .transition(
                self.task_id,
                StatusChange::new(TaskStatus::TestRunning, TaskStatus::TestDone)
                    .completing(Phase::Test)
                    .with_issues(reason),
            )
            .await?;
        Ok(LoopOutcome::Exhausted { attempts })
    }

    async fn attempt(
        &self,
        task: &Task,
        attempt: u32,
        script: &GeneratedArtifact,
        code: &CodeArtifact,
    ) -> Result<Attempt, PipelineError> {
        let task_id = self.task_id;
        self.controller
            .store(move |db| db.upsert_environment(task_id, "process", ""))
            .await?;

        let request = ProvisionRequest {
            task_id,
            platform: task.platform,
            dependencies: code.dependencies.clone(),
        };
        let supervisor = self.controller.supervisor();
        let provisioned = supervisor.provision(&request).await;
        if self.cancel.is_cancelled() {
            if let Ok(handle) = &provisioned {
                supervisor.teardown(handle).await;
            }
            return Err(PipelineError::Cancelled { id: task_id });
        }
        let handle = match provisioned {
            Ok(handle) => handle,
            Err(e) => {
                self.environment_failed(&e.to_string()).await?;
                if !e.is_retryable() {
                    return Err(e.into());
                }
                tracing::warn!(task_id, attempt, error = %e, "Provisioning did not finish");
                let summary = ExecutionSummary::from_error(e.to_string());
                return self.record(attempt, script, summary, None).await;
            }
        };
        self.environment_ready(&handle).await?;

        // Dropping the attempt on cancellation kills the running script.
        let judged = tokio::select! {
            judged = self.execute_and_judge(task, attempt, script, &handle) => Some(judged),
            _ = self.cancel.cancelled() => None,
        };
        supervisor.teardown(&handle).await;
        let Some(judged) = judged.filter(|_| !self.cancel.is_cancelled()) else {
            tracing::info!(task_id, attempt, "Attempt interrupted by cancellation");
            return Err(PipelineError::Cancelled { id: task_id });
        };
        let (summary, report) = judged?;
        self.record(attempt, script, summary, report).await
    }

    async fn execute_and_judge(
        &self,
        task: &Task,
        attempt: u32,
        script: &GeneratedArtifact,
        handle: &SandboxHandle,
    ) -> Result<(ExecutionSummary, Option<TestReport>), PipelineError> {
        let task_id = self.task_id;
        let settings = self.controller.settings();
        let artifact_path = PathBuf::from(&script.path);
        let output = match self
            .controller
            .supervisor()
            .execute(handle, &artifact_path, settings.execute_timeout)
            .await
        {
            Ok(output) => output,
            Err(e) if e.is_retryable() => {
                tracing::warn!(task_id, attempt, error = %e, "Execution did not finish");
                return Ok((ExecutionSummary::from_error(e.to_string()), None));
            }
            Err(e) => return Err(e.into()),
        };
        let summary = ExecutionSummary::from_output(&output);
        tracing::debug!(task_id, attempt, exit_code = ?output.exit_code, "Script finished");

        let steps = self
            .controller
            .store(move |db| db.list_steps(task_id))
            .await?;
        let request = TestRequest {
            task_id,
            attempt,
            platform: task.platform,
            artifact_path,
            artifact_version: script.version,
            sandbox: handle.clone(),
            execution: summary.clone(),
            steps,
        };
        self.controller.pace().await;
        let report = self
            .controller
            .collaborators()
            .test
            .run(&request)
            .await
            .map_err(|e| collaborator_error(Phase::Test, e))?;
        Ok((summary, Some(report)))
    }

    /// Persist step outcomes and the execution row for one attempt.
    async fn record(
        &self,
        attempt: u32,
        script: &GeneratedArtifact,
        summary: ExecutionSummary,
        report: Option<TestReport>,
    ) -> Result<Attempt, PipelineError> {
        let task_id = self.task_id;
        let accepted = report.as_ref().is_some_and(|r| self.policy.accepts(r));
        let feedback = build_feedback(attempt, script.version, &summary, report.as_ref());

        let step_results = report
            .as_ref()
            .map(|r| r.step_results.clone())
            .unwrap_or_default();
        let evidence = report
            .as_ref()
            .map(|r| r.evidence.clone())
            .unwrap_or_default();
        let error = if accepted {
            None
        } else {
            Some(feedback.issues.join("; "))
        };
        let execution = NewExecution {
            step_id: None,
            artifact_version: script.version,
            attempt_number: i64::from(attempt),
            success: accepted,
            output: Some(summary.stdout_tail.clone()).filter(|s| !s.is_empty()),
            error,
            exit_code: summary.exit_code.map(i64::from),
            duration_ms: summary.duration_ms as i64,
            evidence,
        };
        let max_attempts = self.max_attempts;
        self.controller
            .store(move |db| {
                let known: Vec<i64> = db
                    .list_steps(task_id)?
                    .iter()
                    .map(|s| s.step_order)
                    .collect();
                for result in &step_results {
                    if !known.contains(&result.step_order) {
                        tracing::warn!(task_id, step_order = result.step_order, "Ignoring result for unknown step");
                        continue;
                    }
                    db.record_step_outcome(task_id, result.step_order, &step_outcome(result))?;
                }
                db.record_execution(task_id, &execution, max_attempts)
            })
            .await?;

        Ok(Attempt { accepted, feedback })
    }

    /// Hand feedback to the code generator. Returns the decline reason when
    /// it refuses; otherwise the task is back in `TestRunning` with a new
    /// script version.
    async fn collaborate(
        &self,
        task: &Task,
        attempt: u32,
        script: &GeneratedArtifact,
        previous: CodeArtifact,
        feedback: Feedback,
    ) -> Result<Option<String>, PipelineError> {
        let task_id = self.task_id;
        let payload = serde_json::to_value(&feedback)
            .map_err(|e| PipelineError::persistence(e.into()))?;
        let max_attempts = self.max_attempts;
        let (comm, created) = self
            .controller
            .store(move |db| db.record_feedback(task_id, attempt, &payload, max_attempts))
            .await?;
        tracing::info!(task_id, attempt, communication = comm.id, created, "Feedback sent to code generation");

        self.controller
            .transition(
                task_id,
                StatusChange::new(TaskStatus::TestRunning, TaskStatus::CodeGenRunning),
            )
            .await?;

        let blueprint = self.controller.load_blueprint(task_id).await?;
        let request = ImproveRequest {
            task_id,
            instruction: task.instruction.clone(),
            blueprint,
            previous,
            previous_version: script.version,
            feedback,
        };
        self.controller.pace().await;
        let outcome = self
            .controller
            .collaborators()
            .codegen
            .improve(&request)
            .await
            .map_err(|e| collaborator_error(Phase::CodeGen, e))?;

        match outcome {
            ImproveOutcome::Improved(artifact) => {
                let stored = self.controller.store_code_artifact(task, &artifact).await?;
                let response = json!({"outcome": "improved", "version": stored.version});
                let comm_id = comm.id;
                self.controller
                    .store(move |db| db.resolve_communication(comm_id, &response))
                    .await?;
                tracing::info!(task_id, version = stored.version, "Code improved");

                self.controller
                    .transition(
                        task_id,
                        StatusChange::new(TaskStatus::CodeGenRunning, TaskStatus::CodeGenDone)
                            .completing(Phase::CodeGen),
                    )
                    .await?;
                self.controller
                    .transition(
                        task_id,
                        StatusChange::new(TaskStatus::CodeGenDone, TaskStatus::TestRunning),
                    )
                    .await?;
                Ok(None)
            }
            ImproveOutcome::Declined { reason } => {
                let response = json!({"outcome": "declined", "reason": reason});
                let comm_id = comm.id;
                self.controller
                    .store(move |db| db.resolve_communication(comm_id, &response))
                    .await?;
                tracing::warn!(task_id, reason = %reason, "Code generation declined to improve");

                self.controller
                    .transition(
                        task_id,
                        StatusChange::new(TaskStatus::CodeGenRunning, TaskStatus::TestDone)
                            .completing(Phase::Test)
                            .with_issues(format!("code generation declined: {}", reason)),
                    )
                    .await?;
                Ok(Some(reason))
            }
        }
    }

    async fn environment_ready(&self, handle: &SandboxHandle) -> Result<(), PipelineError> {
        let task_id = self.task_id;
        let tools = handle
            .tools_ready
            .iter()
            .map(|(name, ready)| (name.clone(), serde_json::Value::Bool(*ready)))
            .collect();
        let update = EnvironmentUpdate {
            location: Some(handle.path.display().to_string()),
            setup_status: Some(EnvironmentStatus::Ready),
            dependencies_installed: Some(handle.dependencies_installed),
            tools_ready: Some(tools),
            error: None,
        };
        self.controller
            .store(move |db| db.update_environment(task_id, &update))
            .await
    }

    async fn environment_failed(&self, error: &str) -> Result<(), PipelineError> {
        let task_id = self.task_id;
        let update = EnvironmentUpdate {
            setup_status: Some(EnvironmentStatus::Failed),
            error: Some(error.to_string()),
            ..Default::default()
        };
        self.controller
            .store(move |db| db.update_environment(task_id, &update))
            .await
    }
}

fn step_outcome(result: &StepResult) -> StepOutcome {
    StepOutcome {
        status: if result.success {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        },
        actual_result: result.actual_result.clone(),
        error: result.error.clone(),
        duration_ms: result.duration_ms,
    }
}

/// Assemble what the code generator gets to see about a failed attempt.
///
/// When the test collaborator reports no issues of its own, issues are
/// derived from the execution and from failed steps.
pub fn build_feedback(
    attempt: u32,
    artifact_version: i64,
    summary: &ExecutionSummary,
    report: Option<&TestReport>,
) -> Feedback {
    let failed_steps: Vec<StepResult> = report
        .map(|r| r.step_results.iter().filter(|s| !s.success).cloned().collect())
        .unwrap_or_default();

    let mut issues: Vec<String> = report.map(|r| r.issues.clone()).unwrap_or_default();
    if issues.is_empty() {
        if let Some(error) = &summary.error {
            issues.push(error.clone());
        } else if let Some(code) = summary.exit_code.filter(|c| *c != 0) {
            issues.push(format!("script exited with code {}", code));
        }
        for step in &failed_steps {
            issues.push(match &step.error {
                Some(err) => format!("step {} failed: {}", step.step_order, err),
                None => format!("step {} failed", step.step_order),
            });
        }
        if issues.is_empty() {
            issues.push("attempt was not accepted".to_string());
        }
    }

    Feedback {
        attempt,
        artifact_version,
        issues,
        suggestions: report.map(|r| r.suggestions.clone()).unwrap_or_default(),
        execution: summary.clone(),
        failed_steps,
    }
}
