//! Per-task execution sandboxes.
//!
//! A sandbox is a directory under the sandbox root with its own dependency
//! set, provisioned before a test attempt and torn down after it. The
//! supervisor caps how many sandboxes are alive at once with a semaphore
//! and keeps one live sandbox per task at most.

pub mod probe;
pub mod sandbox;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::SupervisorError;
use crate::models::Platform;
pub use sandbox::SupervisorConfig;

/// What the pipeline needs provisioned for one attempt.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub task_id: i64,
    pub platform: Platform,
    /// Package requirements declared by the current artifact version.
    pub dependencies: Vec<String>,
}

/// A live sandbox. Cheap to clone; only the supervisor owns its resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: Uuid,
    pub task_id: i64,
    pub path: PathBuf,
    pub environment_type: String,
    pub dependencies_installed: bool,
    pub tools_ready: BTreeMap<String, bool>,
}

/// Result of running an artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait EnvironmentSupervisor: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<SandboxHandle, SupervisorError>;

    /// Run `artifact` inside the sandbox, killing it once `timeout` passes.
    async fn execute(
        &self,
        handle: &SandboxHandle,
        artifact: &Path,
        timeout: Duration,
    ) -> Result<ExecutionOutput, SupervisorError>;

    /// Best-effort cleanup. Never fails; problems are logged.
    async fn teardown(&self, handle: &SandboxHandle);

    /// Tear down whatever is live for `task_id`, if anything.
    async fn teardown_task(&self, task_id: i64);
}

struct LiveSandbox {
    id: Uuid,
    path: PathBuf,
    /// Cancelled on teardown; running children watch it.
    stop: CancellationToken,
    _permit: OwnedSemaphorePermit,
}

/// Supervisor running sandboxes as plain directories and OS processes.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    permits: Arc<Semaphore>,
    live: Mutex<HashMap<i64, LiveSandbox>>,
    http: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            permits,
            live: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    async fn setup(
        &self,
        request: &ProvisionRequest,
        handle: &mut SandboxHandle,
    ) -> Result<(), SupervisorError> {
        let task_id = request.task_id;
        sandbox::recreate_dir(task_id, &handle.path).await?;

        if let Some(template) = &self.config.create_env_command {
            let command =
                sandbox::render_template(template, &handle.path, &self.config.interpreter, None);
            let out = sandbox::run_shell(
                task_id,
                "create environment",
                &command,
                &handle.path,
                &self.config.env,
                self.config.install_timeout,
            )
            .await?;
            if out.exit_code != 0 {
                return Err(SupervisorError::Environment {
                    task_id,
                    message: format!(
                        "environment command exited with {}: {}",
                        out.exit_code,
                        out.stderr.trim()
                    ),
                });
            }
        }

        if !request.dependencies.is_empty() {
            let requirements = handle.path.join("requirements.txt");
            let mut content = request.dependencies.join("\n");
            content.push('\n');
            tokio::fs::write(&requirements, content)
                .await
                .map_err(|e| SupervisorError::Environment {
                    task_id,
                    message: format!("failed to write {}: {}", requirements.display(), e),
                })?;
            let command = sandbox::render_template(
                &self.config.install_command,
                &handle.path,
                &self.config.interpreter,
                Some(&requirements),
            );
            let out = sandbox::run_shell(
                task_id,
                "install dependencies",
                &command,
                &handle.path,
                &self.config.env,
                self.config.install_timeout,
            )
            .await?;
            if out.exit_code != 0 {
                return Err(SupervisorError::Dependency {
                    exit_code: out.exit_code,
                    stderr: out.stderr.trim().to_string(),
                });
            }
        }
        handle.dependencies_installed = true;

        for tool in self
            .config
            .tools
            .iter()
            .filter(|t| t.applies_to(request.platform))
        {
            tool.wait_until_ready(
                &self.http,
                self.config.tool_ready_timeout,
                self.config.tool_poll_interval,
            )
            .await?;
            handle.tools_ready.insert(tool.name.clone(), true);
        }
        Ok(())
    }

    async fn release(&self, task_id: i64, only: Option<Uuid>) {
        let entry = {
            let mut live = self.live.lock().await;
            match live.get(&task_id) {
                Some(sb) if only.is_none_or(|id| id == sb.id) => live.remove(&task_id),
                _ => None,
            }
        };
        let Some(sandbox) = entry else {
            return;
        };
        sandbox.stop.cancel();
        if let Err(e) = tokio::fs::remove_dir_all(&sandbox.path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(task_id, path = %sandbox.path.display(), error = %e, "Failed to remove sandbox");
        }
        tracing::debug!(task_id, sandbox = %sandbox.id, "Sandbox released");
    }
}

#[async_trait]
impl EnvironmentSupervisor for ProcessSupervisor {
    async fn provision(&self, request: &ProvisionRequest) -> Result<SandboxHandle, SupervisorError> {
        let task_id = request.task_id;
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SupervisorError::Environment {
                task_id,
                message: "supervisor worker pool closed".to_string(),
            })?;

        let mut handle = SandboxHandle {
            id: Uuid::new_v4(),
            task_id,
            path: self.config.sandbox_dir(task_id),
            environment_type: "process".to_string(),
            dependencies_installed: false,
            tools_ready: BTreeMap::new(),
        };

        {
            let mut live = self.live.lock().await;
            if live.contains_key(&task_id) {
                return Err(SupervisorError::Environment {
                    task_id,
                    message: "a sandbox is already live for this task".to_string(),
                });
            }
            live.insert(
                task_id,
                LiveSandbox {
                    id: handle.id,
                    path: handle.path.clone(),
                    stop: CancellationToken::new(),
                    _permit: permit,
                },
            );
        }

        tracing::info!(task_id, sandbox = %handle.id, path = %handle.path.display(), "Provisioning sandbox");
        match self.setup(request, &mut handle).await {
            Ok(()) => Ok(handle),
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Provisioning failed");
                self.release(task_id, Some(handle.id)).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        artifact: &Path,
        timeout: Duration,
    ) -> Result<ExecutionOutput, SupervisorError> {
        let stop = {
            let live = self.live.lock().await;
            match live.get(&handle.task_id) {
                Some(sb) if sb.id == handle.id => sb.stop.clone(),
                _ => {
                    return Err(SupervisorError::Environment {
                        task_id: handle.task_id,
                        message: format!("sandbox {} is not live", handle.id),
                    });
                }
            }
        };

        let artifact_name = artifact.display().to_string();
        let interpreter = self.config.interpreter_for(&handle.path);
        let child = Command::new(&interpreter)
            .arg(artifact)
            .current_dir(&handle.path)
            .envs(&self.config.env)
            .env("AUTOFLOW_TASK_ID", handle.task_id.to_string())
            .env("AUTOFLOW_SANDBOX", &handle.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Execution {
                artifact: artifact_name.clone(),
                source,
            })?;

        let start = Instant::now();
        // Dropping the wait future drops the child, and kill_on_drop kills it.
        let result = tokio::select! {
            res = tokio::time::timeout(timeout, child.wait_with_output()) => res,
            _ = stop.cancelled() => {
                return Err(SupervisorError::Execution {
                    artifact: artifact_name,
                    source: std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "sandbox torn down during execution",
                    ),
                });
            }
        };

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(SupervisorError::Execution {
                    artifact: artifact_name,
                    source,
                });
            }
            Err(_) => {
                tracing::warn!(task_id = handle.task_id, artifact = %artifact_name, limit_secs = timeout.as_secs_f64(), "Execution timed out, child killed");
                return Err(SupervisorError::Timeout {
                    operation: format!("execute {}", artifact_name),
                    limit: timeout,
                });
            }
        };

        let out = ExecutionOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        };
        tracing::debug!(task_id = handle.task_id, exit_code = ?out.exit_code, duration_ms = out.duration.as_millis() as u64, "Artifact finished");
        Ok(out)
    }

    async fn teardown(&self, handle: &SandboxHandle) {
        self.release(handle.task_id, Some(handle.id)).await;
    }

    async fn teardown_task(&self, task_id: i64) {
        self.release(task_id, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::probe::{ToolCheck, ToolSpec};

    fn config(root: &Path) -> SupervisorConfig {
        SupervisorConfig {
            sandbox_root: root.to_path_buf(),
            interpreter: "sh".into(),
            install_command: "cat {requirements} > installed.txt".into(),
            install_timeout: Duration::from_secs(5),
            tool_ready_timeout: Duration::from_millis(200),
            tool_poll_interval: Duration::from_millis(50),
            ..SupervisorConfig::default()
        }
    }

    fn request(task_id: i64) -> ProvisionRequest {
        ProvisionRequest {
            task_id,
            platform: Platform::Web,
            dependencies: Vec::new(),
        }
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("script.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_provision_execute_teardown() {
        let root = tempfile::tempdir().unwrap();
        let code = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(config(root.path()));

        let mut req = request(1);
        req.dependencies = vec!["selenium==4.0".into(), "requests".into()];
        let handle = sup.provision(&req).await.unwrap();
        assert_eq!(handle.path, root.path().join("task-1"));
        assert!(handle.dependencies_installed);
        let installed = std::fs::read_to_string(handle.path.join("installed.txt")).unwrap();
        assert_eq!(installed, "selenium==4.0\nrequests\n");

        let artifact = script(code.path(), "echo ran in $AUTOFLOW_SANDBOX; echo warn >&2; exit 0");
        let out = sup
            .execute(&handle, &artifact, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("task-1"));
        assert_eq!(out.stderr.trim(), "warn");

        sup.teardown(&handle).await;
        assert!(!handle.path.exists());
        assert_eq!(sup.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported_not_raised() {
        let root = tempfile::tempdir().unwrap();
        let code = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(config(root.path()));
        let handle = sup.provision(&request(2)).await.unwrap();
        let artifact = script(code.path(), "exit 3");
        let out = sup
            .execute(&handle, &artifact, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        sup.teardown(&handle).await;
    }

    #[tokio::test]
    async fn test_execute_timeout_kills_child() {
        let root = tempfile::tempdir().unwrap();
        let code = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(config(root.path()));
        let handle = sup.provision(&request(3)).await.unwrap();
        let artifact = script(code.path(), "sleep 10");
        let start = Instant::now();
        let err = sup
            .execute(&handle, &artifact, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
        sup.teardown(&handle).await;
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_execution_error() {
        let root = tempfile::tempdir().unwrap();
        let code = tempfile::tempdir().unwrap();
        let mut cfg = config(root.path());
        cfg.interpreter = "/nonexistent/interpreter".into();
        let sup = ProcessSupervisor::new(cfg);
        let handle = sup.provision(&request(4)).await.unwrap();
        let artifact = script(code.path(), "exit 0");
        let err = sup
            .execute(&handle, &artifact, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Execution { .. }));
        sup.teardown(&handle).await;
    }

    #[tokio::test]
    async fn test_dependency_failure() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(root.path());
        cfg.install_command = "echo no such package >&2; exit 1".into();
        let sup = ProcessSupervisor::new(cfg);
        let mut req = request(5);
        req.dependencies = vec!["does-not-exist".into()];
        let err = sup.provision(&req).await.unwrap_err();
        match err {
            SupervisorError::Dependency { exit_code, stderr } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "no such package");
            }
            other => panic!("Expected Dependency, got {:?}", other),
        }
        assert_eq!(sup.live_count().await, 0);
        assert!(!root.path().join("task-5").exists());
    }

    #[tokio::test]
    async fn test_create_env_failure_is_environment_error() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(root.path());
        cfg.create_env_command = Some("exit 9".into());
        let sup = ProcessSupervisor::new(cfg);
        let err = sup.provision(&request(6)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Environment { task_id: 6, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_tool_fails_provisioning() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(root.path());
        cfg.tools = vec![
            ToolSpec {
                name: "device-driver".into(),
                platform: Platform::Mobile,
                check: ToolCheck::Command {
                    command: "exit 1".into(),
                },
            },
            ToolSpec {
                name: "browser".into(),
                platform: Platform::Web,
                check: ToolCheck::Command {
                    command: "exit 0".into(),
                },
            },
        ];
        let sup = ProcessSupervisor::new(cfg);

        let web = sup.provision(&request(7)).await.unwrap();
        assert_eq!(web.tools_ready.get("browser"), Some(&true));
        assert!(!web.tools_ready.contains_key("device-driver"));
        sup.teardown(&web).await;

        let mut mobile = request(8);
        mobile.platform = Platform::Mobile;
        let err = sup.provision(&mobile).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ToolUnavailable { ref tool, .. } if tool == "device-driver"));
        assert_eq!(sup.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_one_live_sandbox_per_task() {
        let root = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(config(root.path()));
        let handle = sup.provision(&request(10)).await.unwrap();
        let err = sup.provision(&request(10)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Environment { .. }));
        sup.teardown(&handle).await;
        let again = sup.provision(&request(10)).await.unwrap();
        sup.teardown_task(10).await;
        assert_eq!(sup.live_count().await, 0);
        assert!(!again.path.exists());
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_live_sandboxes() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(root.path());
        cfg.max_concurrent = 1;
        let sup = ProcessSupervisor::new(cfg);

        let first = sup.provision(&request(20)).await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(150), sup.provision(&request(21))).await;
        assert!(blocked.is_err(), "second sandbox should wait for a permit");

        sup.teardown(&first).await;
        let second = sup.provision(&request(21)).await.unwrap();
        sup.teardown(&second).await;
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_tear_down_new_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(config(root.path()));
        let old = sup.provision(&request(30)).await.unwrap();
        sup.teardown(&old).await;
        let new = sup.provision(&request(30)).await.unwrap();
        sup.teardown(&old).await;
        assert_eq!(sup.live_count().await, 1);
        sup.teardown(&new).await;
    }
}
