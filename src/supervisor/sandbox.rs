use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::probe::ToolSpec;
use crate::config::SupervisorSection;
use crate::errors::SupervisorError;

/// Runtime settings for the process supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub sandbox_root: PathBuf,
    /// Program used to run artifacts; may contain `{sandbox}`.
    pub interpreter: String,
    pub create_env_command: Option<String>,
    pub install_command: String,
    pub install_timeout: Duration,
    pub execute_timeout: Duration,
    pub tool_ready_timeout: Duration,
    pub tool_poll_interval: Duration,
    pub max_concurrent: usize,
    pub env: HashMap<String, String>,
    pub tools: Vec<ToolSpec>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_section(&SupervisorSection::default(), PathBuf::from(".autoflow/sandboxes"))
    }
}

impl SupervisorConfig {
    /// Build from the `[supervisor]` section with `sandbox_root` already
    /// resolved against the project directory.
    pub fn from_section(section: &SupervisorSection, sandbox_root: PathBuf) -> Self {
        Self {
            sandbox_root,
            interpreter: section.interpreter.clone(),
            create_env_command: section
                .create_env_command
                .clone()
                .filter(|c| !c.trim().is_empty()),
            install_command: section.install_command.clone(),
            install_timeout: Duration::from_secs(section.install_timeout_secs),
            execute_timeout: Duration::from_secs(section.execute_timeout_secs),
            tool_ready_timeout: Duration::from_secs(section.tool_ready_timeout_secs),
            tool_poll_interval: Duration::from_millis(section.tool_poll_interval_ms.max(10)),
            max_concurrent: section.max_concurrent.max(1),
            env: section.env.clone(),
            tools: section.tools.clone(),
        }
    }

    pub fn sandbox_dir(&self, task_id: i64) -> PathBuf {
        self.sandbox_root.join(format!("task-{}", task_id))
    }

    pub fn interpreter_for(&self, sandbox: &Path) -> String {
        render_template(&self.interpreter, sandbox, &self.interpreter, None)
    }
}

/// Expand `{sandbox}`, `{interpreter}` and `{requirements}` in a command template.
pub fn render_template(
    template: &str,
    sandbox: &Path,
    interpreter: &str,
    requirements: Option<&Path>,
) -> String {
    let sandbox = sandbox.display().to_string();
    let mut out = template
        .replace("{interpreter}", &interpreter.replace("{sandbox}", &sandbox))
        .replace("{sandbox}", &sandbox);
    if let Some(req) = requirements {
        out = out.replace("{requirements}", &req.display().to_string());
    }
    out
}

/// Remove any leftover sandbox at `dir` and create it fresh.
pub async fn recreate_dir(task_id: i64, dir: &Path) -> Result<(), SupervisorError> {
    if tokio::fs::try_exists(dir).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| SupervisorError::Environment {
                task_id,
                message: format!("failed to clear {}: {}", dir.display(), e),
            })?;
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| SupervisorError::Environment {
            task_id,
            message: format!("failed to create {}: {}", dir.display(), e),
        })
}

/// Output of a shell step run inside a sandbox.
#[derive(Debug)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `sh -c <command>` in `cwd`, bounded by `limit`.
///
/// The child is killed if the limit passes. Spawn failures surface as
/// `Environment` because nothing of the artifact has run yet.
pub async fn run_shell(
    task_id: i64,
    operation: &str,
    command: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
    limit: Duration,
) -> Result<ShellOutput, SupervisorError> {
    tracing::debug!(task_id, operation, command, "Running sandbox command");
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .envs(env)
        .env("AUTOFLOW_TASK_ID", task_id.to_string())
        .env("AUTOFLOW_SANDBOX", cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SupervisorError::Environment {
            task_id,
            message: format!("failed to spawn {}: {}", operation, e),
        })?;

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| SupervisorError::Environment {
            task_id,
            message: format!("failed to wait for {}: {}", operation, e),
        })?,
        Err(_) => {
            return Err(SupervisorError::Timeout {
                operation: operation.to_string(),
                limit,
            });
        }
    };

    Ok(ShellOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
