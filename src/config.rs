//! Project configuration read from `.autoflow/autoflow.toml`.
//!
//! Layering is file → environment → CLI. Every field has a default, so an
//! empty or missing file yields a working configuration.
//!
//! ```toml
//! [pipeline]
//! max_attempts = 3
//! acceptance_threshold = 1.0
//! max_concurrent_tasks = 5
//! pacing_delay_ms = 0
//! generated_root = "generated_code"
//! db_path = ".autoflow/autoflow.db"
//!
//! [supervisor]
//! sandbox_root = ".autoflow/sandboxes"
//! interpreter = "python3"
//! create_env_command = "python3 -m venv {sandbox}/venv"
//! install_command = "{sandbox}/venv/bin/pip install -q -r {requirements}"
//! install_timeout_secs = 300
//! execute_timeout_secs = 120
//!
//! [[supervisor.tools]]
//! name = "appium"
//! platform = "mobile"
//! kind = "http"
//! url = "http://127.0.0.1:4723/status"
//!
//! [collaborators]
//! blueprint_command = "./agents/blueprint.sh"
//! codegen_command = "./agents/codegen.sh"
//! test_command = "./agents/test.sh"
//! report_command = "./agents/report.sh"
//! timeout_secs = 600
//!
//! [logging]
//! level = "info"
//! json = false
//! directory = ".autoflow/logs"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::supervisor::probe::ToolSpec;

/// Directory under the project root that holds config, database and logs.
pub const AUTOFLOW_DIR: &str = ".autoflow";
pub const CONFIG_FILE: &str = "autoflow.toml";

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Test executions per task, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fraction of passing steps that accepts an attempt.
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Delay before every collaborator call.
    #[serde(default)]
    pub pacing_delay_ms: u64,
    #[serde(default = "default_generated_root")]
    pub generated_root: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_acceptance_threshold() -> f64 {
    1.0
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_generated_root() -> String {
    "generated_code".to_string()
}

fn default_db_path() -> String {
    format!("{}/autoflow.db", AUTOFLOW_DIR)
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            acceptance_threshold: default_acceptance_threshold(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            pacing_delay_ms: 0,
            generated_root: default_generated_root(),
            db_path: default_db_path(),
        }
    }
}

/// `[supervisor]` section.
///
/// Command templates may use `{sandbox}`, `{requirements}` and
/// `{interpreter}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default)]
    pub create_env_command: Option<String>,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_execute_timeout_secs")]
    pub execute_timeout_secs: u64,
    #[serde(default = "default_tool_ready_timeout_secs")]
    pub tool_ready_timeout_secs: u64,
    #[serde(default = "default_tool_poll_interval_ms")]
    pub tool_poll_interval_ms: u64,
    /// Sandboxes alive at the same time, across all tasks.
    #[serde(default = "default_supervisor_max_concurrent")]
    pub max_concurrent: usize,
    /// Extra environment for every sandboxed subprocess.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

fn default_sandbox_root() -> String {
    format!("{}/sandboxes", AUTOFLOW_DIR)
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_install_command() -> String {
    "{interpreter} -m pip install -q -r {requirements}".to_string()
}

fn default_install_timeout_secs() -> u64 {
    300
}

fn default_execute_timeout_secs() -> u64 {
    120
}

fn default_tool_ready_timeout_secs() -> u64 {
    30
}

fn default_tool_poll_interval_ms() -> u64 {
    500
}

fn default_supervisor_max_concurrent() -> usize {
    2
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            sandbox_root: default_sandbox_root(),
            interpreter: default_interpreter(),
            create_env_command: None,
            install_command: default_install_command(),
            install_timeout_secs: default_install_timeout_secs(),
            execute_timeout_secs: default_execute_timeout_secs(),
            tool_ready_timeout_secs: default_tool_ready_timeout_secs(),
            tool_poll_interval_ms: default_tool_poll_interval_ms(),
            max_concurrent: default_supervisor_max_concurrent(),
            env: HashMap::new(),
            tools: Vec::new(),
        }
    }
}

/// `[collaborators]` section: shell commands implementing each phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorsSection {
    #[serde(default)]
    pub blueprint_command: Option<String>,
    #[serde(default)]
    pub codegen_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub report_command: Option<String>,
    #[serde(default = "default_collaborator_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_collaborator_timeout_secs() -> u64 {
    600
}

impl Default for CollaboratorsSection {
    fn default() -> Self {
        Self {
            blueprint_command: None,
            codegen_command: None,
            test_command: None,
            report_command: None,
            timeout_secs: default_collaborator_timeout_secs(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_log_directory")]
    pub directory: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_directory() -> String {
    format!("{}/logs", AUTOFLOW_DIR)
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: default_log_directory(),
        }
    }
}

/// Contents of `autoflow.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoflowToml {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub collaborators: CollaboratorsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AutoflowToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse autoflow.toml")
    }

    /// Load `autoflow.toml` from `autoflow_dir`, or defaults if it is absent.
    pub fn load_or_default(autoflow_dir: &Path) -> Result<Self> {
        let config_path = autoflow_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize autoflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `AUTOFLOW_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("AUTOFLOW_MAX_ATTEMPTS") {
            self.pipeline.max_attempts = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid AUTOFLOW_MAX_ATTEMPTS '{}'", value))?;
        }
        if let Some(value) = lookup("AUTOFLOW_MAX_CONCURRENT_TASKS") {
            self.pipeline.max_concurrent_tasks = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid AUTOFLOW_MAX_CONCURRENT_TASKS '{}'", value))?;
        }
        if let Some(value) = lookup("AUTOFLOW_DB_PATH")
            && !value.trim().is_empty()
        {
            self.pipeline.db_path = value;
        }
        if let Some(value) = lookup("AUTOFLOW_LOG_LEVEL")
            && !value.trim().is_empty()
        {
            self.logging.level = value;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.max_attempts == 0 {
            warnings.push("pipeline.max_attempts is 0: no test attempt will run".to_string());
        }
        if !(0.0..=1.0).contains(&self.pipeline.acceptance_threshold) {
            warnings.push(format!(
                "pipeline.acceptance_threshold {} is outside 0.0..=1.0",
                self.pipeline.acceptance_threshold
            ));
        }
        if self.pipeline.max_concurrent_tasks == 0 {
            warnings.push("pipeline.max_concurrent_tasks is 0: no task can start".to_string());
        }
        if self.supervisor.max_concurrent == 0 {
            warnings
                .push("supervisor.max_concurrent is 0: no sandbox can be provisioned".to_string());
        }
        if self.supervisor.execute_timeout_secs == 0 {
            warnings.push("supervisor.execute_timeout_secs is 0".to_string());
        }
        for tool in &self.supervisor.tools {
            if tool.name.trim().is_empty() {
                warnings.push("supervisor.tools entry without a name".to_string());
            }
        }

        let missing: Vec<&str> = [
            ("blueprint_command", &self.collaborators.blueprint_command),
            ("codegen_command", &self.collaborators.codegen_command),
            ("test_command", &self.collaborators.test_command),
            ("report_command", &self.collaborators.report_command),
        ]
        .into_iter()
        .filter(|(_, cmd)| cmd.as_deref().is_none_or(|c| c.trim().is_empty()))
        .map(|(name, _)| name)
        .collect();
        if !missing.is_empty() {
            warnings.push(format!(
                "collaborators not configured: {} (`autoflow run` needs all four)",
                missing.join(", ")
            ));
        }

        warnings
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct AutoflowConfig {
    pub project_dir: PathBuf,
    pub autoflow_dir: PathBuf,
    pub toml: AutoflowToml,
    pub verbose: bool,
}

impl AutoflowConfig {
    /// Load `autoflow.toml` for `project_dir` and apply environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let autoflow_dir = project_dir.join(AUTOFLOW_DIR);
        let mut toml = AutoflowToml::load_or_default(&autoflow_dir)?;
        toml.apply_env_overrides()?;
        Ok(Self {
            project_dir,
            autoflow_dir,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.autoflow_dir.join(CONFIG_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.toml.pipeline.db_path)
    }

    pub fn generated_root(&self) -> PathBuf {
        self.resolve(&self.toml.pipeline.generated_root)
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.resolve(&self.toml.supervisor.sandbox_root)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.toml.logging.directory)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use crate::supervisor::probe::ToolCheck;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let toml = AutoflowToml::default();
        assert_eq!(toml.pipeline.max_attempts, 3);
        assert_eq!(toml.pipeline.acceptance_threshold, 1.0);
        assert_eq!(toml.pipeline.max_concurrent_tasks, 5);
        assert_eq!(toml.pipeline.generated_root, "generated_code");
        assert_eq!(toml.pipeline.db_path, ".autoflow/autoflow.db");
        assert_eq!(toml.supervisor.interpreter, "python3");
        assert_eq!(toml.supervisor.max_concurrent, 2);
        assert_eq!(toml.logging.level, "info");
        assert!(toml.collaborators.blueprint_command.is_none());
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = AutoflowToml::parse("").unwrap();
        assert_eq!(toml.pipeline.max_attempts, 3);
        assert_eq!(toml.supervisor.execute_timeout_secs, 120);
    }

    #[test]
    fn test_parse_partial_sections() {
        let toml = AutoflowToml::parse(
            r#"
[pipeline]
max_attempts = 5
acceptance_threshold = 0.7

[supervisor]
interpreter = "sh"

[[supervisor.tools]]
name = "appium"
platform = "mobile"
kind = "http"
url = "http://127.0.0.1:4723/status"

[[supervisor.tools]]
name = "chrome"
kind = "command"
command = "which chromium"

[supervisor.env]
HEADLESS = "1"
"#,
        )
        .unwrap();
        assert_eq!(toml.pipeline.max_attempts, 5);
        assert_eq!(toml.pipeline.acceptance_threshold, 0.7);
        assert_eq!(toml.pipeline.max_concurrent_tasks, 5);
        assert_eq!(toml.supervisor.interpreter, "sh");
        assert_eq!(toml.supervisor.env.get("HEADLESS").unwrap(), "1");
        assert_eq!(toml.supervisor.tools.len(), 2);
        assert_eq!(toml.supervisor.tools[0].platform, Platform::Mobile);
        assert!(matches!(
            toml.supervisor.tools[0].check,
            ToolCheck::Http { ref url } if url.ends_with("/status")
        ));
        assert_eq!(toml.supervisor.tools[1].platform, Platform::AutoDetect);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(AutoflowToml::parse("[pipeline\nmax_attempts = ").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = AutoflowToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.pipeline.max_attempts, 3);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = AutoflowToml::default();
        toml.pipeline.max_attempts = 4;
        toml.collaborators.test_command = Some("./test.sh".into());
        toml.save(&path).unwrap();

        let loaded = AutoflowToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.pipeline.max_attempts, 4);
        assert_eq!(loaded.collaborators.test_command.as_deref(), Some("./test.sh"));
    }

    #[test]
    fn test_env_overrides() {
        let mut toml = AutoflowToml::default();
        toml.apply_overrides_from(|key| match key {
            "AUTOFLOW_MAX_ATTEMPTS" => Some("7".into()),
            "AUTOFLOW_DB_PATH" => Some("/tmp/other.db".into()),
            "AUTOFLOW_LOG_LEVEL" => Some("debug".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(toml.pipeline.max_attempts, 7);
        assert_eq!(toml.pipeline.max_concurrent_tasks, 5);
        assert_eq!(toml.pipeline.db_path, "/tmp/other.db");
        assert_eq!(toml.logging.level, "debug");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut toml = AutoflowToml::default();
        let err = toml
            .apply_overrides_from(|key| {
                (key == "AUTOFLOW_MAX_CONCURRENT_TASKS").then(|| "many".to_string())
            })
            .unwrap_err();
        assert!(err.to_string().contains("AUTOFLOW_MAX_CONCURRENT_TASKS"));
    }

    #[test]
    fn test_validate_warnings() {
        let mut toml = AutoflowToml::default();
        toml.collaborators.blueprint_command = Some("a".into());
        toml.collaborators.codegen_command = Some("b".into());
        toml.collaborators.test_command = Some("c".into());
        toml.collaborators.report_command = Some("d".into());
        assert!(toml.validate().is_empty());

        toml.pipeline.max_attempts = 0;
        toml.pipeline.acceptance_threshold = 1.5;
        toml.collaborators.report_command = Some("  ".into());
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("max_attempts")));
        assert!(warnings.iter().any(|w| w.contains("acceptance_threshold")));
        assert!(warnings.iter().any(|w| w.contains("report_command")));
    }

    #[test]
    fn test_paths_resolve_against_project_dir() {
        let dir = tempdir().unwrap();
        let config = AutoflowConfig::new(dir.path().to_path_buf()).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.generated_root(), root.join("generated_code"));
        assert_eq!(config.config_file(), root.join(".autoflow/autoflow.toml"));
        assert_eq!(config.log_dir(), root.join(".autoflow/logs"));
    }
}
