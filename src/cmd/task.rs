//! Task commands: `autoflow run`, `resume`, `status`, `list`, `export`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;

use autoflow::config::AutoflowConfig;
use autoflow::logging::{self, LogGuard};
use autoflow::models::{Task, TaskStatus};
use autoflow::pipeline::{
    PipelineController, PipelineRunner, PipelineSettings, TaskRequest, collaborators_from_config,
};
use autoflow::status::{StatusProjector, TaskStatusView};
use autoflow::store::DbHandle;
use autoflow::supervisor::{ProcessSupervisor, SupervisorConfig};

/// Parse `--data KEY=VALUE` pairs. Values that parse as JSON keep their type.
pub fn build_request(
    instruction: &str,
    platform: &str,
    attachments: &[PathBuf],
    data: &[String],
) -> Result<TaskRequest> {
    let mut additional_data = serde_json::Map::new();
    for pair in data {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid --data '{}': expected KEY=VALUE", pair))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        additional_data.insert(key.trim().to_string(), value);
    }
    Ok(TaskRequest {
        instruction: instruction.to_string(),
        platform: platform.to_string(),
        attachments: attachments.to_vec(),
        additional_data,
    })
}

fn open_db(config: &AutoflowConfig) -> Result<DbHandle> {
    DbHandle::open(&config.db_path())
}

fn build_runner(config: &AutoflowConfig) -> Result<PipelineRunner> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    let db = open_db(config)?;
    let supervisor = Arc::new(ProcessSupervisor::new(SupervisorConfig::from_section(
        &config.toml.supervisor,
        config.sandbox_root(),
    )));
    let collaborators = collaborators_from_config(&config.toml.collaborators, &config.project_dir)?;
    let controller = Arc::new(PipelineController::new(
        db,
        supervisor,
        collaborators,
        PipelineSettings::from_config(config),
    ));
    Ok(PipelineRunner::new(
        controller,
        config.toml.pipeline.max_concurrent_tasks,
    ))
}

fn init_logging(config: &AutoflowConfig) -> Result<LogGuard> {
    logging::init(&config.toml.logging, &config.log_dir(), config.verbose)
}

pub async fn cmd_run(
    project_dir: &Path,
    verbose: bool,
    request: TaskRequest,
    json: bool,
) -> Result<()> {
    let config = AutoflowConfig::with_cli_args(project_dir.to_path_buf(), verbose)?;
    let _guard = init_logging(&config)?;
    let runner = Arc::new(build_runner(&config)?);

    let task_id = runner.start(request).await?;
    if !json {
        println!("Task {} submitted", style(task_id).bold());
    }

    let interrupt = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, cancelling task {}...", task_id);
                runner.cancel(task_id).await;
            }
        })
    };
    let task = runner.wait(task_id).await;
    interrupt.abort();
    let task = task?;

    if json {
        let view = TaskStatusView::from_task(&task);
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_task(&task);
    }
    if task.status == TaskStatus::Failed {
        anyhow::bail!(
            "Task {} failed: {}",
            task.id,
            task.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

pub async fn cmd_resume(project_dir: &Path, verbose: bool) -> Result<()> {
    let config = AutoflowConfig::with_cli_args(project_dir.to_path_buf(), verbose)?;
    let _guard = init_logging(&config)?;
    let runner = build_runner(&config)?;

    let ids = runner.resume_unfinished().await?;
    if ids.is_empty() {
        println!("No unfinished tasks.");
        return Ok(());
    }
    println!("Resuming {} task(s)", ids.len());
    for id in ids {
        let task = runner.wait(id).await?;
        print_task(&task);
    }
    Ok(())
}

pub async fn cmd_status(project_dir: &Path, task_id: i64, json: bool) -> Result<()> {
    let config = AutoflowConfig::new(project_dir.to_path_buf())?;
    let projector = StatusProjector::new(open_db(&config)?);
    let view = projector.get_status(task_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!();
    println!("Task {}", style(view.task_id).bold());
    println!("  Status:   {}", styled_status(view.status));
    println!(
        "  Phase:    {}",
        view.phase.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
    );
    println!("  Progress: {}%", view.progress_percent);
    if view.has_issues {
        println!("  Issues:   {}", style("yes").yellow());
    }
    if let Some(phase) = view.failed_phase {
        println!("  Failed in: {}", phase);
    }
    if let Some(error) = &view.last_error {
        println!("  Last error: {}", style(error).red());
    }
    println!();
    Ok(())
}

pub async fn cmd_list(project_dir: &Path, limit: usize) -> Result<()> {
    let config = AutoflowConfig::new(project_dir.to_path_buf())?;
    let tasks = StatusProjector::new(open_db(&config)?).list(limit).await?;

    if tasks.is_empty() {
        println!("No tasks yet. Run `autoflow run --instruction \"...\"` to create one.");
        return Ok(());
    }

    println!();
    println!(
        "{:>6}  {:<22}  {:<11}  {:>8}  Instruction",
        "ID", "Status", "Platform", "Progress"
    );
    println!("{}", "-".repeat(72));
    for task in &tasks {
        let view = TaskStatusView::from_task(task);
        println!(
            "{:>6}  {:<22}  {:<11}  {:>7}%  {}",
            task.id,
            task.status.as_str(),
            task.platform.as_str(),
            view.progress_percent,
            truncate(&task.instruction, 40)
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_export(project_dir: &Path, task_id: i64, output: Option<&Path>) -> Result<()> {
    let config = AutoflowConfig::new(project_dir.to_path_buf())?;
    let db = open_db(&config)?;
    let audit = autoflow::export::export_task(&db, task_id).await?;

    let path = match output {
        Some(path) => path.to_path_buf(),
        None => config
            .autoflow_dir
            .join("exports")
            .join(format!("task-{}.json", task_id)),
    };
    audit.write_json(&path)?;
    println!(
        "Exported task {} ({} steps, {} executions, {} artifacts) to {}",
        task_id,
        audit.steps.len(),
        audit.executions.len(),
        audit.artifacts.len(),
        path.display()
    );
    Ok(())
}

fn print_task(task: &Task) {
    println!(
        "Task {} finished: {}",
        style(task.id).bold(),
        styled_status(task.status)
    );
    println!("  Artifacts: {}", task.base_path);
    if let Some(error) = &task.last_error {
        println!("  Last error: {}", error);
    }
}

fn styled_status(status: TaskStatus) -> console::StyledObject<&'static str> {
    match status {
        TaskStatus::Completed => style(status.as_str()).green(),
        TaskStatus::CompletedWithIssues => style(status.as_str()).yellow(),
        TaskStatus::Failed => style(status.as_str()).red(),
        _ => style(status.as_str()).cyan(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_parses_data() {
        let req = build_request(
            "log in",
            "web",
            &[],
            &["retries=3".into(), "user=alice".into(), "flags=[1,2]".into()],
        )
        .unwrap();
        assert_eq!(req.additional_data["retries"], 3);
        assert_eq!(req.additional_data["user"], "alice");
        assert_eq!(req.additional_data["flags"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_build_request_rejects_bad_pair() {
        assert!(build_request("x", "web", &[], &["novalue".into()]).is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long instruction", 10), "a very ...");
        assert_eq!(truncate("first\nsecond", 10), "first");
    }
}
