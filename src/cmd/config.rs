//! Configuration view and validation commands: `autoflow config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use autoflow::config::{AUTOFLOW_DIR, AutoflowConfig, AutoflowToml, CONFIG_FILE};

    let autoflow_dir = project_dir.join(AUTOFLOW_DIR);
    let config_path = autoflow_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("autoflow configuration");
            println!("======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No autoflow.toml found at {}", config_path.display());
                println!("Using defaults. Run 'autoflow config init' to create one.");
            }
            println!();

            let config = AutoflowConfig::new(project_dir.to_path_buf())?;
            let toml = &config.toml;

            println!("[pipeline]");
            println!("  max_attempts = {}", toml.pipeline.max_attempts);
            println!(
                "  acceptance_threshold = {}",
                toml.pipeline.acceptance_threshold
            );
            println!(
                "  max_concurrent_tasks = {}",
                toml.pipeline.max_concurrent_tasks
            );
            println!("  pacing_delay_ms = {}", toml.pipeline.pacing_delay_ms);
            println!("  generated_root = \"{}\"", toml.pipeline.generated_root);
            println!("  db_path = \"{}\"", toml.pipeline.db_path);
            println!();

            println!("[supervisor]");
            println!("  sandbox_root = \"{}\"", toml.supervisor.sandbox_root);
            println!("  interpreter = \"{}\"", toml.supervisor.interpreter);
            if let Some(cmd) = &toml.supervisor.create_env_command {
                println!("  create_env_command = \"{}\"", cmd);
            }
            println!("  install_command = \"{}\"", toml.supervisor.install_command);
            println!(
                "  execute_timeout_secs = {}",
                toml.supervisor.execute_timeout_secs
            );
            println!("  max_concurrent = {}", toml.supervisor.max_concurrent);
            for tool in &toml.supervisor.tools {
                println!("  tool \"{}\" ({})", tool.name, tool.platform);
            }
            println!();

            println!("[collaborators]");
            let commands = [
                ("blueprint_command", &toml.collaborators.blueprint_command),
                ("codegen_command", &toml.collaborators.codegen_command),
                ("test_command", &toml.collaborators.test_command),
                ("report_command", &toml.collaborators.report_command),
            ];
            for (name, cmd) in commands {
                match cmd {
                    Some(cmd) => println!("  {} = \"{}\"", name, cmd),
                    None => println!("  {} = {}", name, console::style("(not set)").dim()),
                }
            }
            println!("  timeout_secs = {}", toml.collaborators.timeout_secs);
            println!();

            println!("[logging]");
            println!("  level = \"{}\"", toml.logging.level);
            println!("  json = {}", toml.logging.json);
            println!("  directory = \"{}\"", toml.logging.directory);
            println!();

            println!("Resolved paths:");
            println!("  database: {}", config.db_path().display());
            println!("  generated: {}", config.generated_root().display());
            println!("  sandboxes: {}", config.sandbox_root().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = AutoflowConfig::new(project_dir.to_path_buf())?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("autoflow.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !autoflow_dir.exists() {
                std::fs::create_dir_all(&autoflow_dir)?;
            }
            AutoflowToml::default().save(&config_path)?;

            println!("Created autoflow.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pipeline] max_attempts, acceptance_threshold, max_concurrent_tasks");
            println!("  - [supervisor] interpreter, install_command, [[supervisor.tools]]");
            println!("  - [collaborators] the four phase commands");
            println!();
        }
    }

    Ok(())
}
