use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "autoflow")]
#[command(version, about = "Automation pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, env = "AUTOFLOW_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize an autoflow project in the current directory
    Init,
    /// Submit an automation request and drive it to completion
    Run {
        /// What the automation should do
        #[arg(short, long)]
        instruction: String,

        /// Target platform: auto-detect, web, mobile, both
        #[arg(short, long, default_value = "auto-detect")]
        platform: String,

        /// File handed to the blueprint phase (repeatable)
        #[arg(long = "attach", value_name = "PATH")]
        attachments: Vec<PathBuf>,

        /// Extra request data as KEY=VALUE (repeatable)
        #[arg(long = "data", value_name = "KEY=VALUE")]
        data: Vec<String>,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Continue every task left unfinished by an earlier run
    Resume,
    /// Show the status of one task
    Status {
        id: i64,

        #[arg(long)]
        json: bool,
    },
    /// List recent tasks
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Export a task's full audit trail as JSON
    Export {
        id: i64,

        /// Output file (defaults to .autoflow/exports/task-<id>.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default autoflow.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run {
            instruction,
            platform,
            attachments,
            data,
            json,
        } => {
            let request = cmd::build_request(instruction, platform, attachments, data)?;
            cmd::cmd_run(&project_dir, cli.verbose, request, *json).await?;
        }
        Commands::Resume => cmd::cmd_resume(&project_dir, cli.verbose).await?,
        Commands::Status { id, json } => cmd::cmd_status(&project_dir, *id, *json).await?,
        Commands::List { limit } => cmd::cmd_list(&project_dir, *limit).await?,
        Commands::Export { id, output } => {
            cmd::cmd_export(&project_dir, *id, output.as_deref()).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
