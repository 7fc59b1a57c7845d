//! Project setup command: `autoflow init`.

use anyhow::{Context, Result};

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    use autoflow::config::{AUTOFLOW_DIR, AutoflowConfig, AutoflowToml, CONFIG_FILE};
    use autoflow::store::DbHandle;

    let autoflow_dir = project_dir.join(AUTOFLOW_DIR);
    let config_path = autoflow_dir.join(CONFIG_FILE);
    let was_initialized = config_path.exists();

    std::fs::create_dir_all(&autoflow_dir)
        .with_context(|| format!("Failed to create {}", autoflow_dir.display()))?;
    if !was_initialized {
        AutoflowToml::default().save(&config_path)?;
    }

    let config = AutoflowConfig::new(project_dir.to_path_buf())?;
    DbHandle::open(&config.db_path())?;
    std::fs::create_dir_all(config.generated_root())?;

    if was_initialized {
        println!(
            "autoflow project already initialized at {}",
            autoflow_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!("Initialized autoflow project at {}", autoflow_dir.display());
    println!();
    println!("Created:");
    println!("  .autoflow/");
    println!("  ├── autoflow.toml   # Configuration (use `autoflow config show`)");
    println!("  └── autoflow.db     # Task store");
    println!(
        "  {}/      # Generated artifacts per task",
        config.toml.pipeline.generated_root
    );
    println!();
    println!("Next steps:");
    println!("  1. Set the four [collaborators] commands in .autoflow/autoflow.toml");
    println!("  2. Run `autoflow run --instruction \"...\"`");

    Ok(())
}
