//! Configuration view and validation commands: `tandem config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use tandem::config::{CONFIG_FILE, Config, TandemToml, user_config_path};
    use tandem::tracker::METADATA_DIR;

    let tandem_dir = project_dir.join(METADATA_DIR);
    let config_path = tandem_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Tandem Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else if let Some(user) = user_config_path().filter(|p| p.exists()) {
                println!("Config file: {} (user)", user.display());
            } else {
                println!("No tandem.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let config = Config::load(project_dir)?;
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("Effective values (with env overrides):");
            println!();
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
            println!("Backend: {} ({})", config.toml.backend.kind, config.toml.backend.model);
            println!("Idea:    {}", config.idea_file().display());
            println!();
            if !config_path.exists() {
                println!("Run 'tandem config init' to create a tandem.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = Config::load(project_dir)?;
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
                println!("tandem.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&tandem_dir)
                .with_context(|| format!("Failed to create directory: {}", tandem_dir.display()))?;
            TandemToml::default().save(&config_path)?;

            println!("Created tandem.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [backend] kind, model, base_url");
            println!("  - [session] thresholds and alignment interval");
            println!("  - [limits] iterations, runtime and commits");
            println!();
        }
    }

    Ok(())
}
