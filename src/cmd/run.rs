//! Session execution commands: `tandem run` and `tandem resume`.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;

use tandem::config::{CONFIG_FILE, Config, TandemToml};
use tandem::gateway::Backend;
use tandem::orchestrator::{Orchestrator, RunReport};
use tandem::phase::Phase;

use super::super::Cli;

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    idea: Option<&Path>,
    fresh: bool,
    max_iterations: Option<u32>,
) -> Result<()> {
    let mut config = Config::with_cli_args(project_dir, cli.verbose, max_iterations)?;
    if let Some(idea) = idea {
        config.set_idea_file(idea)?;
        remember_idea_file(&config)?;
    }
    let mut orchestrator = build_orchestrator(&config)?;
    let mut state = orchestrator.start(fresh)?;

    println!(
        "{} session {} on {}",
        style("Starting").bold().cyan(),
        state.session_id,
        config.idea_file().display()
    );
    let report = orchestrator.run(&mut state).await?;
    finish(&report)
}

pub async fn cmd_resume(cli: &Cli, project_dir: &Path, max_iterations: Option<u32>) -> Result<()> {
    let config = Config::with_cli_args(project_dir, cli.verbose, max_iterations)?;
    let mut orchestrator = build_orchestrator(&config)?;
    let mut state = orchestrator.resume()?;

    println!(
        "{} session {} at iteration {} ({})",
        style("Resuming").bold().cyan(),
        state.session_id,
        state.iteration(),
        state.phase()
    );
    let report = orchestrator.run(&mut state).await?;
    finish(&report)
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    for warning in config.validate() {
        tracing::warn!("Config: {}", warning);
    }
    let backend = Backend::from_config(&config.toml.backend, &config.project_dir)
        .context("Failed to set up the model backend")?;
    tracing::info!(
        backend = %config.toml.backend.kind,
        model = %config.toml.backend.model,
        "Model backend ready"
    );
    Ok(Orchestrator::new(config, Arc::new(backend))?)
}

/// `resume` reads the idea file from the config, so a `--idea` override
/// is written back to the project file.
fn remember_idea_file(config: &Config) -> Result<()> {
    let path = config.tandem_dir.join(CONFIG_FILE);
    let mut toml = TandemToml::load_or_default(&config.tandem_dir)?;
    if toml.project.idea_file == config.toml.project.idea_file {
        return Ok(());
    }
    toml.project.idea_file = config.toml.project.idea_file.clone();
    config.ensure_directories()?;
    toml.save(&path)?;
    tracing::info!(idea = %toml.project.idea_file.display(), "Recorded idea file in {}", path.display());
    Ok(())
}

fn finish(report: &RunReport) -> Result<()> {
    println!();
    let headline = match report.phase {
        Phase::Complete => style("Session complete").bold().green(),
        Phase::Paused => style("Session paused").bold().yellow(),
        Phase::Failed => style("Session failed").bold().red(),
        _ => style("Session stopped").bold(),
    };
    println!("{}", headline);
    println!("{}", report.render());
    println!();

    match report.phase {
        Phase::Paused => println!("Run 'tandem resume' to continue."),
        Phase::Failed => bail!(
            "Session failed: {}",
            report.failure.as_deref().unwrap_or("unknown cause")
        ),
        _ => {}
    }
    Ok(())
}
