use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(version, about = "Autonomous implementer/reviewer coding loop")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Prepare the project directory (config, git repository, idea file)
    Init,
    /// Start a new session and run it until it completes, pauses or fails
    Run {
        /// Idea specification, relative to the project (defaults to project.idea_file)
        #[arg(long)]
        idea: Option<PathBuf>,

        /// Discard an existing session instead of refusing to start
        #[arg(long)]
        fresh: bool,

        /// Override limits.max_iterations for this run
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Continue a paused or interrupted session
    Resume {
        /// Override limits.max_iterations for this run
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Show the persisted session state
    Status,
    /// Ask a running session to pause at the next safe point
    Pause,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default tandem.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Only long-running commands write a log file.
    let log_dir = matches!(cli.command, Commands::Run { .. } | Commands::Resume { .. })
        .then(|| project_dir.join(tandem::tracker::METADATA_DIR).join("logs"));
    let _guard = tandem::logging::init(cli.verbose, log_dir.as_deref());

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run {
            idea,
            fresh,
            max_iterations,
        } => {
            cmd::cmd_run(&cli, &project_dir, idea.as_deref(), *fresh, *max_iterations).await?;
        }
        Commands::Resume { max_iterations } => {
            cmd::cmd_resume(&cli, &project_dir, *max_iterations).await?;
        }
        Commands::Status => cmd::cmd_status(&project_dir)?,
        Commands::Pause => cmd::cmd_pause(&project_dir)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
