//! Session inspection and control: `tandem status` and `tandem pause`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use tandem::audit::AuditLogger;
use tandem::config::Config;
use tandem::errors::StateError;
use tandem::init::is_initialized;
use tandem::orchestrator::{StateStore, invalid_copy_path, read_state};

pub fn cmd_status(project_dir: &Path) -> Result<()> {
    println!();
    println!("Tandem Session Status");
    println!("=====================");
    println!();

    if !is_initialized(project_dir) {
        println!("Project: Not initialized");
        println!();
        println!("Run 'tandem init' to initialize the project.");
        println!();
        return Ok(());
    }

    let config = Config::load(project_dir)?;
    let state = match read_state(&config.state_file()) {
        Ok(state) => state,
        Err(StateError::Missing(_)) => {
            println!("Session: Not started");
            println!();
            println!("Run 'tandem run' to start a session.");
            println!();
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!("Session:    {}", state.session_id);
    let mut phase = state.phase().to_string();
    if let Some(reason) = state.pause_reason {
        phase.push_str(&format!(" ({})", reason));
    }
    if let Some(failure) = &state.failure {
        phase.push_str(&format!(" ({})", failure));
    }
    println!("Phase:      {}", phase);
    println!("Iteration:  {} (next step: {:?})", state.iteration(), state.cursor);
    println!("Commits:    {} (rollbacks: {})", state.total_commits, state.rollbacks);
    println!("Runtime:    {}s", state.active_runtime_secs);
    println!("Updated:    {}", state.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Err(e) = state.validate(None) {
        println!("{} {}", style("Invalid:").red(), e);
    }
    let kept = invalid_copy_path(&config.state_file());
    if kept.exists() {
        println!("Kept:       {}", kept.display());
    }

    println!();
    if state.score_history().is_empty() {
        println!("Scores: (none yet)");
    } else {
        println!("Scores:");
        for entry in state.score_history() {
            println!("  #{:<3} {:<15} {:>3}", entry.iteration, entry.phase.to_string(), entry.score);
        }
    }

    if !state.commit_log.is_empty() {
        println!();
        println!("Commit log:");
        for checkpoint in &state.commit_log {
            let score = checkpoint
                .score
                .map_or_else(|| "-".to_string(), |s| s.to_string());
            println!(
                "  #{:<3} {}  score {}",
                checkpoint.iteration,
                &checkpoint.commit[..checkpoint.commit.len().min(10)],
                score
            );
        }
    }

    if !state.todos.is_empty() {
        println!();
        println!("Open todos:");
        for todo in &state.todos {
            println!("  - {}", todo);
        }
    }

    let audit = AuditLogger::new(&config.audit_dir());
    let entries = audit.entries()?;
    if !entries.is_empty() {
        println!();
        println!("Recent iterations:");
        for entry in entries.iter().rev().take(5) {
            let tools = entry
                .turn
                .as_ref()
                .map_or_else(|| "-".to_string(), |t| t.tool_calls.to_string());
            println!(
                "  #{:<3} {} -> {}  score {:>3}  tools {}  {:.1}s",
                entry.iteration, entry.phase_before, entry.phase_after, entry.score, tools, entry.duration_secs
            );
        }
    }
    println!();
    Ok(())
}

/// Ask a running controller to pause. The watchdog polls for the sentinel
/// and pauses at the next safe point.
pub fn cmd_pause(project_dir: &Path) -> Result<()> {
    if !is_initialized(project_dir) {
        println!("Project not initialized; nothing to pause.");
        return Ok(());
    }
    let config = Config::load(project_dir)?;

    match StateStore::open(&config.state_file(), &config.lock_file()) {
        Ok(_store) => {
            println!("No controller is running in {}.", config.project_dir.display());
            return Ok(());
        }
        Err(StateError::Locked(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let pause_file = config.pause_file();
    std::fs::write(&pause_file, chrono::Utc::now().to_rfc3339())
        .with_context(|| format!("Failed to write pause request: {}", pause_file.display()))?;
    println!("{}", style("Pause requested.").yellow());
    println!("The session pauses after the current step; run 'tandem resume' to continue.");
    Ok(())
}
