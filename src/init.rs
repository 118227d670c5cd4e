//! `tandem init`: prepare a workspace for a session.
//!
//! ```text
//! <project>/
//! ├── idea.md              # Idea specification (placeholder if missing)
//! ├── .git/                # Created if the project is not a repository
//! └── .tandem/             # Session metadata, excluded from git
//!     ├── tandem.toml
//!     ├── audit/
//!     └── logs/
//! ```

use crate::config::{CONFIG_FILE, TandemToml};
use crate::tracker::{GitTracker, METADATA_DIR};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const IDEA_PLACEHOLDER: &str = "# Idea\n\nDescribe the system to build: what it does, who uses it, the interfaces it exposes and how you will know it is done.\n";

#[derive(Debug)]
pub struct InitResult {
    pub tandem_dir: PathBuf,
    /// False when `.tandem/` already existed.
    pub created: bool,
    pub created_config: bool,
    pub created_idea: bool,
}

/// Create `.tandem/`, a default config, a git repository and a placeholder
/// idea file, keeping whatever already exists.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let tandem_dir = project_dir.join(METADATA_DIR);
    let created = !tandem_dir.exists();
    for dir in [tandem_dir.clone(), tandem_dir.join("audit"), tandem_dir.join("logs")] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let config_path = tandem_dir.join(CONFIG_FILE);
    let created_config = !config_path.exists();
    if created_config {
        TandemToml::default().save(&config_path)?;
    }
    let toml = TandemToml::load(&config_path)?;

    let idea_path = project_dir.join(&toml.project.idea_file);
    let created_idea = !idea_path.exists();
    if created_idea {
        std::fs::write(&idea_path, IDEA_PLACEHOLDER)
            .with_context(|| format!("Failed to create idea file: {}", idea_path.display()))?;
    }

    GitTracker::open_or_init(project_dir).context("Failed to prepare the git repository")?;

    Ok(InitResult {
        tandem_dir,
        created,
        created_config,
        created_idea,
    })
}

pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(METADATA_DIR).is_dir()
}
