//! Project initialization: `tandem init`.

use anyhow::Result;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    use tandem::init::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!("Initialized tandem project at {}", result.tandem_dir.display());
        println!();
        println!("Created directory structure:");
        println!("  .tandem/");
        println!("  ├── tandem.toml   # Configuration (use `tandem config show`)");
        println!("  ├── audit/        # One line per completed iteration");
        println!("  └── logs/         # Daily log files");
    } else {
        println!("Tandem project already initialized at {}", result.tandem_dir.display());
        println!("Directory structure verified.");
    }
    if result.created_config {
        println!("Wrote default configuration.");
    }

    println!();
    println!("Next steps:");
    if result.created_idea {
        println!("  1. Describe what to build in idea.md");
    } else {
        println!("  1. Review your idea specification");
    }
    println!("  2. Pick a backend in .tandem/tandem.toml ([backend] kind, model)");
    println!("  3. Run `tandem run` to start the session");

    Ok(())
}
