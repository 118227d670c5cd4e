use super::IterationAudit;
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const AUDIT_FILE: &str = "iterations.jsonl";

pub struct AuditLogger {
    file: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        Self {
            file: audit_dir.join(AUDIT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    /// Append one iteration as a single JSON line.
    pub fn append(&self, entry: &IterationAudit) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit directory: {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(entry).context("Failed to serialize audit entry")?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)
            .with_context(|| format!("Failed to open audit file: {}", self.file.display()))?
            .write_all(line.as_bytes())
            .context("Failed to write audit entry")?;
        Ok(())
    }

    /// Every entry written so far, oldest first. Unreadable lines (e.g. a
    /// torn final line after a crash) are skipped.
    pub fn entries(&self) -> Result<Vec<IterationAudit>> {
        if !self.file.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.file)
            .with_context(|| format!("Failed to read audit file: {}", self.file.display()))?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping unreadable audit line: {}", e);
                    None
                }
            })
            .collect())
    }
}
