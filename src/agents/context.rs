//! Context views for each role.
//!
//! The reviewer view is assembled only from durable artifacts: the idea
//! specification, the file tree, code and config file contents, a diff and
//! the score history. Prose files other than the idea specification are
//! left out. Nothing from the implementer's turn (its replies, its notes,
//! the turn summary) is an input to [`ContextBuilder::reviewer_view`].

use super::prompts;
use crate::gateway::Message;
use crate::orchestrator::state::SessionState;
use crate::phase::Phase;
use crate::tracker::{METADATA_DIR, SECRETS_FILE};
use crate::util::cap_output;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Directories never walked.
const SKIP_DIRS: &[&str] = &[
    ".git",
    METADATA_DIR,
    "target",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "dist",
    "build",
    ".idea",
    ".vscode",
];

const PROSE_EXTENSIONS: &[&str] = &["md", "markdown", "txt", "rst", "rtf", "adoc"];

/// Whether a path holds prose rather than code or configuration.
pub fn is_prose(path: &Path) -> bool {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    PROSE_EXTENSIONS.contains(&ext.as_str()) || ext.starts_with("doc")
}

/// Factual inputs to a review, gathered by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ReviewEvidence {
    /// Unified diff since the last reviewed commit, already path-filtered.
    pub diff: String,
    /// Output of the configured review command, if any.
    pub command_output: Option<String>,
}

pub struct ContextBuilder {
    root: PathBuf,
    idea_file: PathBuf,
    max_file_bytes: u64,
    max_context_chars: usize,
    ignore: Vec<glob::Pattern>,
}

impl ContextBuilder {
    pub fn new(
        root: &Path,
        idea_file: &Path,
        max_file_bytes: u64,
        max_context_chars: usize,
        ignore: &[String],
    ) -> Self {
        let ignore = ignore
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!(pattern = %p, "Ignoring invalid context.ignore pattern: {}", e);
                    None
                }
            })
            .collect();
        Self {
            root: root.to_path_buf(),
            idea_file: idea_file.to_path_buf(),
            max_file_bytes,
            max_context_chars,
            ignore,
        }
    }

    fn ignored(&self, rel: &Path) -> bool {
        self.ignore.iter().any(|p| p.matches_path(rel))
    }

    /// Relative paths of every visible file, sorted. The secrets file is
    /// never listed.
    pub fn file_tree(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !(entry.file_type().is_dir() && SKIP_DIRS.iter().any(|d| *d == name))
            })
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.path().strip_prefix(&self.root).ok().map(Path::to_path_buf))
            .filter(|rel| rel != Path::new(SECRETS_FILE) && !self.ignored(rel))
            .collect();
        files.sort();
        files
    }

    /// Whether the reviewer may see the contents of `rel`.
    pub fn reviewer_sees(&self, rel: &Path) -> bool {
        rel != self.idea_file && rel != Path::new(SECRETS_FILE) && !is_prose(rel) && !self.ignored(rel)
    }

    fn render_tree(&self) -> String {
        let files = self.file_tree();
        if files.is_empty() {
            return "(empty workspace)".to_string();
        }
        files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Contents of code and config files, bounded by `budget` characters.
    fn code_contents(&self, budget: usize) -> String {
        let mut out = String::new();
        let mut omitted = Vec::new();
        for rel in self.file_tree().into_iter().filter(|p| self.reviewer_sees(p)) {
            let path = self.root.join(&rel);
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if size > self.max_file_bytes {
                omitted.push(format!("{} ({} bytes, too large)", rel.display(), size));
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            if bytes.contains(&0) {
                continue;
            }
            let text = String::from_utf8_lossy(&bytes);
            let block = format!("### {}\n```\n{}\n```\n\n", rel.display(), text.trim_end());
            if out.len() + block.len() > budget {
                omitted.push(format!("{} (context budget)", rel.display()));
                continue;
            }
            out.push_str(&block);
        }
        if !omitted.is_empty() {
            out.push_str("Omitted:\n");
            for line in omitted {
                out.push_str(&format!("- {}\n", line));
            }
        }
        if out.is_empty() {
            out.push_str("(no code files)");
        }
        out
    }

    fn bullet_list(items: &[String], empty: &str) -> String {
        if items.is_empty() {
            return empty.to_string();
        }
        items
            .iter()
            .map(|i| format!("- {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Context for an implementer turn. Carries no prior self-assessment:
    /// the previous turn appears only as a factual tool-call summary.
    pub fn implementer_view(&self, idea: &str, state: &SessionState) -> Vec<Message> {
        let mut body = format!(
            "## Idea specification\n{}\n\n## Phase\n{} (iteration {})\n\n## Instructions\n{}\n\n## Open items\n{}\n\n## Workspace files\n{}\n\n## Your notes\n{}\n",
            idea.trim(),
            state.working_phase(),
            state.iteration() + 1,
            state.pending_instructions,
            Self::bullet_list(&state.todos, "(none)"),
            self.render_tree(),
            Self::bullet_list(state.memory_for("implementer"), "(none)"),
        );
        if let Some(summary) = &state.last_turn_summary {
            body.push_str(&format!("\n## Previous turn\n{}\n", summary));
        }
        let (body, _) = cap_output(&body, self.max_context_chars);
        vec![Message::system(prompts::IMPLEMENTER_SYSTEM), Message::user(body)]
    }

    /// Context for a review.
    pub fn reviewer_view(
        &self,
        idea: &str,
        state: &SessionState,
        evidence: &ReviewEvidence,
        memory_role: &str,
    ) -> Vec<Message> {
        let phase = state.working_phase();
        let history = if state.score_history().is_empty() {
            "(no reviews yet)".to_string()
        } else {
            state
                .score_history()
                .iter()
                .map(|e| format!("- iteration {}: {} ({})", e.iteration, e.score, e.phase))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let quarter = self.max_context_chars / 4;
        let (diff, _) = cap_output(
            if evidence.diff.trim().is_empty() {
                "(no changes)"
            } else {
                &evidence.diff
            },
            quarter,
        );

        let mut body = format!(
            "## Idea specification\n{}\n\n## Phase\n{} (review {})\n\n## Score history\n{}\n\n## Open items\n{}\n\n## Your notes\n{}\n\n## Workspace files\n{}\n\n## Changes since your last review\n```diff\n{}\n```\n",
            idea.trim(),
            phase,
            state.iteration() + 1,
            history,
            Self::bullet_list(&state.todos, "(none)"),
            Self::bullet_list(state.memory_for(memory_role), "(none)"),
            self.render_tree(),
            diff.trim_end(),
        );
        if let Some(output) = &evidence.command_output {
            let (output, _) = cap_output(output, quarter);
            body.push_str(&format!("\n## Review command output\n```\n{}\n```\n", output.trim_end()));
        }
        let budget = self.max_context_chars.saturating_sub(body.len());
        body.push_str(&format!("\n## Code\n{}", self.code_contents(budget)));

        vec![Message::system(prompts::reviewer_system(phase)), Message::user(body)]
    }

    /// Context for an alignment check.
    pub fn alignment_view(&self, idea: &str, state: &SessionState) -> Vec<Message> {
        let mut body = format!(
            "## Idea specification\n{}\n\n## Current instructions\n{}\n\n## Open items\n{}\n\n## Workspace files\n{}\n",
            idea.trim(),
            state.pending_instructions,
            Self::bullet_list(&state.todos, "(none)"),
            self.render_tree(),
        );
        let budget = self.max_context_chars.saturating_sub(body.len());
        body.push_str(&format!("\n## Code\n{}", self.code_contents(budget)));
        vec![Message::system(prompts::alignment_system()), Message::user(body)]
    }
}

/// The phase-specific memory bucket the reviewer reads and writes.
pub fn reviewer_memory_role(phase: Phase) -> &'static str {
    match phase {
        Phase::Testing => "testing",
        _ => "reviewer",
    }
}
