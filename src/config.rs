//! Configuration for a tandem session.
//!
//! Settings live in `.tandem/tandem.toml`. Every field has a default, so an
//! empty file (or no file at all) is a valid configuration. Layering, lowest
//! precedence first:
//! - project file, or the user file in the platform config dir when the
//!   project has none
//! - environment (`TANDEM_BACKEND`, `TANDEM_MODEL`, `TANDEM_BASE_URL`,
//!   `TANDEM_CLI_CMD`), with `.env` in the project loaded first
//! - CLI flags
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "todo-cli"
//! idea_file = "idea.md"
//!
//! [session]
//! phase_threshold = 70
//! completion_threshold = 95
//! regression_margin = 10
//! regression_window = 3
//! alignment_interval = 5
//! max_rollbacks = 2
//!
//! [limits]
//! max_iterations = 50
//! max_runtime_mins = 240
//! max_commits = 200
//! max_violations_per_iteration = 5
//!
//! [sandbox]
//! shell_timeout_secs = 120
//! max_output_bytes = 16000
//! max_tool_calls_per_turn = 40
//!
//! [backend]
//! kind = "openai"
//! base_url = "http://localhost:11434/v1"
//! model = "qwen2.5-coder:32b"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [context]
//! max_file_bytes = 65536
//! max_context_chars = 120000
//! ignore = ["fixtures/**"]
//! review_command = "cargo test 2>&1 | tail -n 40"
//! ```

use crate::gateway::RetryPolicy;
use crate::phase::PhasePolicy;
use crate::tracker::METADATA_DIR;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "tandem.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Idea specification, relative to the project root.
    #[serde(default = "default_idea_file")]
    pub idea_file: PathBuf,
}

fn default_idea_file() -> PathBuf {
    PathBuf::from("idea.md")
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: None,
            idea_file: default_idea_file(),
        }
    }
}

/// Phase and regression policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_phase_threshold")]
    pub phase_threshold: u8,
    #[serde(default = "default_completion_threshold")]
    pub completion_threshold: u8,
    /// How far below `phase_threshold` a TESTING score must fall before
    /// the session drops back to IMPLEMENTATION.
    #[serde(default = "default_regression_margin")]
    pub regression_margin: u8,
    /// Consecutive falling reviews that trigger a rollback. 0 disables.
    #[serde(default = "default_regression_window")]
    pub regression_window: usize,
    /// Run the alignment checker every N iterations. 0 disables.
    #[serde(default = "default_alignment_interval")]
    pub alignment_interval: u32,
    #[serde(default = "default_max_rollbacks")]
    pub max_rollbacks: u32,
}

fn default_phase_threshold() -> u8 {
    70
}

fn default_completion_threshold() -> u8 {
    95
}

fn default_regression_margin() -> u8 {
    10
}

fn default_regression_window() -> usize {
    3
}

fn default_alignment_interval() -> u32 {
    5
}

fn default_max_rollbacks() -> u32 {
    2
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            phase_threshold: default_phase_threshold(),
            completion_threshold: default_completion_threshold(),
            regression_margin: default_regression_margin(),
            regression_window: default_regression_window(),
            alignment_interval: default_alignment_interval(),
            max_rollbacks: default_max_rollbacks(),
        }
    }
}

impl SessionConfig {
    pub fn policy(&self) -> PhasePolicy {
        PhasePolicy {
            phase_threshold: self.phase_threshold,
            completion_threshold: self.completion_threshold,
            regression_margin: self.regression_margin,
            regression_window: self.regression_window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_mins: Option<u64>,
    #[serde(default = "default_max_commits")]
    pub max_commits: u32,
    #[serde(default = "default_max_violations")]
    pub max_violations_per_iteration: usize,
}

fn default_max_iterations() -> u32 {
    50
}

fn default_max_commits() -> u32 {
    200
}

fn default_max_violations() -> usize {
    5
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_runtime_mins: None,
            max_commits: default_max_commits(),
            max_violations_per_iteration: default_max_violations(),
        }
    }
}

impl LimitsConfig {
    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_mins.map(|mins| Duration::from_secs(mins * 60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls_per_turn: usize,
}

fn default_shell_timeout_secs() -> u64 {
    120
}

fn default_max_output_bytes() -> usize {
    16_000
}

fn default_max_tool_calls() -> usize {
    40
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: default_shell_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_tool_calls_per_turn: default_max_tool_calls(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Openai,
    Cli,
    Scripted,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendKind::Openai => "openai",
            BackendKind::Cli => "cli",
            BackendKind::Scripted => "scripted",
        })
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(BackendKind::Openai),
            "cli" => Ok(BackendKind::Cli),
            "scripted" => Ok(BackendKind::Scripted),
            other => Err(format!(
                "unknown backend '{}': expected openai, cli or scripted",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_cli_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Response script for the scripted backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Extra attempts when a verdict cannot be parsed.
    #[serde(default = "default_parse_retries")]
    pub parse_retries: u32,
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Openai
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    "qwen2.5-coder:32b".to_string()
}

fn default_cli_command() -> String {
    "claude".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_parse_retries() -> u32 {
    2
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: None,
            command: default_cli_command(),
            args: Vec::new(),
            script: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            parse_retries: default_parse_retries(),
        }
    }
}

impl BackendConfig {
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Files larger than this are listed but their contents are not shown.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Extra glob patterns hidden from every role's file view.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Shell command run before each review; its output becomes evidence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_command: Option<String>,
}

fn default_max_file_bytes() -> u64 {
    64 * 1024
}

fn default_max_context_chars() -> usize {
    120_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            max_context_chars: default_max_context_chars(),
            ignore: Vec::new(),
            review_command: None,
        }
    }
}

/// The parsed `tandem.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TandemToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub context: ContextConfig,
}

impl TandemToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse tandem.toml")
    }

    /// Load `.tandem/tandem.toml`, falling back to the user config file and
    /// then to defaults.
    pub fn load_or_default(tandem_dir: &Path) -> Result<Self> {
        let config_path = tandem_dir.join(CONFIG_FILE);
        if config_path.exists() {
            return Self::load(&config_path);
        }
        if let Some(user_path) = user_config_path()
            && user_path.exists()
        {
            tracing::debug!(path = %user_path.display(), "Using user config");
            return Self::load(&user_path);
        }
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize tandem.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in
    /// production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(kind) = lookup("TANDEM_BACKEND") {
            self.backend.kind = kind.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(model) = lookup("TANDEM_MODEL") {
            self.backend.model = model;
        }
        if let Some(url) = lookup("TANDEM_BASE_URL") {
            self.backend.base_url = url;
        }
        if let Some(cmd) = lookup("TANDEM_CLI_CMD") {
            self.backend.command = cmd;
        }
        Ok(())
    }

    /// Human-readable warnings for settings that parse but make no sense.
    pub fn validate(&self, project_dir: &Path) -> Vec<String> {
        let mut warnings = Vec::new();
        let session = &self.session;

        if session.completion_threshold > 100 || session.phase_threshold > 100 {
            warnings.push("Thresholds must be between 0 and 100".to_string());
        }
        if session.phase_threshold > session.completion_threshold {
            warnings.push(format!(
                "phase_threshold ({}) is above completion_threshold ({}): the session can never complete",
                session.phase_threshold, session.completion_threshold
            ));
        }
        if session.regression_margin > session.phase_threshold {
            warnings.push(format!(
                "regression_margin ({}) exceeds phase_threshold ({}): TESTING can never regress",
                session.regression_margin, session.phase_threshold
            ));
        }
        if self.limits.max_iterations == 0 {
            warnings.push("limits.max_iterations is 0: no iteration will run".to_string());
        }
        if self.limits.max_commits == 0 {
            warnings.push("limits.max_commits is 0: the session pauses immediately".to_string());
        }
        if self.limits.max_runtime_mins == Some(0) {
            warnings.push("limits.max_runtime_mins is 0: the session pauses immediately".to_string());
        }
        if self.sandbox.max_tool_calls_per_turn == 0 {
            warnings.push("sandbox.max_tool_calls_per_turn is 0: the implementer cannot act".to_string());
        }
        if self.sandbox.shell_timeout_secs == 0 {
            warnings.push("sandbox.shell_timeout_secs is 0: every shell command will time out".to_string());
        }
        for pattern in &self.context.ignore {
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!("Invalid ignore pattern '{}'", pattern));
            }
        }
        match self.backend.kind {
            BackendKind::Scripted => match &self.backend.script {
                None => warnings.push("backend.kind is scripted but backend.script is not set".to_string()),
                Some(script) => {
                    let path = if script.is_absolute() {
                        script.clone()
                    } else {
                        project_dir.join(script)
                    };
                    if !path.exists() {
                        warnings.push(format!("Script file not found: {}", path.display()));
                    }
                }
            },
            BackendKind::Openai => {
                if self.backend.base_url.trim().is_empty() {
                    warnings.push("backend.base_url is empty".to_string());
                }
            }
            BackendKind::Cli => {
                if self.backend.command.trim().is_empty() {
                    warnings.push("backend.command is empty".to_string());
                }
            }
        }

        warnings
    }
}

/// `<config dir>/tandem/tandem.toml`, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tandem").join(CONFIG_FILE))
}

/// Resolved configuration: the TOML layers plus CLI overrides and paths.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub tandem_dir: PathBuf,
    pub toml: TandemToml,
    pub verbose: bool,
}

impl Config {
    /// Load the configuration for `project_dir` (file → env).
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        // A missing .env is normal.
        let _ = dotenvy::from_path(project_dir.join(".env"));
        let tandem_dir = project_dir.join(METADATA_DIR);
        let mut toml = TandemToml::load_or_default(&tandem_dir)?;
        toml.apply_env(|key| std::env::var(key).ok())?;
        Ok(Self {
            project_dir,
            tandem_dir,
            toml,
            verbose: false,
        })
    }

    /// Load and apply CLI overrides.
    pub fn with_cli_args(project_dir: &Path, verbose: bool, max_iterations: Option<u32>) -> Result<Self> {
        let mut config = Self::load(project_dir)?;
        config.verbose = verbose;
        if let Some(max) = max_iterations {
            config.toml.limits.max_iterations = max;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.tandem_dir.join(CONFIG_FILE)
    }

    pub fn state_file(&self) -> PathBuf {
        self.tandem_dir.join("state.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.tandem_dir.join("lock")
    }

    pub fn pause_file(&self) -> PathBuf {
        self.tandem_dir.join("PAUSE")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.tandem_dir.join("audit")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.tandem_dir.join("logs")
    }

    /// Absolute path of the idea specification.
    pub fn idea_file(&self) -> PathBuf {
        let idea = &self.toml.project.idea_file;
        if idea.is_absolute() {
            idea.clone()
        } else {
            self.project_dir.join(idea)
        }
    }

    pub fn set_idea_file(&mut self, path: &Path) -> Result<()> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        };
        let absolute = absolute
            .canonicalize()
            .with_context(|| format!("Idea file not found: {}", path.display()))?;
        if !absolute.starts_with(&self.project_dir) {
            bail!("Idea file must live inside the project: {}", absolute.display());
        }
        self.toml.project.idea_file = absolute
            .strip_prefix(&self.project_dir)
            .map(Path::to_path_buf)
            .unwrap_or(absolute.clone());
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.tandem_dir, &self.audit_dir(), &self.log_dir()] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate(&self.project_dir);
        if !self.idea_file().exists() {
            warnings.push(format!("Idea file not found: {}", self.idea_file().display()));
        }
        warnings
    }
}
