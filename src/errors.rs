//! Typed error hierarchy for the tandem orchestrator.
//!
//! One enum per subsystem boundary:
//! - `SandboxError`: tool execution inside the workspace root
//! - `GatewayError`: model backend calls
//! - `RoleError`: role agents turning model output into verdicts
//! - `StateError`: persisted session state
//! - `CheckpointError`: version-control checkpoints and rollback
//! - `OrchestratorError`: the control loop, wrapping all of the above
//!
//! Score regressions are not errors; they are policy events handled by
//! rollback (see `phase::PhasePolicy::detect_regression`).

use std::path::PathBuf;
use thiserror::Error;

/// Errors from a single sandboxed tool call.
///
/// Every variant leaves the workspace untouched except `Timeout`, where the
/// command may have made partial progress before it was killed.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Path '{path}' escapes the workspace root: {reason}")]
    Containment { path: String, reason: String },

    #[error("Command timed out after {secs}s")]
    Timeout { secs: u64, partial_output: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Version control error: {0}")]
    Vcs(String),
}

impl SandboxError {
    /// Short machine-readable kind, used in tool call records and audit lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Containment { .. } => "containment",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::Io { .. } => "io",
            SandboxError::InvalidArguments { .. } => "invalid_arguments",
            SandboxError::UnknownTool(_) => "unknown_tool",
            SandboxError::Vcs(_) => "vcs",
        }
    }

    pub fn is_containment(&self) -> bool {
        matches!(self, SandboxError::Containment { .. })
    }
}

/// Errors from a model backend call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("Model request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Transient backend failure: {0}")]
    Transient(String),

    #[error("Fatal backend failure: {0}")]
    Fatal(String),

    #[error("Model call cancelled before completion")]
    Cancelled,
}

impl GatewayError {
    /// Timeouts and transient connection faults are retried with backoff;
    /// authentication and configuration faults are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. } | GatewayError::Transient(_))
    }
}

/// Errors from a role agent invocation.
#[derive(Debug, Error)]
pub enum RoleError {
    #[error("{role} response did not match the required shape after {attempts} attempts: {message}")]
    Parse {
        role: String,
        attempts: u32,
        message: String,
    },

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Errors from the persisted session state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Session state failed validation: {0}")]
    Validation(String),

    #[error("No session state found at {0}")]
    Missing(PathBuf),

    #[error("Another controller holds the session lock at {0}")]
    Locked(PathBuf),

    #[error("State I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the checkpoint manager.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Checkpoint {0} is not known to the repository")]
    UnknownCommit(String),

    #[error("Failed to clean untracked path {path}: {source}")]
    Clean {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the orchestrator control loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Role(#[from] RoleError),

    #[error(transparent)]
    Transition(#[from] crate::phase::TransitionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
