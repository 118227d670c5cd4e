//! Model Gateway: one request/response contract over every inference backend.
//!
//! The orchestrator and role agents only see [`ModelGateway`]. Backends are a
//! closed set ([`Backend`]); how each one talks to its model (HTTP, a
//! subprocess, a scripted queue) stays behind the trait.

pub mod cli;
pub mod openai;
pub mod scripted;

pub use cli::CliBackend;
pub use openai::OpenAiBackend;
pub use scripted::ScriptedBackend;

use crate::config::{BackendConfig, BackendKind};
use crate::errors::GatewayError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The role a request is made on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Implementer,
    Reviewer,
    Alignment,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Implementer => "implementer",
            Role::Reviewer => "reviewer",
            Role::Alignment => "alignment",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One ordered context entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// For tool messages: the call this is the result of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(MessageRole::Assistant, content)
        }
    }

    pub fn tool_result(call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.to_string()),
            ..Self::plain(MessageRole::Tool, content)
        }
    }
}

/// A tool the model may call, described by a JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub role: Role,
    pub messages: Vec<Message>,
    /// Empty for roles that must answer with a verdict.
    pub tools: Vec<ToolSchema>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model declared its turn finished.
    EndTurn,
    /// The model wants tool results before continuing.
    ToolUse,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub stop_reason: StopReason,
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Make exactly one model call.
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, GatewayError>;
}

/// Bounded exponential backoff for retryable gateway failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt)))
    }
}

/// Call `gateway`, retrying retryable failures with backoff.
///
/// Cancellation is checked before every attempt and raced against each
/// backoff sleep; an attempt already in flight is never interrupted.
pub async fn call_with_retry(
    gateway: &dyn ModelGateway,
    request: &ModelRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<ModelResponse, GatewayError> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        match gateway.complete(request).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    backend = gateway.name(),
                    role = %request.role,
                    "Model call failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    policy.max_retries + 1,
                    delay,
                    e
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(backend = gateway.name(), role = %request.role, "Model call failed: {}", e);
                return Err(e);
            }
        }
    }
}

/// The closed set of supported backends.
pub enum Backend {
    OpenAi(OpenAiBackend),
    Cli(CliBackend),
    Scripted(ScriptedBackend),
}

impl Backend {
    /// Build the configured backend. `project_dir` anchors relative paths.
    pub fn from_config(config: &BackendConfig, project_dir: &Path) -> Result<Self> {
        let backend = match config.kind {
            BackendKind::Openai => {
                let api_key = match &config.api_key_env {
                    Some(var) => std::env::var(var)
                        .with_context(|| format!("Environment variable {} is not set", var))?,
                    None => String::new(),
                };
                Backend::OpenAi(OpenAiBackend::new(
                    &config.base_url,
                    &config.model,
                    api_key,
                    Duration::from_secs(config.request_timeout_secs),
                )?)
            }
            BackendKind::Cli => Backend::Cli(CliBackend::new(
                &config.command,
                config.args.clone(),
                project_dir,
                Duration::from_secs(config.request_timeout_secs),
            )),
            BackendKind::Scripted => {
                let script = config
                    .script
                    .as_ref()
                    .context("backend.script must be set for the scripted backend")?;
                let path = if script.is_absolute() {
                    script.clone()
                } else {
                    project_dir.join(script)
                };
                Backend::Scripted(ScriptedBackend::load(&path)?)
            }
        };
        Ok(backend)
    }
}

#[async_trait]
impl ModelGateway for Backend {
    fn name(&self) -> &str {
        match self {
            Backend::OpenAi(b) => b.name(),
            Backend::Cli(b) => b.name(),
            Backend::Scripted(b) => b.name(),
        }
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, GatewayError> {
        match self {
            Backend::OpenAi(b) => b.complete(request).await,
            Backend::Cli(b) => b.complete(request).await,
            Backend::Scripted(b) => b.complete(request).await,
        }
    }
}
