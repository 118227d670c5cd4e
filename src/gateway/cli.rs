//! Subprocess backend: pipes a rendered prompt to an agent CLI on stdin and
//! reads its reply from stdout.
//!
//! Tool calls travel in-band as `<tool_call>{"name": ..., "arguments": {...}}</tool_call>`
//! tags; anything outside the tags is the reply text.

use super::{MessageRole, ModelGateway, ModelRequest, ModelResponse, StopReason, ToolCallRequest};
use crate::errors::GatewayError;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

static TOOL_CALL_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>(.*?)</tool_call>").expect("valid regex"));

pub struct CliBackend {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CliBackend {
    pub fn new(command: &str, args: Vec<String>, working_dir: &Path, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            args,
            working_dir: working_dir.to_path_buf(),
            timeout,
        }
    }

    /// Flatten the request into one prompt document.
    pub fn render_prompt(request: &ModelRequest) -> String {
        let mut prompt = String::new();
        for msg in &request.messages {
            let heading = match msg.role {
                MessageRole::System => "SYSTEM".to_string(),
                MessageRole::User => "USER".to_string(),
                MessageRole::Assistant => "ASSISTANT".to_string(),
                MessageRole::Tool => format!(
                    "TOOL RESULT {}",
                    msg.tool_call_id.as_deref().unwrap_or_default()
                ),
            };
            prompt.push_str(&format!("## {}\n{}\n", heading, msg.content));
            for call in &msg.tool_calls {
                prompt.push_str(&format!(
                    "<tool_call>{}</tool_call>\n",
                    serde_json::json!({"id": call.id, "name": call.name, "arguments": call.arguments})
                ));
            }
            prompt.push('\n');
        }

        if !request.tools.is_empty() {
            prompt.push_str("## TOOLS\n");
            prompt.push_str(
                "To call a tool, emit a tool_call tag holding a JSON object with \"name\" and \"arguments\". \
                 Reply without any tool_call tag when your turn is finished.\n",
            );
            for tool in &request.tools {
                prompt.push_str(&format!(
                    "- {}: {}\n  parameters: {}\n",
                    tool.name, tool.description, tool.parameters
                ));
            }
        }
        prompt
    }

    /// Split stdout into reply text and tool calls.
    pub fn parse_reply(stdout: &str) -> ModelResponse {
        let mut tool_calls = Vec::new();
        for (index, captures) in TOOL_CALL_TAG.captures_iter(stdout).enumerate() {
            let body = captures.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let call = match serde_json::from_str::<ToolCallRequest>(body) {
                Ok(mut call) => {
                    if call.id.is_empty() {
                        call.id = format!("cli_{}", index + 1);
                    }
                    call
                }
                Err(e) => ToolCallRequest {
                    id: format!("cli_{}", index + 1),
                    name: "malformed_tool_call".into(),
                    arguments: serde_json::Value::String(format!("{}: {}", e, body)),
                },
            };
            tool_calls.push(call);
        }
        let content = TOOL_CALL_TAG.replace_all(stdout, "").trim().to_string();
        let stop_reason = if tool_calls.is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        };
        ModelResponse {
            content,
            tool_calls,
            stop_reason,
        }
    }
}

#[async_trait]
impl ModelGateway for CliBackend {
    fn name(&self) -> &str {
        &self.command
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, GatewayError> {
        let prompt = Self::render_prompt(request);
        tracing::debug!(command = %self.command, role = %request.role, bytes = prompt.len(), "Invoking CLI backend");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Fatal(format!("failed to spawn {}: {}", self.command, e)))?;

        // The prompt is fed while stdout is drained, all under the request
        // timeout; a child that never reads stdin must not stall the call.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut pipe) = stdin {
                pipe.write_all(prompt.as_bytes()).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let exchange = async { tokio::join!(feed, child.wait_with_output()) };

        let (fed, output) = match timeout(self.timeout, exchange).await {
            Ok((fed, output)) => (fed, output.map_err(|e| GatewayError::Transient(e.to_string()))?),
            Err(_) => {
                return Err(GatewayError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };
        if let Err(e) = fed {
            tracing::debug!(command = %self.command, "CLI backend closed stdin early: {}", e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GatewayError::Transient(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim().chars().take(500).collect::<String>()
            )));
        }

        Ok(Self::parse_reply(&String::from_utf8_lossy(&output.stdout)))
    }
}
