//! OpenAI-compatible `/chat/completions` backend.
//!
//! Works against hosted APIs and local servers (llama.cpp, vLLM, Ollama)
//! that speak the same wire format, including function-calling tools.

use super::{Message, MessageRole, ModelGateway, ModelRequest, ModelResponse, StopReason, ToolCallRequest};
use crate::errors::GatewayError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(base_url: &str, model: &str, api_key: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            timeout,
        })
    }

    fn to_wire(&self, request: &ModelRequest) -> ChatRequest {
        let messages = request.messages.iter().map(WireMessage::from).collect();
        let tools = (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .map(|tool| WireTool {
                    tool_type: "function".into(),
                    function: WireFunction {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect()
        });
        ChatRequest {
            model: self.model.clone(),
            messages,
            tools,
        }
    }

    fn from_wire(response: ChatResponse) -> Result<ModelResponse, GatewayError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Transient("response contained no choices".into()))?;

        let tool_calls: Vec<ToolCallRequest> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCallRequest {
                id: call.id,
                name: call.function.name,
                // Malformed arguments surface as an invalid-arguments tool failure.
                arguments: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::String(call.function.arguments)),
            })
            .collect();

        let stop_reason = match choice.finish_reason.as_deref() {
            Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
            Some("length") => StopReason::MaxTokens,
            Some("stop") | None if tool_calls.is_empty() => StopReason::EndTurn,
            Some("stop") | None => StopReason::ToolUse,
            Some(_) => StopReason::Other,
        };

        Ok(ModelResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            stop_reason,
        })
    }

    fn classify(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout {
                secs: self.timeout.as_secs(),
            }
        } else if err.is_builder() {
            GatewayError::Fatal(format!("invalid request: {}", err))
        } else {
            GatewayError::Transient(err.to_string())
        }
    }
}

fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let message = format!("HTTP {}: {}", status, body.chars().take(500).collect::<String>());
    match status.as_u16() {
        408 | 429 => GatewayError::Transient(message),
        s if s >= 500 => GatewayError::Transient(message),
        _ => GatewayError::Fatal(message),
    }
}

#[async_trait]
impl ModelGateway for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.to_wire(request);
        tracing::debug!(url = %url, role = %request.role, messages = body.messages.len(), "Sending chat completion");

        let mut builder = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(format!("malformed response body: {}", e)))?;
        Self::from_wire(parsed)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        let tool_calls = (!msg.tool_calls.is_empty()).then(|| {
            msg.tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    call_type: "function".into(),
                    function: WireCallFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect()
        });
        let content = match msg.role {
            MessageRole::Assistant if msg.content.is_empty() => None,
            MessageRole::Tool if msg.content.trim().is_empty() => Some("(no output)".into()),
            _ => Some(msg.content.clone()),
        };
        Self {
            role,
            content,
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default)]
    call_type: String,
    function: WireCallFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireCallFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}
