//! Deterministic backend replaying per-role response queues from a JSON
//! script. Used for dry runs and reproducible end-to-end tests.
//!
//! ```json
//! {
//!   "implementer": [
//!     {"tool_calls": [{"name": "write_file", "arguments": {"path": "a.rs", "content": ""}}], "finish": true}
//!   ],
//!   "reviewer": [{"content": "{\"score\": 40, \"next_instructions\": \"add tests\"}"}],
//!   "alignment": [{"error": {"kind": "transient", "message": "flaky"}}, {"content": "{\"aligned\": true}"}]
//! }
//! ```

use super::{ModelGateway, ModelRequest, ModelResponse, Role, StopReason, ToolCallRequest};
use crate::errors::GatewayError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedErrorKind {
    Timeout,
    Transient,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedError {
    pub kind: ScriptedErrorKind,
    #[serde(default)]
    pub message: String,
}

/// One queued reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptedReply {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Declare the turn finished even though tool calls are attached.
    #[serde(default)]
    pub finish: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ScriptedError>,
}

impl ScriptedReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn tools(tool_calls: Vec<ToolCallRequest>, finish: bool) -> Self {
        Self {
            tool_calls,
            finish,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub implementer: Vec<ScriptedReply>,
    #[serde(default)]
    pub reviewer: Vec<ScriptedReply>,
    #[serde(default)]
    pub alignment: Vec<ScriptedReply>,
}

struct Queues {
    replies: BTreeMap<Role, VecDeque<ScriptedReply>>,
    next_id: u64,
}

pub struct ScriptedBackend {
    queues: Mutex<Queues>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        let replies = BTreeMap::from([
            (Role::Implementer, script.implementer.into()),
            (Role::Reviewer, script.reviewer.into()),
            (Role::Alignment, script.alignment.into()),
        ]);
        Self {
            queues: Mutex::new(Queues { replies, next_id: 0 }),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read backend script {}", path.display()))?;
        let script: Script = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse backend script {}", path.display()))?;
        Ok(Self::new(script))
    }

    /// Replies left for `role`.
    pub fn remaining(&self, role: Role) -> usize {
        self.queues
            .lock()
            .map(|q| q.replies.get(&role).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl ModelGateway for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, GatewayError> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| GatewayError::Fatal("scripted backend lock poisoned".into()))?;
        let reply = queues
            .replies
            .get_mut(&request.role)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                GatewayError::Fatal(format!("script exhausted for role {}", request.role))
            })?;

        if let Some(error) = reply.error {
            return Err(match error.kind {
                ScriptedErrorKind::Timeout => GatewayError::Timeout { secs: 0 },
                ScriptedErrorKind::Transient => GatewayError::Transient(error.message),
                ScriptedErrorKind::Fatal => GatewayError::Fatal(error.message),
            });
        }

        let mut tool_calls = reply.tool_calls;
        for call in &mut tool_calls {
            if call.id.is_empty() {
                queues.next_id += 1;
                call.id = format!("scripted_{}", queues.next_id);
            }
        }
        let stop_reason = if tool_calls.is_empty() || reply.finish {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        };
        Ok(ModelResponse {
            content: reply.content,
            tool_calls,
            stop_reason,
        })
    }
}
