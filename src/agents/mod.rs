//! Role agents: the implementer, which acts through tools, and the reviewer
//! and alignment checker, which answer with structured verdicts.
//!
//! All three talk to the model only through [`ModelGateway`]. Context views
//! are built by [`context::ContextBuilder`]; what each role may see is
//! decided there.

pub mod alignment;
pub mod context;
pub mod implementer;
pub mod prompts;
pub mod reviewer;

pub use alignment::AlignmentChecker;
pub use context::ContextBuilder;
pub use implementer::{Implementer, TurnEnd, TurnOutcome};
pub use reviewer::Reviewer;

pub use crate::gateway::Role;

use crate::errors::RoleError;
use crate::gateway::{Message, ModelGateway, ModelRequest, RetryPolicy, call_with_retry};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A change to the open work items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoDelta {
    Add(String),
    Done(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub score: u8,
    /// Advisory only; the transition table decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_recommendation: Option<String>,
    #[serde(default)]
    pub next_instructions: String,
    #[serde(default)]
    pub todo_deltas: Vec<TodoDelta>,
    #[serde(default)]
    pub memory_notes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignmentVerdict {
    pub aligned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_instructions: Option<String>,
}

/// One model call per attempt, parsed into `T`. A reply that fails to parse
/// is answered with `reminder` and retried up to `parse_retries` times.
pub(crate) async fn request_verdict<T>(
    gateway: &dyn ModelGateway,
    mut request: ModelRequest,
    retry: &RetryPolicy,
    parse_retries: u32,
    reminder: &str,
    cancel: &CancellationToken,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<T, RoleError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let response = call_with_retry(gateway, &request, retry, cancel).await?;
        match parse(&response.content) {
            Ok(verdict) => return Ok(verdict),
            Err(message) if attempt <= parse_retries => {
                tracing::warn!(
                    role = %request.role,
                    attempt,
                    "Unparseable verdict, retrying with a reminder: {}",
                    message
                );
                request.messages.push(Message::assistant(response.content, Vec::new()));
                request.messages.push(Message::user(format!(
                    "Your reply could not be used: {}.\n\n{}",
                    message, reminder
                )));
            }
            Err(message) => {
                return Err(RoleError::Parse {
                    role: request.role.to_string(),
                    attempts: attempt,
                    message,
                });
            }
        }
    }
}
