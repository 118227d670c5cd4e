//! Implementer role: a bounded loop of model calls and tool executions.
//!
//! context → model → tool calls through the sandbox → results appended →
//! model again, until the model ends its turn, the per-turn tool-call budget
//! runs out, or cancellation is requested. Cancellation is only observed
//! between tool calls and between model calls.

use super::Role;
use crate::errors::{GatewayError, RoleError};
use crate::gateway::{Message, ModelGateway, ModelRequest, RetryPolicy, StopReason, call_with_retry};
use crate::sandbox::{Sandbox, ToolCallRecord, ToolContext, ToolRegistry};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    /// The model declared the turn finished.
    Finished,
    /// The per-turn tool-call budget was spent.
    BudgetExhausted,
    /// Cancellation was requested at a safe point.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub records: Vec<ToolCallRecord>,
    /// The model's own words during the turn. Only ever logged; never
    /// persisted and never shown to another role.
    pub narrative: String,
    pub end: TurnEnd,
    /// Notes added through `memory_append`.
    pub memory_notes: Vec<String>,
    /// Commits the implementer made itself.
    pub commits: u32,
}

impl TurnOutcome {
    pub fn violations(&self) -> usize {
        self.records.iter().filter(|r| r.is_violation()).count()
    }

    pub fn failures(&self) -> usize {
        self.records.iter().filter(|r| !r.succeeded()).count()
    }

    pub fn truncations(&self) -> usize {
        self.records.iter().filter(|r| r.truncated).count()
    }

    /// A factual summary built from the tool-call records alone.
    pub fn summary(&self) -> String {
        let mut touched = BTreeSet::new();
        let mut tools = std::collections::BTreeMap::<&str, usize>::new();
        for record in &self.records {
            *tools.entry(record.tool.as_str()).or_default() += 1;
            if record.succeeded()
                && record.tool == "write_file"
                && let Some(path) = record.arguments.get("path").and_then(|p| p.as_str())
            {
                touched.insert(path.to_string());
            }
        }
        let mut summary = format!(
            "{} tool calls ({} failed, {} sandbox violations); turn ended: {}",
            self.records.len(),
            self.failures(),
            self.violations(),
            match self.end {
                TurnEnd::Finished => "finished",
                TurnEnd::BudgetExhausted => "tool-call budget exhausted",
                TurnEnd::Cancelled => "cancelled",
            }
        );
        if !tools.is_empty() {
            let counts: Vec<String> = tools.iter().map(|(t, n)| format!("{} x{}", t, n)).collect();
            summary.push_str(&format!("\ntools: {}", counts.join(", ")));
        }
        if !touched.is_empty() {
            let files: Vec<String> = touched.into_iter().collect();
            summary.push_str(&format!("\nwrote: {}", files.join(", ")));
        }
        let failed: Vec<String> = self
            .records
            .iter()
            .filter_map(|r| r.error_kind().map(|kind| format!("{} ({})", r.tool, kind)))
            .collect();
        if !failed.is_empty() {
            summary.push_str(&format!("\nfailed: {}", failed.join(", ")));
        }
        summary
    }
}

pub struct Implementer {
    gateway: Arc<dyn ModelGateway>,
    retry: RetryPolicy,
    max_tool_calls: usize,
}

impl Implementer {
    pub fn new(gateway: Arc<dyn ModelGateway>, retry: RetryPolicy, max_tool_calls: usize) -> Self {
        Self {
            gateway,
            retry,
            max_tool_calls,
        }
    }

    pub async fn run_turn(
        &self,
        messages: Vec<Message>,
        sandbox: &Sandbox,
        registry: &ToolRegistry,
        memory: &[String],
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, RoleError> {
        let mut request = ModelRequest {
            role: Role::Implementer,
            messages,
            tools: registry.schemas(),
        };
        let mut ctx = ToolContext::new(sandbox, memory);
        let mut records = Vec::new();
        let mut narrative = Vec::new();

        let end = 'turn: loop {
            if cancel.is_cancelled() {
                break TurnEnd::Cancelled;
            }
            let response = match call_with_retry(self.gateway.as_ref(), &request, &self.retry, cancel).await {
                Ok(response) => response,
                Err(GatewayError::Cancelled) => break TurnEnd::Cancelled,
                Err(e) => return Err(e.into()),
            };
            if !response.content.trim().is_empty() {
                narrative.push(response.content.clone());
            }
            request
                .messages
                .push(Message::assistant(response.content, response.tool_calls.clone()));

            if response.tool_calls.is_empty() {
                break TurnEnd::Finished;
            }
            for call in &response.tool_calls {
                if records.len() >= self.max_tool_calls {
                    tracing::warn!(budget = self.max_tool_calls, "Tool-call budget exhausted");
                    break 'turn TurnEnd::BudgetExhausted;
                }
                if cancel.is_cancelled() {
                    break 'turn TurnEnd::Cancelled;
                }
                let record = registry.execute(call, &mut ctx).await;
                tracing::debug!(
                    tool = %record.tool,
                    ok = record.succeeded(),
                    duration_ms = record.duration_ms,
                    "Tool call"
                );
                request
                    .messages
                    .push(Message::tool_result(&call.id, record.render()));
                records.push(record);
            }
            if response.stop_reason == StopReason::EndTurn {
                break TurnEnd::Finished;
            }
        };

        let outcome = TurnOutcome {
            records,
            narrative: narrative.join("\n"),
            end,
            memory_notes: ctx.new_notes,
            commits: ctx.commits,
        };
        tracing::info!(
            tool_calls = outcome.records.len(),
            failed = outcome.failures(),
            violations = outcome.violations(),
            end = ?outcome.end,
            "Implementer turn complete"
        );
        tracing::debug!(narrative = %outcome.narrative, "Implementer narrative");
        Ok(outcome)
    }
}
