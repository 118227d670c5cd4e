//! Alignment checker: periodically compares the workspace with the idea
//! specification and, on drift, supplies corrective instructions.

use super::prompts::ALIGNMENT_OUTPUT;
use super::{AlignmentVerdict, Role, request_verdict};
use crate::errors::RoleError;
use crate::gateway::{Message, ModelGateway, ModelRequest, RetryPolicy};
use crate::util::extract_json_object;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct AlignmentChecker {
    gateway: Arc<dyn ModelGateway>,
    retry: RetryPolicy,
    parse_retries: u32,
}

impl AlignmentChecker {
    pub fn new(gateway: Arc<dyn ModelGateway>, retry: RetryPolicy, parse_retries: u32) -> Self {
        Self {
            gateway,
            retry,
            parse_retries,
        }
    }

    pub async fn check(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<AlignmentVerdict, RoleError> {
        let request = ModelRequest {
            role: Role::Alignment,
            messages,
            tools: Vec::new(),
        };
        let verdict = request_verdict(
            self.gateway.as_ref(),
            request,
            &self.retry,
            self.parse_retries,
            ALIGNMENT_OUTPUT,
            cancel,
            parse_alignment,
        )
        .await?;
        tracing::info!(aligned = verdict.aligned, "Alignment verdict");
        Ok(verdict)
    }
}

/// Parse an alignment reply. A drift verdict must say how to correct it.
pub fn parse_alignment(text: &str) -> Result<AlignmentVerdict, String> {
    let json = extract_json_object(text)
        .ok_or_else(|| "no JSON object found".to_string())?;
    let verdict: AlignmentVerdict =
        serde_json::from_str(json).map_err(|e| format!("verdict JSON has the wrong shape: {}", e))?;
    if verdict.aligned {
        return Ok(AlignmentVerdict {
            aligned: true,
            correction_instructions: None,
        });
    }
    match verdict.correction_instructions.as_deref().map(str::trim) {
        Some(instructions) if !instructions.is_empty() => Ok(AlignmentVerdict {
            aligned: false,
            correction_instructions: Some(instructions.to_string()),
        }),
        _ => Err("aligned is false but correction_instructions is empty".into()),
    }
}
