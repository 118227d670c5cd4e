//! Reviewer role: one model call, parsed into a [`ReviewVerdict`].
//!
//! JSON is the requested shape. Replies in the older markdown layout
//! ("Completeness score: N", "Remaining work", "Next instructions:") are
//! accepted too.

use super::prompts::REVIEW_OUTPUT;
use super::{ReviewVerdict, Role, TodoDelta, request_verdict};
use crate::errors::RoleError;
use crate::gateway::{Message, ModelGateway, ModelRequest, RetryPolicy};
use crate::util::extract_json_object;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;

static SCORE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)completeness\s+score\W*?(\d{1,3})").expect("valid regex")
});

pub struct Reviewer {
    gateway: Arc<dyn ModelGateway>,
    retry: RetryPolicy,
    parse_retries: u32,
}

impl Reviewer {
    pub fn new(gateway: Arc<dyn ModelGateway>, retry: RetryPolicy, parse_retries: u32) -> Self {
        Self {
            gateway,
            retry,
            parse_retries,
        }
    }

    pub async fn review(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<ReviewVerdict, RoleError> {
        let request = ModelRequest {
            role: Role::Reviewer,
            messages,
            tools: Vec::new(),
        };
        let verdict = request_verdict(
            self.gateway.as_ref(),
            request,
            &self.retry,
            self.parse_retries,
            REVIEW_OUTPUT,
            cancel,
            parse_review,
        )
        .await?;
        tracing::info!(score = verdict.score, "Review verdict");
        Ok(verdict)
    }
}

fn score_from(value: &Value) -> Result<u8, String> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| format!("score must be a number, got {}", value))?;
    if !(0.0..=100.0).contains(&number) {
        return Err(format!("score {} is outside 0-100", number));
    }
    Ok(number.round() as u8)
}

/// Parse a reviewer reply.
pub fn parse_review(text: &str) -> Result<ReviewVerdict, String> {
    if let Some(json) = extract_json_object(text)
        && let Ok(value) = serde_json::from_str::<Value>(json)
        && let Some(score) = value.get("score")
    {
        let score = score_from(score)?;
        let mut normalized = value.clone();
        normalized["score"] = Value::from(score);
        return serde_json::from_value::<ReviewVerdict>(normalized)
            .map_err(|e| format!("verdict JSON has the wrong shape: {}", e));
    }
    parse_markdown_review(text)
}

fn parse_markdown_review(text: &str) -> Result<ReviewVerdict, String> {
    let captures = SCORE_LINE
        .captures(text)
        .ok_or_else(|| "no score found (expected a JSON object with \"score\")".to_string())?;
    let score: u32 = captures[1]
        .parse()
        .map_err(|_| "unreadable completeness score".to_string())?;
    if score > 100 {
        return Err(format!("score {} is outside 0-100", score));
    }

    enum Section {
        Other,
        Remaining,
        Next,
    }
    let mut section = Section::Other;
    let mut todos = Vec::new();
    let mut next = Vec::new();
    for line in text.lines() {
        let lower = line.trim().to_lowercase();
        if lower.contains("completeness score") {
            section = Section::Other;
            continue;
        }
        if lower.contains("remaining work") {
            section = Section::Remaining;
            continue;
        }
        if lower.contains("next instructions") {
            section = Section::Next;
            if let Some((_, rest)) = line.split_once(':')
                && !rest.trim().is_empty()
            {
                next.push(rest.trim().to_string());
            }
            continue;
        }
        if lower.starts_with('#') {
            section = Section::Other;
            continue;
        }
        match section {
            Section::Remaining => {
                let item = line
                    .trim()
                    .trim_start_matches(|c: char| c == '-' || c == '*' || c.is_ascii_digit() || c == '.')
                    .trim();
                if !item.is_empty() {
                    todos.push(TodoDelta::Add(item.to_string()));
                }
            }
            Section::Next => next.push(line.to_string()),
            Section::Other => {}
        }
    }

    Ok(ReviewVerdict {
        score: score as u8,
        phase_recommendation: None,
        next_instructions: next.join("\n").trim().to_string(),
        todo_deltas: todos,
        memory_notes: Vec::new(),
    })
}
