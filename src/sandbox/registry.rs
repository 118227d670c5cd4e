//! Tool registry: schemas advertised to the implementer and the handlers
//! that execute them through the sandbox.
//!
//! Every call goes through [`ToolRegistry::execute`], which produces exactly
//! one [`ToolCallRecord`] whether the call succeeds, fails, or names a tool
//! nobody registered.

use super::{Sandbox, ToolCallRecord, ToolStatus};
use crate::errors::SandboxError;
use crate::gateway::{ToolCallRequest, ToolSchema};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

/// Per-turn context handed to every handler.
pub struct ToolContext<'a> {
    pub sandbox: &'a Sandbox,
    /// The implementer's persisted notes at the start of the turn.
    pub memory: &'a [String],
    /// Notes appended during this turn.
    pub new_notes: Vec<String>,
    /// Commits created through `vcs_commit` during this turn.
    pub commits: u32,
}

impl<'a> ToolContext<'a> {
    pub fn new(sandbox: &'a Sandbox, memory: &'a [String]) -> Self {
        Self {
            sandbox,
            memory,
            new_notes: Vec::new(),
            commits: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub resolved_path: Option<PathBuf>,
}

impl ToolOutput {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            resolved_path: None,
        }
    }

    fn at(path: PathBuf, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            resolved_path: Some(path),
        }
    }
}

/// A named tool. Extension tools implement this and are registered by name.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn schema(&self) -> ToolSchema;

    async fn call(&self, args: &Value, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, SandboxError>;
}

fn str_arg<'v>(tool: &str, args: &'v Value, key: &str) -> Result<&'v str, SandboxError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SandboxError::InvalidArguments {
            tool: tool.to_string(),
            message: format!("missing string argument '{}'", key),
        })
}

fn schema(name: &str, description: &str, properties: Value, required: &[&str]) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: description.to_string(),
        parameters: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

struct RunShell;
struct ReadFile;
struct WriteFile;
struct ListDirectory;
struct VcsCommit;
struct MemoryRead;
struct MemoryAppend;

#[async_trait]
impl ToolHandler for RunShell {
    fn schema(&self) -> ToolSchema {
        schema(
            "run_shell",
            "Run a shell command with the workspace root as working directory.",
            json!({"command": {"type": "string"}}),
            &["command"],
        )
    }

    async fn call(&self, args: &Value, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, SandboxError> {
        let command = str_arg("run_shell", args, "command")?;
        let output = ctx.sandbox.run_shell(command).await?;
        Ok(ToolOutput::text(output.render()))
    }
}

#[async_trait]
impl ToolHandler for ReadFile {
    fn schema(&self) -> ToolSchema {
        schema(
            "read_file",
            "Read a file in the workspace.",
            json!({"path": {"type": "string"}}),
            &["path"],
        )
    }

    async fn call(&self, args: &Value, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, SandboxError> {
        let (path, content) = ctx.sandbox.read_file(str_arg("read_file", args, "path")?)?;
        Ok(ToolOutput::at(path, content))
    }
}

#[async_trait]
impl ToolHandler for WriteFile {
    fn schema(&self) -> ToolSchema {
        schema(
            "write_file",
            "Create or overwrite a file in the workspace. Parent directories are created.",
            json!({"path": {"type": "string"}, "content": {"type": "string"}}),
            &["path", "content"],
        )
    }

    async fn call(&self, args: &Value, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, SandboxError> {
        let raw = str_arg("write_file", args, "path")?;
        let content = str_arg("write_file", args, "content")?;
        let path = ctx.sandbox.write_file(raw, content)?;
        Ok(ToolOutput::at(path, format!("wrote {} bytes to {}", content.len(), raw)))
    }
}

#[async_trait]
impl ToolHandler for ListDirectory {
    fn schema(&self) -> ToolSchema {
        schema(
            "list_directory",
            "List a directory in the workspace (default: the root).",
            json!({"path": {"type": "string"}}),
            &[],
        )
    }

    async fn call(&self, args: &Value, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, SandboxError> {
        let raw = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let (path, entries) = ctx.sandbox.list_directory(raw)?;
        let text = if entries.is_empty() {
            "(empty)".to_string()
        } else {
            entries.join("\n")
        };
        Ok(ToolOutput::at(path, text))
    }
}

#[async_trait]
impl ToolHandler for VcsCommit {
    fn schema(&self) -> ToolSchema {
        schema(
            "vcs_commit",
            "Commit all workspace changes with a message.",
            json!({"message": {"type": "string"}}),
            &["message"],
        )
    }

    async fn call(&self, args: &Value, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, SandboxError> {
        let message = str_arg("vcs_commit", args, "message")?;
        let text = match ctx.sandbox.commit(message)? {
            Some(sha) => {
                ctx.commits += 1;
                format!("committed {}", sha)
            }
            None => "nothing to commit".to_string(),
        };
        Ok(ToolOutput::text(text))
    }
}

#[async_trait]
impl ToolHandler for MemoryRead {
    fn schema(&self) -> ToolSchema {
        schema(
            "memory_read",
            "Read the notes you saved in earlier iterations.",
            json!({}),
            &[],
        )
    }

    async fn call(&self, _args: &Value, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, SandboxError> {
        let notes: Vec<&String> = ctx.memory.iter().chain(ctx.new_notes.iter()).collect();
        let text = if notes.is_empty() {
            "(no notes)".to_string()
        } else {
            notes
                .iter()
                .map(|n| format!("- {}", n))
                .collect::<Vec<_>>()
                .join("\n")
        };
        Ok(ToolOutput::text(text))
    }
}

#[async_trait]
impl ToolHandler for MemoryAppend {
    fn schema(&self) -> ToolSchema {
        schema(
            "memory_append",
            "Save a short note for future iterations (a fact or convention, not a progress report).",
            json!({"note": {"type": "string"}}),
            &["note"],
        )
    }

    async fn call(&self, args: &Value, ctx: &mut ToolContext<'_>) -> Result<ToolOutput, SandboxError> {
        let note = str_arg("memory_append", args, "note")?.trim();
        if note.is_empty() {
            return Err(SandboxError::InvalidArguments {
                tool: "memory_append".into(),
                message: "note is empty".into(),
            });
        }
        ctx.new_notes.push(note.to_string());
        Ok(ToolOutput::text("noted"))
    }
}

pub struct ToolRegistry {
    handlers: BTreeMap<String, Box<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Registry with the file, shell, version-control and memory tools.
    pub fn with_core_tools() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(RunShell));
        registry.register(Box::new(ReadFile));
        registry.register(Box::new(WriteFile));
        registry.register(Box::new(ListDirectory));
        registry.register(Box::new(VcsCommit));
        registry.register(Box::new(MemoryRead));
        registry.register(Box::new(MemoryAppend));
        registry
    }

    /// Register (or replace) a handler under its schema name.
    pub fn register(&mut self, handler: Box<dyn ToolHandler>) {
        self.handlers.insert(handler.schema().name, handler);
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.handlers.values().map(|h| h.schema()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub async fn execute(&self, call: &ToolCallRequest, ctx: &mut ToolContext<'_>) -> ToolCallRecord {
        let started = Instant::now();
        let result = match self.handlers.get(&call.name) {
            Some(handler) if call.arguments.is_object() || call.arguments.is_null() => {
                handler.call(&call.arguments, ctx).await
            }
            Some(_) => Err(SandboxError::InvalidArguments {
                tool: call.name.clone(),
                message: "arguments must be a JSON object".into(),
            }),
            None => Err(SandboxError::UnknownTool(call.name.clone())),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, raw_output, resolved_path) = match result {
            Ok(output) => (ToolStatus::Succeeded, output.text, output.resolved_path),
            Err(err) => {
                if err.is_containment() {
                    tracing::warn!(tool = %call.name, "Sandbox violation: {}", err);
                } else {
                    tracing::debug!(tool = %call.name, "Tool call failed: {}", err);
                }
                let partial = match &err {
                    SandboxError::Timeout { partial_output, .. } => partial_output.clone(),
                    _ => String::new(),
                };
                let status = ToolStatus::Failed {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                };
                (status, partial, None)
            }
        };
        let (output, truncated) = ctx.sandbox.cap(&raw_output);

        ToolCallRecord {
            id: call.id.clone(),
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            resolved_path,
            status,
            output,
            truncated,
            duration_ms,
        }
    }
}
