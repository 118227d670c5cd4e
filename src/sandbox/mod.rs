//! Tool sandbox: filesystem, shell and version-control operations confined
//! to a single workspace root.
//!
//! Every path argument is resolved against the root with `..` segments and
//! symlinks followed. A path that lands outside the root, or inside a
//! protected location, is rejected with a containment error before anything
//! is touched.

pub mod registry;
pub mod shell;

pub use registry::{ToolContext, ToolHandler, ToolOutput, ToolRegistry};
pub use shell::ShellOutput;

use crate::errors::SandboxError;
use crate::tracker::{GitTracker, METADATA_DIR, SECRETS_FILE};
use crate::util::cap_output;
use serde::Serialize;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Intended use of a resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolStatus {
    Succeeded,
    Failed { kind: String, message: String },
}

/// One attempted tool call. Lives only for the duration of an implementer
/// turn; later turns see a summary.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool: String,
    pub arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<PathBuf>,
    #[serde(flatten)]
    pub status: ToolStatus,
    pub output: String,
    pub truncated: bool,
    pub duration_ms: u64,
}

impl ToolCallRecord {
    pub fn succeeded(&self) -> bool {
        self.status == ToolStatus::Succeeded
    }

    pub fn error_kind(&self) -> Option<&str> {
        match &self.status {
            ToolStatus::Succeeded => None,
            ToolStatus::Failed { kind, .. } => Some(kind),
        }
    }

    /// A containment failure counts as a sandbox violation.
    pub fn is_violation(&self) -> bool {
        self.error_kind() == Some("containment")
    }

    /// Text fed back to the implementer as the tool result.
    pub fn render(&self) -> String {
        match &self.status {
            ToolStatus::Succeeded => self.output.clone(),
            ToolStatus::Failed { kind, message } if self.output.is_empty() => {
                format!("ERROR ({}): {}", kind, message)
            }
            ToolStatus::Failed { kind, message } => {
                format!("ERROR ({}): {}\n{}", kind, message, self.output)
            }
        }
    }
}

pub struct Sandbox {
    root: PathBuf,
    shell_timeout: Duration,
    max_output_bytes: usize,
    /// Root-relative files that may be read but never written.
    read_only: Vec<PathBuf>,
}

impl Sandbox {
    pub fn new(root: &Path, shell_timeout: Duration, max_output_bytes: usize) -> Result<Self, SandboxError> {
        let root = std::fs::canonicalize(root).map_err(|source| SandboxError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self {
            root,
            shell_timeout,
            max_output_bytes,
            read_only: Vec::new(),
        })
    }

    /// Mark a root-relative file read-only, e.g. the idea specification.
    pub fn with_read_only(mut self, rel: impl Into<PathBuf>) -> Self {
        self.read_only.push(rel.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Resolve `raw` to an absolute path inside the root.
    pub fn resolve(&self, raw: &str, access: Access) -> Result<PathBuf, SandboxError> {
        let containment = |reason: String| SandboxError::Containment {
            path: raw.to_string(),
            reason,
        };
        if raw.contains('\0') {
            return Err(containment("path contains a NUL byte".into()));
        }

        let input = Path::new(raw);
        let mut resolved = if input.is_absolute() {
            PathBuf::from("/")
        } else {
            self.root.clone()
        };
        for component in input.components() {
            match component {
                Component::Prefix(_) | Component::RootDir => {
                    resolved = PathBuf::from(component.as_os_str());
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(part) => {
                    resolved.push(part);
                    let is_link = std::fs::symlink_metadata(&resolved)
                        .map(|m| m.file_type().is_symlink())
                        .unwrap_or(false);
                    if is_link {
                        resolved = std::fs::canonicalize(&resolved).map_err(|_| {
                            containment(format!("symlink {} cannot be resolved", resolved.display()))
                        })?;
                    }
                }
            }
        }

        let Ok(relative) = resolved.strip_prefix(&self.root) else {
            return Err(containment(format!(
                "resolves to {} outside the workspace root",
                resolved.display()
            )));
        };
        match relative.components().next() {
            Some(Component::Normal(first)) if first == METADATA_DIR => {
                Err(containment("session metadata is not accessible".into()))
            }
            _ if relative == Path::new(SECRETS_FILE) => {
                Err(containment("the secrets file is not accessible".into()))
            }
            Some(Component::Normal(first)) if first == ".git" && access == Access::Write => {
                Err(containment("repository internals are read-only".into()))
            }
            _ if access == Access::Write && self.read_only.iter().any(|p| p == relative) => {
                Err(containment(format!("{} is read-only", relative.display())))
            }
            _ => Ok(resolved),
        }
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SandboxError + '_ {
        move |source| SandboxError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn read_file(&self, raw: &str) -> Result<(PathBuf, String), SandboxError> {
        let path = self.resolve(raw, Access::Read)?;
        let bytes = std::fs::read(&path).map_err(Self::io_error(&path))?;
        Ok((path, String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn write_file(&self, raw: &str, content: &str) -> Result<PathBuf, SandboxError> {
        let path = self.resolve(raw, Access::Write)?;
        if path == self.root {
            return Err(SandboxError::InvalidArguments {
                tool: "write_file".into(),
                message: "path names the workspace root".into(),
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Self::io_error(parent))?;
        }
        std::fs::write(&path, content).map_err(Self::io_error(&path))?;
        Ok(path)
    }

    /// Sorted entries of a directory; subdirectories carry a trailing `/`.
    pub fn list_directory(&self, raw: &str) -> Result<(PathBuf, Vec<String>), SandboxError> {
        let path = self.resolve(raw, Access::Read)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&path).map_err(Self::io_error(&path))? {
            let entry = entry.map_err(Self::io_error(&path))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if path == self.root && (name == METADATA_DIR || name == ".git" || name == SECRETS_FILE) {
                continue;
            }
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();
        Ok((path, entries))
    }

    pub async fn run_shell(&self, command: &str) -> Result<ShellOutput, SandboxError> {
        shell::run_shell(&self.root, command, self.shell_timeout).await
    }

    /// Commit the whole workspace. `None` means there was nothing to commit.
    pub fn commit(&self, message: &str) -> Result<Option<String>, SandboxError> {
        let git = GitTracker::new(&self.root).map_err(|e| SandboxError::Vcs(e.to_string()))?;
        git.commit_all(message)
            .map_err(|e| SandboxError::Vcs(e.to_string()))
    }

    pub fn cap(&self, text: &str) -> (String, bool) {
        cap_output(text, self.max_output_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn sandbox() -> (Sandbox, TempDir) {
        let dir = tempdir().unwrap();
        let sandbox = Sandbox::new(dir.path(), Duration::from_secs(5), 1000).unwrap();
        (sandbox, dir)
    }

    #[test]
    fn test_resolve_relative_path_inside_root() {
        let (sb, _dir) = sandbox();
        let resolved = sb.resolve("src/main.rs", Access::Write).unwrap();
        assert_eq!(resolved, sb.root().join("src/main.rs"));
    }

    #[test]
    fn test_resolve_normalizes_dot_segments() {
        let (sb, _dir) = sandbox();
        let resolved = sb.resolve("./a/../b/./c.txt", Access::Read).unwrap();
        assert_eq!(resolved, sb.root().join("b/c.txt"));
    }

    #[test]
    fn test_resolve_rejects_parent_escape() {
        let (sb, _dir) = sandbox();
        let err = sb.resolve("../../etc/passwd", Access::Write).unwrap_err();
        assert!(err.is_containment());
    }

    #[test]
    fn test_resolve_rejects_escape_through_missing_dir() {
        let (sb, _dir) = sandbox();
        let err = sb.resolve("missing/../../outside.txt", Access::Write).unwrap_err();
        assert!(err.is_containment());
    }

    #[test]
    fn test_resolve_absolute_paths() {
        let (sb, _dir) = sandbox();
        assert!(sb.resolve("/etc/hosts", Access::Read).unwrap_err().is_containment());
        let inside = sb.root().join("ok.txt");
        assert_eq!(
            sb.resolve(inside.to_str().unwrap(), Access::Read).unwrap(),
            inside
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_follows_symlinks_out_of_root() {
        let (sb, dir) = sandbox();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = sb.resolve("link/secret.txt", Access::Write).unwrap_err();
        assert!(err.is_containment());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_allows_symlinks_within_root() {
        let (sb, dir) = sandbox();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();
        let resolved = sb.resolve("alias/file.txt", Access::Write).unwrap();
        assert_eq!(resolved, sb.root().join("real/file.txt"));
    }

    #[test]
    fn test_resolve_protects_metadata_and_git() {
        let (sb, _dir) = sandbox();
        assert!(sb.resolve(".tandem/state.json", Access::Read).unwrap_err().is_containment());
        assert!(sb.resolve(".git/config", Access::Write).unwrap_err().is_containment());
        assert!(sb.resolve(".git/config", Access::Read).is_ok());
        assert!(sb.resolve("sub/.tandem/x", Access::Write).is_ok());
    }

    #[test]
    fn test_secrets_file_is_hidden() {
        let (sb, dir) = sandbox();
        std::fs::write(dir.path().join(".env"), "OPENAI_API_KEY=sk-test").unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        assert!(sb.read_file(".env").unwrap_err().is_containment());
        assert!(sb.read_file("sub/../.env").unwrap_err().is_containment());
        assert!(sb.write_file(".env", "X=1").unwrap_err().is_containment());
        let (_, entries) = sb.list_directory(".").unwrap();
        assert_eq!(entries, vec!["main.rs".to_string()]);
    }

    #[test]
    fn test_read_only_file() {
        let (sb, dir) = sandbox();
        let sb = sb.with_read_only("idea.md");
        std::fs::write(dir.path().join("idea.md"), "the idea").unwrap();
        assert!(sb.write_file("./idea.md", "changed").unwrap_err().is_containment());
        assert_eq!(sb.read_file("idea.md").unwrap().1, "the idea");
        assert!(sb.write_file("docs/idea.md", "fine").is_ok());
    }

    #[test]
    fn test_write_then_read_file() {
        let (sb, dir) = sandbox();
        sb.write_file("nested/dir/hello.txt", "hi").unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("nested/dir/hello.txt")).unwrap(),
            "hi"
        );
        let (_, content) = sb.read_file("nested/dir/hello.txt").unwrap();
        assert_eq!(content, "hi");
    }

    #[test]
    fn test_write_outside_root_creates_nothing() {
        let (sb, dir) = sandbox();
        let target = dir.path().parent().unwrap().join("tandem_escape_target.txt");
        let err = sb.write_file("../tandem_escape_target.txt", "x").unwrap_err();
        assert!(err.is_containment());
        assert!(!target.exists());
    }

    #[test]
    fn test_read_missing_file_is_io_error() {
        let (sb, _dir) = sandbox();
        assert_eq!(sb.read_file("nope.txt").unwrap_err().kind(), "io");
    }

    #[test]
    fn test_list_directory_hides_metadata() {
        let (sb, dir) = sandbox();
        std::fs::create_dir_all(dir.path().join(".tandem")).unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        let (_, entries) = sb.list_directory(".").unwrap();
        assert_eq!(entries, vec!["b.txt".to_string(), "src/".to_string()]);
    }

    #[test]
    fn test_commit_through_sandbox() {
        let (sb, dir) = sandbox();
        GitTracker::open_or_init(dir.path()).unwrap();
        sb.write_file("a.rs", "fn a() {}").unwrap();
        assert!(sb.commit("add a").unwrap().is_some());
        assert!(sb.commit("again").unwrap().is_none());
    }

    #[test]
    fn test_record_render_and_violation() {
        let record = ToolCallRecord {
            id: "1".into(),
            tool: "write_file".into(),
            arguments: serde_json::json!({"path": "../x"}),
            resolved_path: None,
            status: ToolStatus::Failed {
                kind: "containment".into(),
                message: "escapes".into(),
            },
            output: String::new(),
            truncated: false,
            duration_ms: 0,
        };
        assert!(record.is_violation());
        assert!(!record.succeeded());
        assert_eq!(record.render(), "ERROR (containment): escapes");
    }
}
