//! Shell execution confined to the workspace root.
//!
//! Commands run through `sh -c` with the working directory fixed to the
//! root. Output is drained concurrently into shared buffers so that on
//! timeout whatever was produced so far can still be reported.
//!
//! Each command leads its own process group. When the command finishes or
//! times out the whole group is killed, so nothing it spawned keeps touching
//! the workspace after the call returns.

use crate::errors::SandboxError;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    /// Render for the calling role: exit code, then stdout, then stderr.
    pub fn render(&self) -> String {
        let mut out = match self.exit_code {
            Some(code) => format!("exit code: {}\n", code),
            None => "exit code: killed by signal\n".to_string(),
        };
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
            if !self.stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        if !self.stderr.is_empty() {
            out.push_str("[stderr]\n");
            out.push_str(&self.stderr);
        }
        out
    }
}

type SharedBuf = Arc<Mutex<Vec<u8>>>;

fn drain<R>(mut reader: R, buf: SharedBuf) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut guard) = buf.lock() {
                        guard.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn snapshot(buf: &SharedBuf) -> String {
    buf.lock()
        .map(|guard| String::from_utf8_lossy(&guard).into_owned())
        .unwrap_or_default()
}

#[cfg(unix)]
fn kill_group(leader: Option<u32>) {
    let Some(pgid) = leader.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg only signals; ESRCH for an empty group is ignored.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_leader: Option<u32>) {}

/// Run `command` under `sh -c` in `root`, killing it after `limit`.
pub async fn run_shell(root: &Path, command: &str, limit: Duration) -> Result<ShellOutput, SandboxError> {
    tracing::debug!(command, timeout_secs = limit.as_secs(), "Running shell command");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    let mut child = cmd.spawn().map_err(|source| SandboxError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    let leader = child.id();

    let stdout_buf = SharedBuf::default();
    let stderr_buf = SharedBuf::default();
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(drain(out, stdout_buf.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(drain(err, stderr_buf.clone()));
    }

    match timeout(limit, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(|source| SandboxError::Io {
                path: root.to_path_buf(),
                source,
            })?;
            kill_group(leader);
            for reader in readers {
                let _ = timeout(Duration::from_secs(2), reader).await;
            }
            Ok(ShellOutput {
                exit_code: status.code(),
                stdout: snapshot(&stdout_buf),
                stderr: snapshot(&stderr_buf),
            })
        }
        Err(_) => {
            kill_group(leader);
            let _ = child.kill().await;
            for reader in &readers {
                reader.abort();
            }
            let mut partial = snapshot(&stdout_buf);
            let stderr = snapshot(&stderr_buf);
            if !stderr.is_empty() {
                partial.push_str("[stderr]\n");
                partial.push_str(&stderr);
            }
            tracing::warn!(command, secs = limit.as_secs(), "Shell command timed out");
            Err(SandboxError::Timeout {
                secs: limit.as_secs(),
                partial_output: partial,
            })
        }
    }
}
