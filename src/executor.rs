//! Sandbox Executor - legacy code path
//!
//! Runs shell snippets inside a sandbox directory with a timeout. Scripts
//! talk back through directive lines on stdout:
//!
//! - `::say <text>` queues a message for the user
//! - `::end` marks the task as ended
//!
//! A denylist rejects obviously dangerous commands unless unsafe mode is on.
//! Hardening beyond the denylist is out of scope here; callers that need
//! real isolation run the binary inside one.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Outcome of one executed step. Shared with the execution agent, which
/// records it on the Action unchanged.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub task_ended: bool,
    pub user_messages: Vec<String>,
    pub output: String,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    /// Failed outcome with an error message
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Commands that never run in safe mode
const DENYLIST: &[&str] = &[
    "rm -rf /",
    "sudo ",
    "shutdown",
    "reboot",
    "mkfs",
    "dd if=",
    "> /dev/",
    ":(){",
    "curl ",
    "wget ",
    "ssh ",
    "nc ",
];

/// Sandboxed shell execution
pub struct SandboxExecutor {
    sandbox_path: PathBuf,
    unsafe_mode: bool,
    default_timeout: Duration,
}

impl SandboxExecutor {
    pub fn new(sandbox_path: &Path, unsafe_mode: bool) -> Result<Self> {
        std::fs::create_dir_all(sandbox_path)?;
        info!("Sandbox initialized at {}", sandbox_path.display());

        Ok(Self {
            sandbox_path: sandbox_path.to_path_buf(),
            unsafe_mode,
            default_timeout: Duration::from_secs(30),
        })
    }

    /// Validate a snippet against the denylist
    fn validate(&self, code: &str) -> Result<(), String> {
        if self.unsafe_mode {
            return Ok(());
        }

        let lowered = code.to_lowercase();
        for pattern in DENYLIST {
            if lowered.contains(pattern) {
                return Err(format!("sandbox violation: '{}' is not allowed", pattern.trim()));
            }
        }
        Ok(())
    }

    /// Execute a shell snippet with the default timeout
    pub async fn execute_async(&self, code: &str) -> ExecutionOutcome {
        self.execute_with_timeout(code, self.default_timeout).await
    }

    /// Execute a shell snippet, killing it after `timeout`
    pub async fn execute_with_timeout(&self, code: &str, timeout: Duration) -> ExecutionOutcome {
        if let Err(violation) = self.validate(code) {
            warn!("{violation}");
            return ExecutionOutcome::failed(violation);
        }

        debug!("Executing snippet ({} bytes)", code.len());

        let child = Command::new("sh")
            .arg("-c")
            .arg(code)
            .current_dir(&self.sandbox_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => return ExecutionOutcome::failed(format!("failed to spawn shell: {e}")),
        };

        let result = tokio::time::timeout(timeout, child.wait_with_output()).await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ExecutionOutcome::failed(format!("execution failed: {e}")),
            Err(_) => {
                return ExecutionOutcome::failed(format!(
                    "execution timed out after {}s",
                    timeout.as_secs_f32()
                ))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut user_messages = Vec::new();
        let mut task_ended = false;
        let mut plain_lines = Vec::new();

        for line in stdout.lines() {
            if let Some(message) = line.strip_prefix("::say ") {
                user_messages.push(message.to_string());
            } else if line.trim() == "::end" {
                task_ended = true;
            } else {
                plain_lines.push(line);
            }
        }

        // A message to the user implies the task reached its end
        if !user_messages.is_empty() {
            task_ended = true;
        }

        if output.status.success() {
            ExecutionOutcome {
                success: true,
                task_ended,
                user_messages,
                output: plain_lines.join("\n"),
                error: None,
            }
        } else {
            ExecutionOutcome {
                success: false,
                task_ended: false,
                user_messages,
                output: plain_lines.join("\n"),
                error: Some(if stderr.is_empty() {
                    format!("exit status {}", output.status)
                } else {
                    stderr.trim().to_string()
                }),
            }
        }
    }

    /// Files currently in the sandbox
    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.sandbox_path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    /// Remove all files from the sandbox
    pub fn clear(&self) -> Result<()> {
        for file in self.list_files()? {
            std::fs::remove_file(file)?;
        }
        debug!("Sandbox cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> (tempfile::TempDir, SandboxExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(dir.path(), false).unwrap();
        (dir, executor)
    }

    #[tokio::test]
    async fn test_plain_output() {
        let (_dir, executor) = executor();

        let outcome = executor.execute_async("echo hello").await;
        assert!(outcome.success);
        assert!(!outcome.task_ended);
        assert_eq!(outcome.output, "hello");
        assert!(outcome.user_messages.is_empty());
    }

    #[tokio::test]
    async fn test_say_directive_collects_and_ends() {
        let (_dir, executor) = executor();

        let outcome = executor
            .execute_async("echo '::say All done!'; echo detail")
            .await;
        assert!(outcome.success);
        assert!(outcome.task_ended);
        assert_eq!(outcome.user_messages, vec!["All done!".to_string()]);
        assert_eq!(outcome.output, "detail");
    }

    #[tokio::test]
    async fn test_end_directive() {
        let (_dir, executor) = executor();

        let outcome = executor.execute_async("echo '::end'").await;
        assert!(outcome.success);
        assert!(outcome.task_ended);
        assert!(outcome.user_messages.is_empty());
    }

    #[tokio::test]
    async fn test_failure_captures_stderr() {
        let (_dir, executor) = executor();

        let outcome = executor.execute_async("echo oops >&2; exit 3").await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("oops"));
    }

    #[tokio::test]
    async fn test_denylist_blocks_in_safe_mode() {
        let (_dir, executor) = executor();

        let outcome = executor.execute_async("sudo reboot").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("sandbox violation"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let (_dir, executor) = executor();

        let outcome = executor
            .execute_with_timeout("sleep 5", Duration::from_millis(100))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_runs_in_sandbox_dir() {
        let (dir, executor) = executor();

        let outcome = executor.execute_async("echo content > probe.txt").await;
        assert!(outcome.success);
        assert!(dir.path().join("probe.txt").exists());

        executor.clear().unwrap();
        assert!(!dir.path().join("probe.txt").exists());
    }
}
