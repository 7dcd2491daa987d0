//! Local execution of commands, patches and the evaluation script.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Maximum output size in bytes per stream (1 MB).
/// Prevents memory exhaustion from commands with huge output.
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Result of one local process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutcome {
    /// An outcome for a process that could not be run at all.
    pub fn error(message: &str) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message.to_string(),
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Stdout followed by stderr.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut out = self.stdout.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(&self.stderr);
                out
            }
        }
    }
}

/// Truncate a string to max bytes, preserving UTF-8 boundaries.
fn truncate_output(s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_string();
    truncated.push_str("\n... [output truncated]");
    truncated
}

/// Run `cmd` with `sh -c` in `workdir`. The process is killed when
/// `timeout` elapses.
pub async fn run_shell(cmd: &str, workdir: &Path, timeout: Duration) -> ExecOutcome {
    debug!(cmd = %cmd, workdir = %workdir.display(), "executing shell command");
    let mut command = Command::new("sh");
    command.args(["-c", cmd]);
    run(command, workdir, timeout).await
}

/// Run `script` with `bash` in `workdir`.
pub async fn run_script(script: &Path, workdir: &Path, timeout: Duration) -> ExecOutcome {
    debug!(script = %script.display(), "running evaluation script");
    if !script.exists() {
        return ExecOutcome::error(&format!(
            "evaluation script not found: {}",
            script.display()
        ));
    }
    let mut command = Command::new("bash");
    command.arg(script);
    run(command, workdir, timeout).await
}

/// Apply a unified diff to `workdir`, trying `git apply` first and falling
/// back to `patch` with fuzz.
pub async fn apply_patch(patch: &str, workdir: &Path, timeout: Duration) -> ExecOutcome {
    let path = std::env::temp_dir().join(format!("testbed-{}.diff", Uuid::new_v4()));
    let mut content = patch.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    if let Err(e) = tokio::fs::write(&path, content).await {
        warn!(error = %e, path = %path.display(), "failed to write patch file");
        return ExecOutcome::error(&format!("failed to write patch file: {e}"));
    }

    let quoted = shell_quote(&path.to_string_lossy());
    let cmd = format!("git apply -v {quoted} || patch --batch --fuzz=5 -p1 -i {quoted}");
    let outcome = run_shell(&cmd, workdir, timeout).await;

    if let Err(e) = tokio::fs::remove_file(&path).await {
        trace!(error = %e, "failed to remove patch file");
    }
    debug!(
        applied = outcome.success(),
        exit_code = outcome.exit_code,
        "patch application finished"
    );
    outcome
}

async fn run(mut command: Command, workdir: &Path, timeout: Duration) -> ExecOutcome {
    command
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => output,
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "process timed out, killed");
            return ExecOutcome {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("timed out after {}s", timeout.as_secs()),
                timed_out: true,
            };
        }
    };

    match output {
        Ok(out) => {
            let exit_code = out.status.code().unwrap_or(-1);
            let stdout = truncate_output(
                String::from_utf8_lossy(&out.stdout).into_owned(),
                MAX_OUTPUT_SIZE,
            );
            let stderr = truncate_output(
                String::from_utf8_lossy(&out.stderr).into_owned(),
                MAX_OUTPUT_SIZE,
            );
            debug!(
                exit_code = exit_code,
                stdout_len = stdout.len(),
                stderr_len = stderr.len(),
                "process completed"
            );
            trace!(stdout = %stdout, stderr = %stderr, "process output");
            ExecOutcome {
                exit_code,
                stdout,
                stderr,
                timed_out: false,
            }
        }
        Err(e) => {
            warn!(error = %e, workdir = %workdir.display(), "process failed to start");
            ExecOutcome::error(&format!("failed to start process: {e}"))
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cwd() -> PathBuf {
        std::env::temp_dir()
    }

    #[tokio::test]
    async fn test_run_shell_echo() {
        let result = run_shell("echo hello", &cwd(), Duration::from_secs(10)).await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
        assert!(result.stderr.is_empty());
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_run_shell_exit_code() {
        let result = run_shell("exit 42", &cwd(), Duration::from_secs(10)).await;
        assert_eq!(result.exit_code, 42);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_run_shell_combined_output() {
        let result = run_shell("echo out; echo err >&2", &cwd(), Duration::from_secs(10)).await;
        assert_eq!(result.combined_output(), "out\nerr\n");
    }

    #[tokio::test]
    async fn test_run_shell_timeout() {
        let result = run_shell("sleep 5", &cwd(), Duration::from_millis(200)).await;
        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_missing_workdir_is_an_outcome() {
        let result = run_shell("true", Path::new("/definitely/not/here"), Duration::from_secs(5)).await;
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("failed to start"));
    }

    #[tokio::test]
    async fn test_non_applying_patch_fails() {
        let patch = "--- a/missing.txt\n+++ b/missing.txt\n@@ -1 +1 @@\n-old\n+new\n";
        let result = apply_patch(patch, &cwd(), Duration::from_secs(30)).await;
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_missing_script() {
        let result = run_script(Path::new("/no/such/eval.sh"), &cwd(), Duration::from_secs(5)).await;
        assert!(!result.success());
        assert!(result.stderr.contains("not found"));
    }

    #[test]
    fn test_truncate_output_keeps_utf8() {
        let s = "é".repeat(10);
        let out = truncate_output(s, 5);
        assert!(out.starts_with("éé"));
        assert!(out.ends_with("[output truncated]"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
