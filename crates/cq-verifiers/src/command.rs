//! Runs a command (style check, build, tests) against the applied patch.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cq_core::{
    CheckoutVerifier, Context, PendingChange, SimpleStatus, Verifier, VerifierStatus, VerifyError,
    VerifyResult,
};
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::BuildError;

/// Lines of output quoted back to the review on failure.
const OUTPUT_TAIL_LINES: usize = 40;

/// Result of one command execution.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Exit code, `-1` when killed by a signal.
    pub exit_code: i32,
    pub output: String,
    pub duration_ms: u64,
}

impl CommandOutcome {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// The last `lines` lines of combined output.
    pub fn tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.output.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// SUCCEEDED when the command exits 0 in the change's directory of the
/// checkout, FAILED with the tail of its output otherwise.
pub struct CommandVerifier {
    name: String,
    command: Vec<String>,
    timeout: Duration,
    context: Arc<Context>,
}

impl CommandVerifier {
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        timeout: Duration,
        context: Arc<Context>,
    ) -> Result<Self, BuildError> {
        let name = name.into();
        if command.is_empty() {
            return Err(BuildError::EmptyCommand(name));
        }
        Ok(Self {
            name,
            command,
            timeout,
            context,
        })
    }

    /// Run the command in `dir`. `Ok(None)` means it timed out and was
    /// killed.
    pub async fn run(&self, dir: &Path) -> VerifyResult<Option<CommandOutcome>> {
        let start = Instant::now();
        let child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Ok(None),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        Ok(Some(CommandOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined,
            duration_ms: start.elapsed().as_millis() as u64,
        }))
    }
}

impl std::fmt::Debug for CommandVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandVerifier")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self, pending: &PendingChange) -> VerifyResult<VerifierStatus> {
        let dir = self
            .context
            .checkout
            .project_path()
            .join(&pending.info.relpath);
        debug!(issue = pending.issue(), verifier = %self.name, dir = %dir.display(), "Running command");
        self.send_status(&pending.info, json!({ "state": "running" }));

        let status = match self.run(&dir).await {
            Ok(Some(outcome)) if outcome.passed() => {
                self.send_status(
                    &pending.info,
                    json!({ "state": "done", "passed": true, "duration_ms": outcome.duration_ms }),
                );
                SimpleStatus::succeeded()
            }
            Ok(Some(outcome)) => {
                info!(issue = pending.issue(), verifier = %self.name, exit_code = outcome.exit_code, "Command failed");
                self.send_status(
                    &pending.info,
                    json!({
                        "state": "done",
                        "passed": false,
                        "exit_code": outcome.exit_code,
                        "duration_ms": outcome.duration_ms,
                    }),
                );
                SimpleStatus::failed(format!(
                    "{} failed (exit code {}):\n{}",
                    self.name,
                    outcome.exit_code,
                    outcome.tail(OUTPUT_TAIL_LINES)
                ))
            }
            Ok(None) => {
                self.send_status(&pending.info, json!({ "state": "timeout" }));
                SimpleStatus::failed(format!(
                    "{} timed out after {} seconds",
                    self.name,
                    self.timeout.as_secs()
                ))
            }
            Err(VerifyError::Io(e)) => {
                return Err(VerifyError::Other(format!(
                    "{} could not be started: {e}",
                    self.name
                )))
            }
            Err(e) => return Err(e),
        };
        Ok(status.into())
    }
}

impl CheckoutVerifier for CommandVerifier {
    fn context(&self) -> &Arc<Context> {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context_at, pending_with};
    use cq_core::{StatusView, VerificationState};

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn empty_command_is_rejected() {
        let (context, _) = context_at(std::env::temp_dir());
        let err = CommandVerifier::new("tests", vec![], Duration::from_secs(1), context).unwrap_err();
        assert!(matches!(err, BuildError::EmptyCommand(name) if name == "tests"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        let outcome = CommandOutcome {
            exit_code: 1,
            output: "a\nb\nc\nd\n".to_string(),
            duration_ms: 0,
        };
        assert_eq!(outcome.tail(2), "c\nd");
        assert_eq!(outcome.tail(10), "a\nb\nc\nd");
    }

    #[tokio::test]
    async fn passing_command_succeeds_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let (context, sink) = context_at(dir.path());
        let verifier =
            CommandVerifier::new("style", sh("test -f marker"), Duration::from_secs(10), context)
                .unwrap();

        let status = verifier.verify(&pending_with(3, |_| {})).await.unwrap();

        assert_eq!(status.state(), VerificationState::Succeeded);
        let payloads = sink.payloads_for(3, "style");
        assert_eq!(payloads[0]["state"], "running");
        assert_eq!(payloads[1]["state"], "done");
        assert_eq!(payloads[1]["passed"], true);
    }

    #[tokio::test]
    async fn failing_command_quotes_its_output() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _) = context_at(dir.path());
        let verifier = CommandVerifier::new(
            "tests",
            sh("echo 'test_parse ... ok'; echo 'test_render ... FAILED' >&2; exit 3"),
            Duration::from_secs(10),
            context,
        )
        .unwrap();

        let status = verifier.verify(&pending_with(3, |_| {})).await.unwrap();

        assert_eq!(status.state(), VerificationState::Failed);
        let message = status.error_message().unwrap();
        assert!(message.starts_with("tests failed (exit code 3):"));
        assert!(message.contains("test_render ... FAILED"));
    }

    #[tokio::test]
    async fn runs_in_the_change_relpath() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("only-here"), "").unwrap();
        let (context, _) = context_at(dir.path());
        let verifier =
            CommandVerifier::new("check", sh("test -f only-here"), Duration::from_secs(10), context)
                .unwrap();

        let pending = pending_with(3, |info| info.relpath = "sub".to_string());
        let status = verifier.verify(&pending).await.unwrap();
        assert_eq!(status.state(), VerificationState::Succeeded);
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _) = context_at(dir.path());
        let verifier =
            CommandVerifier::new("compile", sh("sleep 5"), Duration::from_millis(100), context)
                .unwrap();

        let status = verifier.verify(&pending_with(3, |_| {})).await.unwrap();

        assert_eq!(status.state(), VerificationState::Failed);
        assert!(status.error_message().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_executable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _) = context_at(dir.path());
        let verifier = CommandVerifier::new(
            "lint",
            vec!["definitely-not-a-real-binary-cq".to_string()],
            Duration::from_secs(1),
            context,
        )
        .unwrap();

        let err = verifier.verify(&pending_with(3, |_| {})).await.unwrap_err();
        assert!(err.to_string().contains("could not be started"));
    }
}
