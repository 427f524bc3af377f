//! Execution of dispatched shell commands.
//!
//! The control path is abstracted behind [`CommandRunner`] so the session
//! logic can be exercised without spawning processes: production uses
//! [`SubprocessRunner`], tests use [`RecordingRunner`].

use std::sync::Mutex;

use async_trait::async_trait;

/// Result of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Merged stdout and stderr.
    pub combined: String,
    /// Process exit code, when the process exited normally.
    pub status: Option<i32>,
}

/// Runs a dispatched argv.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Execute `argv[0]` with the remaining arguments.
    async fn run(&self, argv: &[String]) -> std::io::Result<CommandOutput>;
}

/// Production runner: spawns a subprocess and captures its output.
pub struct SubprocessRunner;

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, argv: &[String]) -> std::io::Result<CommandOutput> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv")
        })?;
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput { combined, status: output.status.code() })
    }
}

/// Test runner: records every argv and answers with a fixed reply.
pub struct RecordingRunner {
    calls: Mutex<Vec<Vec<String>>>,
    reply: String,
}

impl RecordingRunner {
    /// A runner answering every command with `reply`.
    #[must_use]
    pub fn new(reply: &str) -> Self {
        Self { calls: Mutex::new(Vec::new()), reply: reply.to_string() }
    }

    /// Every argv run so far.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("Mutex poisoned").clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    #[allow(clippy::expect_used)]
    async fn run(&self, argv: &[String]) -> std::io::Result<CommandOutput> {
        self.calls.lock().expect("Mutex poisoned").push(argv.to_vec());
        Ok(CommandOutput { combined: self.reply.clone(), status: Some(0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subprocess_runner_merges_output() {
        let output = SubprocessRunner
            .run(&["echo".to_string(), "hi".to_string()])
            .await
            .unwrap();
        assert_eq!(output.combined, "hi\n");
        assert_eq!(output.status, Some(0));
    }

    #[tokio::test]
    async fn subprocess_runner_rejects_empty_argv() {
        assert!(SubprocessRunner.run(&[]).await.is_err());
    }

    #[tokio::test]
    async fn recording_runner_captures_calls() {
        let runner = RecordingRunner::new("ok");
        let argv = vec!["reboot".to_string(), "--force".to_string()];
        let output = runner.run(&argv).await.unwrap();
        assert_eq!(output.combined, "ok");
        assert_eq!(runner.calls(), vec![argv]);
    }
}
