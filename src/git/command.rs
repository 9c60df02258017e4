//! Git subprocess execution
//!
//! Every git invocation the engine makes goes through a [`GitRunner`], which
//! applies the configured timeout and the shared cancellation token so a
//! cancelled merge never leaves a git process behind.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

#[derive(Debug, Error, Clone)]
pub enum CommandError {
    #[error("`{command}` exited with status {status_code}: {}", .stderr.trim())]
    ExecutionFailed {
        command: String,
        status_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("Command cancelled")]
    Cancelled,
    #[error("IO error: {message}")]
    Io { message: String },
}

impl CommandError {
    /// Captured output, when the process got far enough to produce any.
    pub fn output(&self) -> (&str, &str) {
        match self {
            CommandError::ExecutionFailed { stdout, stderr, .. } => (stdout, stderr),
            _ => ("", ""),
        }
    }
}

/// A single git invocation: arguments, working directory, extra environment
/// and optional stdin.
#[derive(Debug, Clone, Default)]
pub struct GitCommand {
    args: Vec<String>,
    dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
}

impl GitCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn envs<I>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.envs.extend(envs);
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Human readable form used in logs and errors.
    pub fn display(&self) -> String {
        format!("git {}", self.args.join(" "))
    }

    fn build(&self, program: &Path) -> Command {
        let mut command = Command::new(program);
        command
            .args(&self.args)
            // Keep stderr parseable and never block on a credential prompt.
            .env("LC_ALL", "C")
            .env("GIT_TERMINAL_PROMPT", "0")
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        command
    }
}

/// Trait for executing git commands
///
/// The merge engine never spawns processes directly so tests can substitute
/// scripted output.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: &Path, command: &GitCommand) -> Result<CommandOutput, CommandError>;
}

/// Real implementation on top of tokio::process
pub struct ProcessCommandExecutor {
    timeout: Duration,
    cancel: CancellationToken,
}

impl ProcessCommandExecutor {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }
}

fn spawn_error(program: &Path, err: std::io::Error) -> CommandError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CommandError::CommandNotFound {
            command: program.display().to_string(),
        }
    } else {
        CommandError::Io {
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl CommandExecutor for ProcessCommandExecutor {
    async fn execute(&self, program: &Path, command: &GitCommand) -> Result<CommandOutput, CommandError> {
        if self.cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }

        let mut process = command.build(program);
        process
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = process.spawn().map_err(|e| spawn_error(program, e))?;

        if let (Some(input), Some(mut stdin)) = (command.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                // A process that exits early closes the pipe; its exit status reports the failure.
                let _ = stdin.write_all(&input).await;
            });
        }

        debug!(command = %command.display(), dir = ?command.dir, "Running git");

        // Dropping the child on timeout or cancellation kills it.
        let output = tokio::select! {
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(CommandError::Io { message: e.to_string() }),
                Err(_) => return Err(CommandError::Timeout { timeout_ms: self.timeout.as_millis() as u64 }),
            },
            _ = self.cancel.cancelled() => return Err(CommandError::Cancelled),
        };

        Ok(CommandOutput {
            status_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Cheaply cloneable handle used by every component that shells out to git.
#[derive(Clone)]
pub struct GitRunner {
    binary: PathBuf,
    executor: Arc<dyn CommandExecutor>,
    cancel: CancellationToken,
}

impl GitRunner {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration, cancel: CancellationToken) -> Self {
        let executor = Arc::new(ProcessCommandExecutor::new(timeout, cancel.clone()));
        Self {
            binary: binary.into(),
            executor,
            cancel,
        }
    }

    pub fn with_executor(
        binary: impl Into<PathBuf>,
        executor: Arc<dyn CommandExecutor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            binary: binary.into(),
            executor,
            cancel,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs the command and returns its output whatever the exit status.
    pub async fn output(&self, command: &GitCommand) -> Result<CommandOutput, CommandError> {
        self.executor.execute(&self.binary, command).await
    }

    /// Runs the command and fails on a non-zero exit status.
    pub async fn run(&self, command: &GitCommand) -> Result<CommandOutput, CommandError> {
        let output = self.output(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::ExecutionFailed {
                command: command.display(),
                status_code: output.status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }

    /// Spawns a long running process with piped stdio for streaming use.
    pub fn spawn(&self, command: &GitCommand, with_stdin: bool) -> Result<Child, CommandError> {
        if self.cancel.is_cancelled() {
            return Err(CommandError::Cancelled);
        }
        let mut process = command.build(&self.binary);
        process
            .stdin(if with_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        process.spawn().map_err(|e| spawn_error(&self.binary, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    // Scripted executor keyed by the joined argument list
    struct MockCommandExecutor {
        responses: HashMap<String, Result<CommandOutput, CommandError>>,
    }

    impl MockCommandExecutor {
        fn new() -> Self {
            Self {
                responses: HashMap::new(),
            }
        }

        fn expect_command(mut self, args: &[&str], response: Result<CommandOutput, CommandError>) -> Self {
            self.responses.insert(args.join(" "), response);
            self
        }
    }

    #[async_trait]
    impl CommandExecutor for MockCommandExecutor {
        async fn execute(&self, program: &Path, command: &GitCommand) -> Result<CommandOutput, CommandError> {
            self.responses
                .get(&command.get_args().join(" "))
                .cloned()
                .unwrap_or(Err(CommandError::CommandNotFound {
                    command: program.display().to_string(),
                }))
        }
    }

    fn runner() -> GitRunner {
        GitRunner::new("git", Duration::from_secs(30), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_git_version_runs() {
        let output = runner().run(&GitCommand::new(["--version"])).await.unwrap();
        assert!(output.success());
        assert!(output.stdout.starts_with("git version"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let err = runner()
            .run(&GitCommand::new(["rev-parse", "HEAD"]).current_dir(dir.path()))
            .await
            .unwrap_err();
        match err {
            CommandError::ExecutionFailed { status_code, stderr, .. } => {
                assert_ne!(status_code, 0);
                assert!(stderr.contains("not a git repository"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let runner = GitRunner::new("nonexistent_git_xyz", Duration::from_secs(5), CancellationToken::new());
        let err = runner.output(&GitCommand::new(["status"])).await.unwrap_err();
        assert!(matches!(err, CommandError::CommandNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = GitRunner::new("git", Duration::from_secs(5), cancel);
        let err = runner.output(&GitCommand::new(["--version"])).await.unwrap_err();
        assert!(matches!(err, CommandError::Cancelled));
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner();
        runner
            .run(&GitCommand::new(["init", "--quiet"]).current_dir(dir.path()))
            .await
            .unwrap();
        let output = runner
            .run(
                &GitCommand::new(["hash-object", "--stdin"])
                    .current_dir(dir.path())
                    .stdin("hello\n"),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout_trimmed(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[tokio::test]
    async fn test_mock_executor_drives_runner() {
        let mock = MockCommandExecutor::new().expect_command(
            &["rev-parse", "base"],
            Ok(CommandOutput {
                status_code: 0,
                stdout: "abc\n".to_string(),
                stderr: String::new(),
            }),
        );
        let runner = GitRunner::with_executor("git", Arc::new(mock), CancellationToken::new());
        let output = runner.run(&GitCommand::new(["rev-parse", "base"])).await.unwrap();
        assert_eq!(output.stdout_trimmed(), "abc");
    }
}
