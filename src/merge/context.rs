use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{MergeError, Result};
use crate::git::{CommandError, CommandOutput, GitCommand, GitRunner};
use crate::types::{PullRequest, Signature};
use crate::workspace::TemporaryRepo;

/// State owned by exactly one merge attempt.
///
/// Dropping the context drops the workspace, which removes it from disk.
pub struct MergeContext {
    pub workspace: TemporaryRepo,
    pub git: GitRunner,
    pub pull_id: i64,
    pub author: Signature,
    pub committer: Signature,
    pub sign_key_id: Option<String>,
    env: Vec<(String, String)>,
    stdout: String,
    stderr: String,
}

impl MergeContext {
    pub fn new(
        workspace: TemporaryRepo,
        git: GitRunner,
        pr: &PullRequest,
        author: Signature,
        committer: Signature,
        sign_key_id: Option<String>,
    ) -> Self {
        let env = identity_env(&author, &committer, Utc::now());
        Self {
            workspace,
            git,
            pull_id: pr.id,
            author,
            committer,
            sign_key_id,
            env,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn extend_env(&mut self, extra: impl IntoIterator<Item = (String, String)>) {
        self.env.extend(extra);
    }

    /// Output captured from the last command that ran.
    pub fn output(&self) -> (&str, &str) {
        (&self.stdout, &self.stderr)
    }

    pub fn command<I, S>(&self, args: I) -> GitCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workspace.git(args).envs(self.env.iter().cloned())
    }

    /// Runs `command` and returns its output even on failure.
    pub async fn output_of(&mut self, command: &GitCommand) -> Result<CommandOutput> {
        let output = self.git.output(command).await.map_err(|e| MergeError::command(command.display(), e))?;
        self.stdout.clone_from(&output.stdout);
        self.stderr.clone_from(&output.stderr);
        Ok(output)
    }

    /// Runs `command`, failing with the captured output on non-zero exit.
    pub async fn run(&mut self, command: GitCommand) -> Result<CommandOutput> {
        let output = self.output_of(&command).await?;
        if output.success() {
            return Ok(output);
        }
        warn!(
            pull_id = self.pull_id,
            command = %command.display(),
            stdout = %output.stdout,
            stderr = %output.stderr,
            "git command failed in merge workspace"
        );
        Err(MergeError::command(
            command.display(),
            CommandError::ExecutionFailed {
                command: command.display(),
                status_code: output.status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            },
        ))
    }

    pub async fn run_args<I, S>(&mut self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = self.command(args);
        self.run(command).await
    }

    /// `git commit` with the message, signed when a key is configured.
    pub fn commit_command(&self, message: &str, author: Option<&Signature>) -> GitCommand {
        let mut command = self.command(["commit"]);
        if let Some(author) = author {
            command = command.arg(format!("--author={author}"));
        }
        command = command.arg(format!("--message={message}"));
        match &self.sign_key_id {
            Some(key) => command.arg(format!("-S{key}")),
            None => command.arg("--no-gpg-sign"),
        }
    }

    pub async fn commit(&mut self, message: &str, author: Option<&Signature>) -> Result<()> {
        let command = self.commit_command(message, author);
        self.run(command).await.map(|_| ())
    }
}

/// `GIT_AUTHOR_*` and `GIT_COMMITTER_*` for commits made at `when`.
pub fn identity_env(author: &Signature, committer: &Signature, when: DateTime<Utc>) -> Vec<(String, String)> {
    let date = when.to_rfc3339();
    vec![
        ("GIT_AUTHOR_NAME".into(), author.name.clone()),
        ("GIT_AUTHOR_EMAIL".into(), author.email.clone()),
        ("GIT_AUTHOR_DATE".into(), date.clone()),
        ("GIT_COMMITTER_NAME".into(), committer.name.clone()),
        ("GIT_COMMITTER_EMAIL".into(), committer.email.clone()),
        ("GIT_COMMITTER_DATE".into(), date),
    ]
}
