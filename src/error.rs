//! Error taxonomy for the merge engine.
//!
//! Every failure a caller can observe is a [`MergeError`]. Callers that only
//! need to decide between "tell the user", "retry", and "page someone" should
//! branch on [`MergeError::class`] instead of matching individual variants.

use thiserror::Error;

use crate::gate::GateRejection;
use crate::git::command::CommandError;
use crate::types::{MergeStyle, PullId};

pub type Result<T> = std::result::Result<T, MergeError>;

/// Coarse classification used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// User-correctable rejection, e.g. missing approvals.
    Validation,
    Conflict,
    /// Base moved during the attempt. Recompute and retry.
    PushOutOfDate,
    /// Server-side veto. Terminal.
    PushRejected,
    /// Expected head commit no longer matches.
    ShaMismatch,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("pull request cannot be merged: {0}")]
    Validation(#[from] GateRejection),

    #[error("merge style {0} is not allowed")]
    InvalidMergeStyle(MergeStyle),

    #[error("invalid commit id {commit_id}: {reason}")]
    InvalidCommitId { commit_id: String, reason: String },

    #[error("pull request {pull_id} is already scheduled to auto merge")]
    AlreadyScheduled { pull_id: PullId },

    #[error("pull request {0} does not exist")]
    PullNotFound(PullId),

    #[error("{style} produced conflicts in {} file(s){}", .files.len(), .commit_sha.as_deref().map(|sha| format!(" while applying {sha}")).unwrap_or_default())]
    Conflict {
        style: MergeStyle,
        files: Vec<String>,
        commit_sha: Option<String>,
        stdout: String,
        stderr: String,
    },

    #[error("{style} refused to merge unrelated histories")]
    UnrelatedHistories {
        style: MergeStyle,
        stdout: String,
        stderr: String,
    },

    #[error("fast-forward only merge is not possible: branches have diverged")]
    DivergingFastForward { stdout: String, stderr: String },

    #[error("push was rejected because the target branch has moved")]
    PushOutOfDate { stdout: String, stderr: String },

    #[error("push was rejected by the remote: {message}")]
    PushRejected {
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("head commit mismatch: expected {expected}, found {actual}")]
    ShaMismatch { expected: String, actual: String },

    #[error("git {context}: {source}")]
    Command {
        context: String,
        #[source]
        source: CommandError,
    },

    #[error("repository error: {0}")]
    Repository(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid protected file pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("LFS migration failed: {0}")]
    Lfs(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MergeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MergeError::Validation(_)
            | MergeError::InvalidMergeStyle(_)
            | MergeError::InvalidCommitId { .. }
            | MergeError::AlreadyScheduled { .. }
            | MergeError::PullNotFound(_) => ErrorClass::Validation,
            MergeError::Conflict { .. }
            | MergeError::UnrelatedHistories { .. }
            | MergeError::DivergingFastForward { .. } => ErrorClass::Conflict,
            MergeError::PushOutOfDate { .. } => ErrorClass::PushOutOfDate,
            MergeError::PushRejected { .. } => ErrorClass::PushRejected,
            MergeError::ShaMismatch { .. } => ErrorClass::ShaMismatch,
            MergeError::Command { .. }
            | MergeError::Repository(_)
            | MergeError::Io(_)
            | MergeError::Pattern(_)
            | MergeError::Lfs(_)
            | MergeError::Cancelled
            | MergeError::Internal(_) => ErrorClass::Infrastructure,
        }
    }

    /// Whether recomputing mergeability and trying again can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::PushOutOfDate | ErrorClass::ShaMismatch
        )
    }

    /// Wraps a command failure with the operation that triggered it.
    pub fn command(context: impl Into<String>, source: CommandError) -> Self {
        match source {
            CommandError::Cancelled => MergeError::Cancelled,
            source => MergeError::Command {
                context: context.into(),
                source,
            },
        }
    }
}

impl From<CommandError> for MergeError {
    fn from(source: CommandError) -> Self {
        MergeError::command("command", source)
    }
}
