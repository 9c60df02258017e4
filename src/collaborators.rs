//! Capabilities the engine consumes from the surrounding system.
//!
//! Persistence of pull requests, users, permissions and branch protection
//! lives outside the engine. Each concern is a narrow async trait so a host
//! can back it with its own storage; [`crate::memory`] has in-process
//! implementations used by the CLI and tests.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gate::{BranchProtection, PermissionSnapshot, ReviewSummary};
use crate::types::{CommitStatus, MergeStyle, PullId, PullRequest, RepoId, User};

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PullRequestStore: Send + Sync {
    async fn get(&self, pull_id: PullId) -> Result<Option<PullRequest>>;

    /// Persists every mutable field of `pr`.
    async fn update(&self, pr: &PullRequest) -> Result<()>;

    /// Open pull requests whose head branch lives in `repo_id` and points at `sha`.
    async fn pulls_by_head_commit(&self, repo_id: RepoId, sha: &str) -> Result<Vec<PullRequest>>;

    /// Open pull requests targeting `branch` of `repo_id`.
    async fn open_pulls_by_base(&self, repo_id: RepoId, branch: &str) -> Result<Vec<PullRequest>>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PolicyService: Send + Sync {
    async fn branch_protection(&self, repo_id: RepoId, branch: &str) -> Result<Option<BranchProtection>>;

    async fn permission(&self, repo_id: RepoId, user: &User) -> Result<PermissionSnapshot>;

    /// Latest status per context reported for `sha`.
    async fn commit_statuses(&self, repo_id: RepoId, sha: &str) -> Result<Vec<CommitStatus>>;

    async fn reviews(&self, pr: &PullRequest) -> Result<ReviewSummary>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user_by_email(&self, email: &str) -> Result<Option<User>>;
}

/// Events published for the notification fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MergeEvent {
    Merged {
        pull_id: PullId,
        doer: User,
        style: MergeStyle,
        commit_id: String,
        auto: bool,
    },
    ManuallyMerged {
        pull_id: PullId,
        doer: User,
        commit_id: String,
    },
    AutoMergeScheduled {
        pull_id: PullId,
        doer: User,
    },
    AutoMergeCancelled {
        pull_id: PullId,
        doer: User,
    },
    AutoMergeFailed {
        pull_id: PullId,
        reason: String,
    },
}

impl MergeEvent {
    pub fn pull_id(&self) -> PullId {
        match self {
            MergeEvent::Merged { pull_id, .. }
            | MergeEvent::ManuallyMerged { pull_id, .. }
            | MergeEvent::AutoMergeScheduled { pull_id, .. }
            | MergeEvent::AutoMergeCancelled { pull_id, .. }
            | MergeEvent::AutoMergeFailed { pull_id, .. } => *pull_id,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivery is best effort; failures are the notifier's to log.
    async fn notify(&self, event: MergeEvent);
}

/// Notifier that only writes the event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: MergeEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(pull_id = event.pull_id(), %payload, "Merge event"),
            Err(e) => tracing::warn!(pull_id = event.pull_id(), error = %e, "Failed to encode merge event"),
        }
    }
}
