use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub type RepoId = i64;
pub type PullId = i64;
pub type UserId = i64;

/// A repository known to the engine. `path` points at the on-disk git
/// directory, bare or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepoId,
    pub owner: String,
    pub name: String,
    pub path: PathBuf,
}

impl Repository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

impl User {
    pub fn signature(&self) -> Signature {
        Signature {
            name: self.name.clone(),
            email: self.email.clone(),
        }
    }
}

/// Identity recorded on a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestStatus {
    Checking,
    Mergeable,
    Conflict,
    Ancestor,
    Empty,
    Error,
    Merged,
    ManuallyMerged,
}

impl PullRequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PullRequestStatus::Merged | PullRequestStatus::ManuallyMerged)
    }
}

impl fmt::Display for PullRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PullRequestStatus::Checking => "checking",
            PullRequestStatus::Mergeable => "mergeable",
            PullRequestStatus::Conflict => "conflict",
            PullRequestStatus::Ancestor => "ancestor",
            PullRequestStatus::Empty => "empty",
            PullRequestStatus::Error => "error",
            PullRequestStatus::Merged => "merged",
            PullRequestStatus::ManuallyMerged => "manually_merged",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStyle {
    FastForwardOnly,
    Merge,
    Squash,
    Rebase,
    RebaseMerge,
    /// Rebase the head branch onto base and push it back to head.
    RebaseUpdate,
}

impl MergeStyle {
    pub const ALL: [MergeStyle; 6] = [
        MergeStyle::FastForwardOnly,
        MergeStyle::Merge,
        MergeStyle::Squash,
        MergeStyle::Rebase,
        MergeStyle::RebaseMerge,
        MergeStyle::RebaseUpdate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MergeStyle::FastForwardOnly => "fast-forward-only",
            MergeStyle::Merge => "merge",
            MergeStyle::Squash => "squash",
            MergeStyle::Rebase => "rebase",
            MergeStyle::RebaseMerge => "rebase-merge",
            MergeStyle::RebaseUpdate => "rebase-update",
        }
    }

    pub fn is_rebase(self) -> bool {
        matches!(
            self,
            MergeStyle::Rebase | MergeStyle::RebaseMerge | MergeStyle::RebaseUpdate
        )
    }
}

impl fmt::Display for MergeStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MergeStyle::ALL
            .into_iter()
            .find(|style| style.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown merge style: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: PullId,
    pub index: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub poster: User,
    pub base_repo: Repository,
    pub base_branch: String,
    /// `None` once the head repository has been deleted.
    pub head_repo: Option<Repository>,
    pub head_branch: String,
    #[serde(default)]
    pub head_commit_id: String,
    #[serde(default)]
    pub merge_base: String,
    pub status: PullRequestStatus,
    #[serde(default)]
    pub conflicted_files: Vec<String>,
    #[serde(default)]
    pub changed_protected_files: Vec<String>,
    pub merge_style: Option<MergeStyle>,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default)]
    pub issue_closed: bool,
    #[serde(default)]
    pub has_merged: bool,
    pub merged_commit_id: Option<String>,
    pub merger: Option<User>,
    pub merged_at: Option<DateTime<Utc>>,
}

impl PullRequest {
    pub fn is_same_repo(&self) -> bool {
        self.head_repo
            .as_ref()
            .is_some_and(|head| head.id == self.base_repo.id)
    }

    /// The repository the head branch lives in.
    pub fn head_repository(&self) -> Option<&Repository> {
        self.head_repo.as_ref()
    }

    pub fn is_work_in_progress(&self, prefixes: &[String]) -> bool {
        if self.is_draft {
            return true;
        }
        let title = self.title.trim_start().to_lowercase();
        prefixes
            .iter()
            .any(|prefix| title.starts_with(&prefix.to_lowercase()))
    }

    /// The key used for the auto-merge queue.
    pub fn queue_key(&self) -> String {
        queue_key(self.id, &self.head_commit_id)
    }
}

pub fn queue_key(pull_id: PullId, sha: &str) -> String {
    format!("{pull_id}_{sha}")
}

/// Splits a `"<pullID>_<sha>"` key.
pub fn parse_queue_key(key: &str) -> Option<(PullId, &str)> {
    let (id, sha) = key.split_once('_')?;
    Some((id.parse().ok()?, sha))
}

/// Outcome of one mergeability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub status: PullRequestStatus,
    pub base_commit_id: String,
    pub head_commit_id: String,
    pub merge_base: Option<String>,
    /// Tree produced by the three-way merge when one was computed.
    pub tree_id: Option<String>,
    pub conflicted_files: Vec<String>,
    /// Commit a rebase trial stopped on.
    pub conflicting_commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledAutoMerge {
    pub pull_id: PullId,
    pub doer: User,
    pub style: MergeStyle,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatusState {
    // Ordered from worst to best.
    Error,
    Failure,
    Warning,
    Pending,
    Success,
}

impl CommitStatusState {
    pub fn is_success(self) -> bool {
        self == CommitStatusState::Success
    }
}

impl fmt::Display for CommitStatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommitStatusState::Error => "error",
            CommitStatusState::Failure => "failure",
            CommitStatusState::Warning => "warning",
            CommitStatusState::Pending => "pending",
            CommitStatusState::Success => "success",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub context: String,
    pub state: CommitStatusState,
}

/// Combines the latest statuses of a commit into a single state.
///
/// With required contexts, only those count and a missing context is
/// pending. Without any, the worst reported state wins and no statuses at
/// all is a success.
pub fn combined_status(statuses: &[CommitStatus], required: &[String]) -> CommitStatusState {
    if required.is_empty() {
        return statuses
            .iter()
            .map(|status| status.state)
            .min()
            .unwrap_or(CommitStatusState::Success);
    }

    required
        .iter()
        .map(|context| {
            statuses
                .iter()
                .filter(|status| &status.context == context)
                .map(|status| status.state)
                .min()
                .unwrap_or(CommitStatusState::Pending)
        })
        .min()
        .unwrap_or(CommitStatusState::Success)
}
