//! Conflict detection
//!
//! Classifies a base/head pair as Ancestor, Empty, Conflict or Mergeable.
//! Two algorithms produce the same classification: an in-memory tree merge
//! ([`tree_merge`]) and a real trial merge in a scratch workspace
//! ([`trial`]). Which one runs is a deployment choice.

pub mod protected;
pub mod tree_merge;
pub mod trial;

use anyhow::anyhow;
use std::path::Path;
use tracing::{info, warn};

use crate::config::ConflictDetection;
use crate::error::Result;
use crate::git::{Git2Backend, RepositoryReader};
use crate::observability::OperationTimer;
use crate::types::{ConflictReport, MergeStyle, PullRequest, PullRequestStatus};
use crate::workspace::RepoBuilder;

pub use protected::ProtectedFileMatcher;

/// Classification of a pair that has a merge base and is not an ancestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: PullRequestStatus,
    pub tree_id: Option<String>,
    pub conflicted_files: Vec<String>,
    pub conflicting_commit: Option<String>,
}

/// Tips and merge base of a pull request as currently stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTriple {
    pub base: String,
    pub head: String,
    pub merge_base: Option<String>,
}

/// Reads the branch tips of `pr` and their merge base.
pub fn resolve_commits(pr: &PullRequest) -> Result<CommitTriple> {
    let head_repo = pr
        .head_repo
        .as_ref()
        .ok_or_else(|| anyhow!("head repository of pull request {} no longer exists", pr.id))?;

    let head = Git2Backend::open(&head_repo.path)?
        .branch_commit_id(&pr.head_branch)?
        .ok_or_else(|| anyhow!("head branch {} does not exist", pr.head_branch))?;

    let backend = Git2Backend::open_with_alternate(&pr.base_repo.path, &head_repo.path)?;
    let base = backend
        .branch_commit_id(&pr.base_branch)?
        .ok_or_else(|| anyhow!("base branch {} does not exist", pr.base_branch))?;
    let merge_base = backend.merge_base(&base, &head)?;

    Ok(CommitTriple { base, head, merge_base })
}

pub struct ConflictDetector {
    builder: RepoBuilder,
    mode: ConflictDetection,
    max_files: usize,
}

impl ConflictDetector {
    pub fn new(builder: RepoBuilder, mode: ConflictDetection, max_files: usize) -> Self {
        Self {
            builder,
            mode,
            max_files,
        }
    }

    /// Classifies the current tips of `pr`.
    pub async fn detect(&self, pr: &PullRequest, style: MergeStyle) -> Result<ConflictReport> {
        let timer = OperationTimer::new("conflict_detection");
        let commits = resolve_commits(pr)?;
        let report = self.classify(pr, style, commits).await;
        timer.finish();
        report
    }

    async fn classify(&self, pr: &PullRequest, style: MergeStyle, commits: CommitTriple) -> Result<ConflictReport> {
        let CommitTriple { base, head, merge_base } = commits;

        let mut report = ConflictReport {
            status: PullRequestStatus::Checking,
            base_commit_id: base.clone(),
            head_commit_id: head.clone(),
            merge_base: merge_base.clone(),
            tree_id: None,
            conflicted_files: Vec::new(),
            conflicting_commit: None,
        };

        let Some(merge_base) = merge_base else {
            // Unrelated histories must not block creating the pull request.
            warn!(pull_id = pr.id, %base, %head, "No merge base found, classifying as empty");
            report.status = PullRequestStatus::Empty;
            return Ok(report);
        };

        if head == merge_base {
            report.status = PullRequestStatus::Ancestor;
            info!(pull_id = pr.id, %head, "Head is already contained in base");
            return Ok(report);
        }

        let head_path = pr
            .head_repo
            .as_ref()
            .map(|repo| repo.path.as_path())
            .unwrap_or(Path::new(""));
        let in_memory = || {
            tree_merge::classify_paths(&pr.base_repo.path, head_path, &base, &head, &merge_base, self.max_files)
        };
        let classification = match self.mode {
            ConflictDetection::TreeMerge => in_memory()?,
            ConflictDetection::WorkspaceTrial => trial::classify(&self.builder, pr, style, self.max_files).await?,
            ConflictDetection::Auto => match in_memory() {
                Ok(classification) => classification,
                Err(e) => {
                    warn!(pull_id = pr.id, error = %e, "Tree merge unavailable, falling back to a trial merge");
                    trial::classify(&self.builder, pr, style, self.max_files).await?
                }
            },
        };

        report.status = classification.status;
        report.tree_id = classification.tree_id;
        report.conflicted_files = classification.conflicted_files;
        report.conflicting_commit = classification.conflicting_commit;

        info!(
            pull_id = pr.id,
            status = %report.status,
            conflicts = report.conflicted_files.len(),
            "Mergeability classified"
        );
        Ok(report)
    }
}
