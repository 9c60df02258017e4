//! Front door of the merge pipeline.
//!
//! `PullService` ties the pieces together the way a request flows: gate,
//! conflict detection when the classification is stale, workspace, merge
//! strategy, LFS migration, push, and finally the pull request's new state.

use anyhow::anyhow;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::automerge::ScheduleStore;
use crate::collaborators::{MergeEvent, Notifier, PolicyService, PullRequestStore, UserDirectory};
use crate::config::{EngineConfig, MergeConfig};
use crate::conflict::{ConflictDetector, ProtectedFileMatcher};
use crate::error::{ErrorClass, MergeError, Result};
use crate::gate::{self, GateInput, GateRejection};
use crate::git::{Git2Backend, GitRunner, RepositoryReader};
use crate::lfs::{LfsMetaStore, LfsMigrator};
use crate::merge::signing::Signer;
use crate::merge::strategies::FileResolution;
use crate::merge::{message, MergeExecutor, MergeMessage, MergeOutcome, MergeRequest};
use crate::observability::MergeMetrics;
use crate::types::{
    combined_status, CommitStatusState, ConflictReport, MergeStyle, PullId, PullRequest, PullRequestStatus, User,
};
use crate::workspace::RepoBuilder;

/// Protected file matches kept on a pull request.
const MAX_PROTECTED_FILES: usize = 10;

/// External capabilities the service is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub pulls: Arc<dyn PullRequestStore>,
    pub policy: Arc<dyn PolicyService>,
    pub users: Arc<dyn UserDirectory>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub lfs: Arc<dyn LfsMetaStore>,
    pub signer: Arc<dyn Signer>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Falls back to the pull request's preferred style, then the default.
    pub style: Option<MergeStyle>,
    /// Falls back to the default message for the style.
    pub message: Option<String>,
    pub expected_head: Option<String>,
    pub resolutions: Vec<FileResolution>,
    /// Lets an administrator bypass branch protection checks.
    pub force: bool,
    pub was_auto: bool,
}

pub struct PullService {
    config: MergeConfig,
    detector: ConflictDetector,
    executor: MergeExecutor,
    pulls: Arc<dyn PullRequestStore>,
    policy: Arc<dyn PolicyService>,
    schedules: Arc<dyn ScheduleStore>,
    signer: Arc<dyn Signer>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<MergeMetrics>,
}

impl PullService {
    pub fn new(config: &EngineConfig, collaborators: Collaborators, cancel: CancellationToken) -> Self {
        let git = GitRunner::new(&config.git.binary, config.git.timeout(), cancel);
        let builder = RepoBuilder::new(git.clone(), &config.workspace.temp_root);
        let detector = ConflictDetector::new(
            builder.clone(),
            config.merge.conflict_detection,
            config.merge.max_conflicted_files,
        );

        let mut executor = MergeExecutor::new(builder, collaborators.signer.clone(), collaborators.users.clone())
            .with_co_committer_trailers(config.merge.add_co_committer_trailers)
            .with_squash_summary(config.merge.squash_summary());
        if config.lfs.enabled {
            executor = executor.with_lfs(LfsMigrator::new(git, collaborators.lfs.clone(), &config.lfs));
        }

        Self {
            config: config.merge.clone(),
            detector,
            executor,
            pulls: collaborators.pulls,
            policy: collaborators.policy,
            schedules: collaborators.schedules,
            signer: collaborators.signer,
            notifier: collaborators.notifier,
            metrics: Arc::new(MergeMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<MergeMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub async fn pull(&self, pull_id: PullId) -> Result<PullRequest> {
        self.pulls.get(pull_id).await?.ok_or(MergeError::PullNotFound(pull_id))
    }

    fn style_for(&self, pr: &PullRequest, requested: Option<MergeStyle>) -> MergeStyle {
        requested
            .or(pr.merge_style)
            .unwrap_or(self.config.default_style)
    }

    /// Recomputes the mergeability classification of a pull request and
    /// stores it.
    pub async fn test_pull(&self, pull_id: PullId) -> Result<ConflictReport> {
        let mut pr = self.pull(pull_id).await?;
        if pr.has_merged || pr.status.is_terminal() {
            return Err(GateRejection::AlreadyMerged.into());
        }

        pr.status = PullRequestStatus::Checking;
        self.pulls.update(&pr).await?;

        let style = self.style_for(&pr, None);
        let report = match self.detector.detect(&pr, style).await {
            Ok(report) => report,
            Err(e) => {
                warn!(pull_id, error = %e, "Mergeability check failed");
                pr.status = PullRequestStatus::Error;
                self.pulls.update(&pr).await?;
                return Err(e);
            }
        };

        pr.status = report.status;
        pr.head_commit_id = report.head_commit_id.clone();
        pr.merge_base = report.merge_base.clone().unwrap_or_default();
        pr.conflicted_files = report.conflicted_files.clone();
        pr.changed_protected_files = if report.status == PullRequestStatus::Empty {
            Vec::new()
        } else {
            self.changed_protected_files(&pr).await?
        };
        self.pulls.update(&pr).await?;

        if report.status == PullRequestStatus::Conflict {
            self.metrics.record_conflict();
        }
        Ok(report)
    }

    async fn changed_protected_files(&self, pr: &PullRequest) -> Result<Vec<String>> {
        let Some(protection) = self.policy.branch_protection(pr.base_repo.id, &pr.base_branch).await? else {
            return Ok(Vec::new());
        };
        let matcher = ProtectedFileMatcher::new(&protection.protected_file_patterns)?;
        if matcher.is_empty() || pr.merge_base.is_empty() {
            return Ok(Vec::new());
        }
        let backend = open_backend(pr)?;
        Ok(matcher.changed_protected_files(&backend, &pr.merge_base, &pr.head_commit_id, MAX_PROTECTED_FILES)?)
    }

    /// Runs the mergeability gate for `doer`.
    pub async fn check_mergeable(&self, pr: &PullRequest, doer: &User, force: bool) -> Result<()> {
        let protection = self.policy.branch_protection(pr.base_repo.id, &pr.base_branch).await?;
        let permission = self.policy.permission(pr.base_repo.id, doer).await?;
        let reviews = self.policy.reviews(pr).await?;
        let combined_status = self.combined_status(pr, protection.as_ref()).await?;
        let can_sign = self.signer.signing_key(&pr.base_repo, doer).await?.is_some();

        let head_is_behind = match &protection {
            Some(rule) if rule.block_on_outdated_branch => head_is_behind(pr)?,
            _ => false,
        };

        let input = GateInput {
            pr,
            doer,
            permission,
            protection: protection.as_ref(),
            combined_status,
            reviews: &reviews,
            head_is_behind,
            can_sign,
            wip_prefixes: &self.config.wip_prefixes,
            force,
        };
        gate::check_pull_mergeable(&input).map_err(MergeError::from)
    }

    /// Combined state of the head commit's statuses, counting only the
    /// contexts branch protection requires when it requires any.
    pub async fn combined_status(
        &self,
        pr: &PullRequest,
        protection: Option<&gate::BranchProtection>,
    ) -> Result<CommitStatusState> {
        let statuses = self.policy.commit_statuses(pr.base_repo.id, &pr.head_commit_id).await?;
        let required = protection.map(|rule| rule.required_contexts()).unwrap_or(&[]);
        Ok(combined_status(&statuses, required))
    }

    pub async fn head_status(&self, pr: &PullRequest) -> Result<CommitStatusState> {
        let protection = self.policy.branch_protection(pr.base_repo.id, &pr.base_branch).await?;
        self.combined_status(pr, protection.as_ref()).await
    }

    pub fn default_message(&self, pr: &PullRequest, style: MergeStyle) -> Result<MergeMessage> {
        let backend = Git2Backend::open(&pr.base_repo.path)?;
        Ok(message::default_merge_message(
            &backend,
            pr,
            style,
            &self.config.message_template_dir,
        )?)
    }

    /// Merges a pull request and records the result.
    pub async fn merge(&self, pull_id: PullId, doer: &User, options: MergeOptions) -> Result<MergeOutcome> {
        let mut pr = self.pull(pull_id).await?;
        let style = self.style_for(&pr, options.style);
        if !self.config.is_style_allowed(style) {
            return Err(MergeError::InvalidMergeStyle(style));
        }

        if pr.status == PullRequestStatus::Checking {
            self.test_pull(pull_id).await?;
            pr = self.pull(pull_id).await?;
        }
        self.check_mergeable(&pr, doer, options.force).await?;

        let summarize_squash = options.message.is_none();
        let message = match options.message {
            Some(message) => message,
            None => self.default_message(&pr, style)?.full(),
        };

        let mut request = MergeRequest::new(pr.clone(), doer.clone(), style, message);
        request.expected_head = options.expected_head;
        request.resolutions = options.resolutions;
        request.summarize_squash = summarize_squash;

        self.metrics.record_attempt();
        let outcome = match self.executor.execute(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };

        if style == MergeStyle::RebaseUpdate {
            // The head branch moved; the pull request stays open.
            pr.head_commit_id = outcome.commit_id.clone();
            pr.status = PullRequestStatus::Checking;
        } else {
            pr.has_merged = true;
            pr.status = PullRequestStatus::Merged;
            pr.merged_commit_id = Some(outcome.commit_id.clone());
            pr.merger = Some(doer.clone());
            pr.merged_at = Some(Utc::now());
        }
        self.pulls.update(&pr).await?;

        self.metrics.record_merged();
        self.metrics.record_lfs_pointers(outcome.lfs_pointers_migrated as u64);
        if style == MergeStyle::RebaseUpdate {
            info!(pull_id, commit_id = %outcome.commit_id, "Head branch updated by rebase");
            return Ok(outcome);
        }

        if self.schedules.delete(pr.id).await? {
            info!(pull_id, "Removed auto merge schedule after merge");
        }
        self.mark_siblings_checking(&pr).await?;
        self.notifier
            .notify(MergeEvent::Merged {
                pull_id,
                doer: doer.clone(),
                style,
                commit_id: outcome.commit_id.clone(),
                auto: options.was_auto,
            })
            .await;
        Ok(outcome)
    }

    /// The base branch moved, so other open pull requests into it need
    /// their conflict status recomputed.
    async fn mark_siblings_checking(&self, merged: &PullRequest) -> Result<()> {
        let siblings = self
            .pulls
            .open_pulls_by_base(merged.base_repo.id, &merged.base_branch)
            .await?;
        for mut pr in siblings {
            if pr.id == merged.id || pr.status == PullRequestStatus::Checking {
                continue;
            }
            pr.status = PullRequestStatus::Checking;
            self.pulls.update(&pr).await?;
            debug!(pull_id = pr.id, base_branch = %pr.base_branch, "Base branch moved, rechecking");
        }
        Ok(())
    }

    fn record_failure(&self, error: &MergeError) {
        match error.class() {
            ErrorClass::Conflict => self.metrics.record_conflict(),
            ErrorClass::PushOutOfDate => self.metrics.record_push_out_of_date(),
            ErrorClass::PushRejected => self.metrics.record_push_rejected(),
            _ => self.metrics.record_failure(),
        }
    }

    /// Marks a pull request merged by a commit pushed outside the engine.
    pub async fn merged_manually(&self, pull_id: PullId, doer: &User, commit_id: &str) -> Result<PullRequest> {
        let mut pr = self.pull(pull_id).await?;
        if pr.has_merged || pr.status.is_terminal() {
            return Err(GateRejection::AlreadyMerged.into());
        }

        verify_in_base_branch(&pr, commit_id)?;

        pr.has_merged = true;
        pr.status = PullRequestStatus::ManuallyMerged;
        pr.merged_commit_id = Some(commit_id.to_string());
        pr.merger = Some(doer.clone());
        pr.merged_at = Some(Utc::now());
        self.pulls.update(&pr).await?;

        self.schedules.delete(pr.id).await?;
        self.notifier
            .notify(MergeEvent::ManuallyMerged {
                pull_id,
                doer: doer.clone(),
                commit_id: commit_id.to_string(),
            })
            .await;
        info!(pull_id, commit_id, "Pull request marked as manually merged");
        Ok(pr)
    }
}

/// SHA-1 or SHA-256 object id in full.
pub fn is_full_commit_id(id: &str) -> bool {
    matches!(id.len(), 40 | 64) && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Checks that `commit_id` is a full id of a commit on the base branch.
fn verify_in_base_branch(pr: &PullRequest, commit_id: &str) -> Result<()> {
    let invalid = |reason: &str| MergeError::InvalidCommitId {
        commit_id: commit_id.to_string(),
        reason: reason.to_string(),
    };
    if !is_full_commit_id(commit_id) {
        return Err(invalid("not a full commit id"));
    }

    let backend = Git2Backend::open(&pr.base_repo.path)?;
    if !backend.commit_exists(commit_id)? {
        return Err(invalid("commit does not exist"));
    }
    let base_tip = backend
        .branch_commit_id(&pr.base_branch)?
        .ok_or_else(|| anyhow!("base branch {} does not exist", pr.base_branch))?;
    if !backend.is_ancestor(commit_id, &base_tip)? {
        return Err(invalid("commit is not in the base branch"));
    }
    Ok(())
}

fn open_backend(pr: &PullRequest) -> Result<Git2Backend> {
    let backend = match &pr.head_repo {
        Some(head) if !pr.is_same_repo() => Git2Backend::open_with_alternate(&pr.base_repo.path, &head.path)?,
        _ => Git2Backend::open(&pr.base_repo.path)?,
    };
    Ok(backend)
}

/// Whether the base branch has commits the head does not contain.
fn head_is_behind(pr: &PullRequest) -> Result<bool> {
    let backend = open_backend(pr)?;
    let Some(base_tip) = backend.branch_commit_id(&pr.base_branch)? else {
        return Ok(false);
    };
    if pr.head_commit_id.is_empty() {
        return Ok(false);
    }
    Ok(!backend.is_ancestor(&base_tip, &pr.head_commit_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_commit_ids() {
        assert!(is_full_commit_id("0123456789abcdef0123456789abcdef01234567"));
        assert!(is_full_commit_id(&"a".repeat(64)));
        assert!(!is_full_commit_id("0123456"));
        assert!(!is_full_commit_id(&"g".repeat(40)));
    }
}
