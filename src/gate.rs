//! Mergeability gate
//!
//! A pure decision over a pull request and a snapshot of the policy that
//! applies to it. Everything here is computed by the caller beforehand, so
//! the same inputs always produce the same verdict.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CommitStatusState, PullRequest, PullRequestStatus, User, UserId};

/// Branch protection rule for a base branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchProtection {
    pub branch_name: String,
    pub enable_merge_whitelist: bool,
    pub merge_whitelist_user_ids: Vec<UserId>,
    pub enable_status_check: bool,
    pub status_check_contexts: Vec<String>,
    pub required_approvals: u32,
    pub block_on_rejected_reviews: bool,
    pub block_on_official_review_requests: bool,
    pub block_on_outdated_branch: bool,
    pub require_signed_commits: bool,
    pub protected_file_patterns: Vec<String>,
}

impl BranchProtection {
    pub fn required_contexts(&self) -> &[String] {
        if self.enable_status_check {
            &self.status_check_contexts
        } else {
            &[]
        }
    }

    fn allows_merge_by(&self, user: &User, permission: &PermissionSnapshot) -> bool {
        if self.enable_merge_whitelist {
            self.merge_whitelist_user_ids.contains(&user.id)
        } else {
            permission.can_write_base
        }
    }
}

/// What the acting user may do on the base repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    pub can_write_base: bool,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSummary {
    /// Approvals by official reviewers on the current head.
    pub official_approvals: u32,
    pub has_official_rejection: bool,
    pub has_pending_official_requests: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    #[error("pull request has already been merged")]
    AlreadyMerged,
    #[error("pull request is closed")]
    IssueClosed,
    #[error("user is not allowed to merge into {branch}")]
    NotAllowed { branch: String },
    #[error("pull request is marked as work in progress")]
    WorkInProgress,
    #[error("pull request is still being checked")]
    Checking,
    #[error("pull request is not mergeable (status: {status})")]
    NotMergeable { status: PullRequestStatus },
    #[error("required status checks have not succeeded (state: {state})")]
    StatusChecksFailed { state: CommitStatusState },
    #[error("{have} of {need} required approvals")]
    InsufficientApprovals { have: u32, need: u32 },
    #[error("an official reviewer requested changes")]
    RejectedReview,
    #[error("official review requests are pending")]
    OfficialReviewRequested,
    #[error("head branch is behind the base branch")]
    OutdatedBranch,
    #[error("protected files were changed: {}", .0.join(", "))]
    ProtectedFilesChanged(Vec<String>),
    #[error("merge commit cannot be signed")]
    NotSignable,
}

impl GateRejection {
    /// Rejections an administrator may override with `force`.
    pub fn is_branch_protection_check(&self) -> bool {
        matches!(
            self,
            GateRejection::StatusChecksFailed { .. }
                | GateRejection::InsufficientApprovals { .. }
                | GateRejection::RejectedReview
                | GateRejection::OfficialReviewRequested
                | GateRejection::OutdatedBranch
                | GateRejection::ProtectedFilesChanged(_)
        )
    }
}

/// Everything the gate looks at.
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub pr: &'a PullRequest,
    pub doer: &'a User,
    pub permission: PermissionSnapshot,
    pub protection: Option<&'a BranchProtection>,
    pub combined_status: CommitStatusState,
    pub reviews: &'a ReviewSummary,
    /// Base branch has commits the head does not contain.
    pub head_is_behind: bool,
    /// A signing key is available for the merge commit.
    pub can_sign: bool,
    pub wip_prefixes: &'a [String],
    pub force: bool,
}

pub fn is_user_allowed_to_merge(
    protection: Option<&BranchProtection>,
    permission: &PermissionSnapshot,
    user: &User,
) -> bool {
    match protection {
        Some(rule) => rule.allows_merge_by(user, permission),
        None => permission.can_write_base,
    }
}

/// Checks the rules a protected branch imposes on the pull request.
pub fn check_branch_protections(input: &GateInput<'_>) -> Result<(), GateRejection> {
    let Some(rule) = input.protection else {
        return Ok(());
    };

    if rule.enable_status_check && !input.combined_status.is_success() {
        return Err(GateRejection::StatusChecksFailed {
            state: input.combined_status,
        });
    }
    if input.reviews.official_approvals < rule.required_approvals {
        return Err(GateRejection::InsufficientApprovals {
            have: input.reviews.official_approvals,
            need: rule.required_approvals,
        });
    }
    if rule.block_on_rejected_reviews && input.reviews.has_official_rejection {
        return Err(GateRejection::RejectedReview);
    }
    if rule.block_on_official_review_requests && input.reviews.has_pending_official_requests {
        return Err(GateRejection::OfficialReviewRequested);
    }
    if rule.block_on_outdated_branch && input.head_is_behind {
        return Err(GateRejection::OutdatedBranch);
    }
    if !input.pr.changed_protected_files.is_empty() {
        return Err(GateRejection::ProtectedFilesChanged(
            input.pr.changed_protected_files.clone(),
        ));
    }
    Ok(())
}

/// Decides whether `input.doer` may merge `input.pr` right now.
pub fn check_pull_mergeable(input: &GateInput<'_>) -> Result<(), GateRejection> {
    let pr = input.pr;

    if pr.has_merged || pr.status.is_terminal() {
        return Err(GateRejection::AlreadyMerged);
    }
    if pr.issue_closed {
        return Err(GateRejection::IssueClosed);
    }
    if !is_user_allowed_to_merge(input.protection, &input.permission, input.doer) {
        return Err(GateRejection::NotAllowed {
            branch: pr.base_branch.clone(),
        });
    }
    if pr.is_work_in_progress(input.wip_prefixes) {
        return Err(GateRejection::WorkInProgress);
    }
    if pr.status == PullRequestStatus::Checking {
        return Err(GateRejection::Checking);
    }
    if pr.status != PullRequestStatus::Mergeable {
        return Err(GateRejection::NotMergeable { status: pr.status });
    }

    if let Err(rejection) = check_branch_protections(input) {
        if !(rejection.is_branch_protection_check() && input.force && input.permission.is_admin) {
            return Err(rejection);
        }
        tracing::warn!(
            pull_id = pr.id,
            doer = %input.doer.name,
            %rejection,
            "Administrator overrode branch protection"
        );
    }

    if input
        .protection
        .is_some_and(|rule| rule.require_signed_commits)
        && !input.can_sign
    {
        return Err(GateRejection::NotSignable);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Repository;
    use std::path::PathBuf;

    fn user(id: i64) -> User {
        User {
            id,
            name: format!("user{id}"),
            email: format!("user{id}@example.com"),
        }
    }

    fn pull() -> PullRequest {
        let repo = Repository {
            id: 1,
            owner: "org".into(),
            name: "repo".into(),
            path: PathBuf::from("/tmp/repo.git"),
        };
        PullRequest {
            id: 7,
            index: 3,
            title: "Add feature".into(),
            description: String::new(),
            poster: user(2),
            base_repo: repo.clone(),
            base_branch: "main".into(),
            head_repo: Some(repo),
            head_branch: "feature".into(),
            head_commit_id: "h".into(),
            merge_base: "m".into(),
            status: PullRequestStatus::Mergeable,
            conflicted_files: vec![],
            changed_protected_files: vec![],
            merge_style: None,
            is_draft: false,
            issue_closed: false,
            has_merged: false,
            merged_commit_id: None,
            merger: None,
            merged_at: None,
        }
    }

    struct Fixture {
        pr: PullRequest,
        doer: User,
        protection: Option<BranchProtection>,
        reviews: ReviewSummary,
        wip: Vec<String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pr: pull(),
                doer: user(1),
                protection: None,
                reviews: ReviewSummary::default(),
                wip: vec!["WIP:".to_string()],
            }
        }

        fn input(&self) -> GateInput<'_> {
            GateInput {
                pr: &self.pr,
                doer: &self.doer,
                permission: PermissionSnapshot {
                    can_write_base: true,
                    is_admin: false,
                },
                protection: self.protection.as_ref(),
                combined_status: CommitStatusState::Success,
                reviews: &self.reviews,
                head_is_behind: false,
                can_sign: false,
                wip_prefixes: &self.wip,
                force: false,
            }
        }
    }

    #[test]
    fn test_mergeable_pull_passes() {
        let fixture = Fixture::new();
        assert_eq!(check_pull_mergeable(&fixture.input()), Ok(()));
    }

    #[test]
    fn test_already_merged_is_checked_first() {
        let mut fixture = Fixture::new();
        fixture.pr.has_merged = true;
        fixture.pr.issue_closed = true;
        assert_eq!(
            check_pull_mergeable(&fixture.input()),
            Err(GateRejection::AlreadyMerged)
        );
    }

    #[test]
    fn test_write_access_required_without_whitelist() {
        let fixture = Fixture::new();
        let mut input = fixture.input();
        input.permission.can_write_base = false;
        assert!(matches!(
            check_pull_mergeable(&input),
            Err(GateRejection::NotAllowed { .. })
        ));
    }

    #[test]
    fn test_whitelist_grants_merge_without_write_access() {
        let mut fixture = Fixture::new();
        fixture.protection = Some(BranchProtection {
            enable_merge_whitelist: true,
            merge_whitelist_user_ids: vec![1],
            ..Default::default()
        });
        let mut input = fixture.input();
        input.permission.can_write_base = false;
        assert_eq!(check_pull_mergeable(&input), Ok(()));
    }

    #[test]
    fn test_work_in_progress_title_blocks() {
        let mut fixture = Fixture::new();
        fixture.pr.title = "wip: not yet".into();
        assert_eq!(
            check_pull_mergeable(&fixture.input()),
            Err(GateRejection::WorkInProgress)
        );
    }

    #[test]
    fn test_non_mergeable_status_blocks() {
        let mut fixture = Fixture::new();
        fixture.pr.status = PullRequestStatus::Conflict;
        assert_eq!(
            check_pull_mergeable(&fixture.input()),
            Err(GateRejection::NotMergeable {
                status: PullRequestStatus::Conflict
            })
        );
        fixture.pr.status = PullRequestStatus::Checking;
        assert_eq!(
            check_pull_mergeable(&fixture.input()),
            Err(GateRejection::Checking)
        );
    }

    #[test]
    fn test_pending_required_checks_block_unless_admin_forces() {
        let mut fixture = Fixture::new();
        fixture.protection = Some(BranchProtection {
            enable_status_check: true,
            status_check_contexts: vec!["ci".into()],
            ..Default::default()
        });
        let mut input = fixture.input();
        input.combined_status = CommitStatusState::Pending;
        assert!(matches!(
            check_pull_mergeable(&input),
            Err(GateRejection::StatusChecksFailed { .. })
        ));

        input.force = true;
        assert!(check_pull_mergeable(&input).is_err(), "force needs admin rights");

        input.permission.is_admin = true;
        assert_eq!(check_pull_mergeable(&input), Ok(()));
    }

    #[test]
    fn test_force_never_overrides_signing() {
        let mut fixture = Fixture::new();
        fixture.protection = Some(BranchProtection {
            require_signed_commits: true,
            ..Default::default()
        });
        let mut input = fixture.input();
        input.force = true;
        input.permission.is_admin = true;
        assert_eq!(check_pull_mergeable(&input), Err(GateRejection::NotSignable));

        input.can_sign = true;
        assert_eq!(check_pull_mergeable(&input), Ok(()));
    }

    #[test]
    fn test_force_never_overrides_permission() {
        let fixture = Fixture::new();
        let mut input = fixture.input();
        input.permission = PermissionSnapshot {
            can_write_base: false,
            is_admin: true,
        };
        input.force = true;
        assert!(matches!(
            check_pull_mergeable(&input),
            Err(GateRejection::NotAllowed { .. })
        ));
    }

    #[test]
    fn test_review_rules() {
        let mut fixture = Fixture::new();
        fixture.protection = Some(BranchProtection {
            required_approvals: 2,
            block_on_rejected_reviews: true,
            ..Default::default()
        });
        fixture.reviews.official_approvals = 1;
        assert_eq!(
            check_pull_mergeable(&fixture.input()),
            Err(GateRejection::InsufficientApprovals { have: 1, need: 2 })
        );

        fixture.reviews.official_approvals = 2;
        fixture.reviews.has_official_rejection = true;
        assert_eq!(
            check_pull_mergeable(&fixture.input()),
            Err(GateRejection::RejectedReview)
        );
    }

    #[test]
    fn test_outdated_branch_and_protected_files() {
        let mut fixture = Fixture::new();
        fixture.protection = Some(BranchProtection {
            block_on_outdated_branch: true,
            ..Default::default()
        });
        let mut input = fixture.input();
        input.head_is_behind = true;
        assert_eq!(check_pull_mergeable(&input), Err(GateRejection::OutdatedBranch));

        fixture.pr.changed_protected_files = vec!["Cargo.lock".into()];
        assert!(matches!(
            check_pull_mergeable(&fixture.input()),
            Err(GateRejection::ProtectedFilesChanged(files)) if files == vec!["Cargo.lock".to_string()]
        ));
    }
}
