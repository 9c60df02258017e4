//! Merge strategy executor
//!
//! Builds a workspace, lands the pull request with the requested style,
//! migrates LFS pointers and pushes the result. The attempt is tracked by
//! [`attempt::MergeAttempt`]; the workspace is removed on every exit path.

pub mod attempt;
pub mod context;
pub mod message;
pub mod push;
pub mod signing;
pub mod strategies;

use serde::Serialize;
use std::sync::Arc;
use statig::prelude::*;
use tracing::{info, warn, Instrument};

use crate::collaborators::UserDirectory;
use crate::error::{MergeError, Result};
use crate::lfs::pipeline::MigrationRange;
use crate::lfs::LfsMigrator;
use crate::observability::OperationTimer;
use crate::telemetry::{create_merge_span, generate_correlation_id};
use crate::types::{MergeStyle, PullRequest, User};
use crate::workspace::{RepoBuilder, BASE_BRANCH, BASE_REMOTE, HEAD_REMOTE, ORIGINAL_BASE_BRANCH, STAGING_BRANCH};

use attempt::{AttemptEvent, AttemptPhase, MergeAttempt};
use context::MergeContext;
use signing::{commit_identities, Signer};
use strategies::FileResolution;

pub use message::{default_merge_message, MergeMessage, SquashSummary};
pub use strategies::ResolutionAction;

/// Everything needed to land one pull request.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub pr: PullRequest,
    pub doer: User,
    pub style: MergeStyle,
    pub message: String,
    /// Head commit the caller validated; a different fetched tip aborts.
    pub expected_head: Option<String>,
    pub resolutions: Vec<FileResolution>,
    /// Append a generated body to a `Squash` message.
    pub summarize_squash: bool,
}

impl MergeRequest {
    pub fn new(pr: PullRequest, doer: User, style: MergeStyle, message: impl Into<String>) -> Self {
        Self {
            pr,
            doer,
            style,
            message: message.into(),
            expected_head: None,
            resolutions: Vec::new(),
            summarize_squash: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// New base tip, or the new head tip for `RebaseUpdate`.
    pub commit_id: String,
    pub style: MergeStyle,
    pub phase: AttemptPhase,
    pub lfs_pointers_migrated: usize,
}

pub struct MergeExecutor {
    builder: RepoBuilder,
    signer: Arc<dyn Signer>,
    users: Arc<dyn UserDirectory>,
    lfs: Option<LfsMigrator>,
    add_co_committer_trailers: bool,
    squash_summary: SquashSummary,
}

impl MergeExecutor {
    pub fn new(builder: RepoBuilder, signer: Arc<dyn Signer>, users: Arc<dyn UserDirectory>) -> Self {
        Self {
            builder,
            signer,
            users,
            lfs: None,
            add_co_committer_trailers: true,
            squash_summary: SquashSummary::default(),
        }
    }

    pub fn with_lfs(mut self, lfs: LfsMigrator) -> Self {
        self.lfs = Some(lfs);
        self
    }

    pub fn with_co_committer_trailers(mut self, enabled: bool) -> Self {
        self.add_co_committer_trailers = enabled;
        self
    }

    pub fn with_squash_summary(mut self, summary: SquashSummary) -> Self {
        self.squash_summary = summary;
        self
    }

    pub async fn execute(&self, request: &MergeRequest) -> Result<MergeOutcome> {
        let span = create_merge_span(request.pr.id, request.style, &generate_correlation_id());
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: &MergeRequest) -> Result<MergeOutcome> {
        let MergeRequest { pr, doer, style, .. } = request;
        let style = *style;
        let timer = OperationTimer::new("merge");

        let workspace = self.builder.build(pr).await?;
        if let Some(expected) = &request.expected_head {
            if expected != workspace.head_commit_id() {
                return Err(MergeError::ShaMismatch {
                    expected: expected.clone(),
                    actual: workspace.head_commit_id().to_string(),
                });
            }
        }

        let key = self.signer.signing_key(&pr.base_repo, doer).await?;
        let (author, committer) = commit_identities(doer, key.as_ref(), self.signer.trust_model(&pr.base_repo));
        let mut ctx = MergeContext::new(
            workspace,
            self.builder.git().clone(),
            pr,
            author,
            committer,
            key.map(|key| key.key_id),
        );

        let mut attempt = MergeAttempt::new(pr.id, style).state_machine();
        attempt.handle(&AttemptEvent::Start);

        let landed = match style {
            MergeStyle::FastForwardOnly => strategies::fast_forward_only(&mut ctx).await,
            MergeStyle::Merge => strategies::merge(&mut ctx, &request.message, &request.resolutions).await,
            MergeStyle::Squash => {
                strategies::squash(
                    &mut ctx,
                    pr,
                    &request.message,
                    self.users.as_ref(),
                    self.add_co_committer_trailers,
                    request.summarize_squash.then_some(&self.squash_summary),
                )
                .await
            }
            MergeStyle::Rebase | MergeStyle::RebaseMerge | MergeStyle::RebaseUpdate => {
                strategies::rebase(&mut ctx, style, &request.message).await
            }
        };
        if let Err(e) = landed {
            if let MergeError::Conflict { files, commit_sha, .. } = &e {
                attempt.handle(&AttemptEvent::Conflicted {
                    files: files.clone(),
                    commit: commit_sha.clone(),
                });
            }
            warn!(pull_id = pr.id, %style, error = %e, phase = ?attempt.inner().phase(), "Merge failed");
            return Err(e);
        }

        let result_ref = if style == MergeStyle::RebaseUpdate {
            STAGING_BRANCH
        } else {
            BASE_BRANCH
        };
        let commit_id = ctx.workspace.rev_parse(&ctx.git, result_ref).await?;
        attempt.handle(&AttemptEvent::Committed {
            commit_id: commit_id.clone(),
        });

        let mut migrated = 0;
        if style != MergeStyle::RebaseUpdate {
            if let Some(lfs) = &self.lfs {
                let range = MigrationRange {
                    workspace: ctx.workspace.path().to_path_buf(),
                    head: ctx.workspace.rev_parse(&ctx.git, "HEAD").await?,
                    base: ctx.workspace.rev_parse(&ctx.git, ORIGINAL_BASE_BRANCH).await?,
                    head_repo_id: pr.head_repo.as_ref().map_or(pr.base_repo.id, |repo| repo.id),
                    base_repo_id: pr.base_repo.id,
                };
                migrated = lfs.migrate(&range).await?;
            }
        }

        ctx.extend_env(push::pushing_env(pr, doer, true));
        let push = if style == MergeStyle::RebaseUpdate {
            // Only replace the head branch if nobody pushed to it meanwhile.
            let lease = format!("--force-with-lease=refs/heads/{}:{}", pr.head_branch, ctx.workspace.head_commit_id());
            ctx.command(["push", lease.as_str(), HEAD_REMOTE])
                .arg(format!("{STAGING_BRANCH}:refs/heads/{}", pr.head_branch))
        } else {
            ctx.command(["push", BASE_REMOTE])
                .arg(format!("{BASE_BRANCH}:refs/heads/{}", pr.base_branch))
        };
        let output = ctx.output_of(&push).await?;
        if !output.success() {
            let err = push::classify_push_failure(&push.display(), output);
            match &err {
                MergeError::PushOutOfDate { .. } => attempt.handle(&AttemptEvent::PushOutOfDate),
                MergeError::PushRejected { message, .. } => attempt.handle(&AttemptEvent::PushRejected {
                    message: message.clone(),
                }),
                _ => {}
            }
            warn!(pull_id = pr.id, %style, error = %err, phase = ?attempt.inner().phase(), "Push failed");
            return Err(err);
        }
        attempt.handle(&AttemptEvent::Pushed);
        attempt.handle(&AttemptEvent::Finish);

        ctx.workspace.cleanup();
        timer.finish();
        info!(pull_id = pr.id, %style, %commit_id, lfs_pointers = migrated, "Pull request merged");

        Ok(MergeOutcome {
            commit_id,
            style,
            phase: attempt.inner().phase(),
            lfs_pointers_migrated: migrated,
        })
    }
}
