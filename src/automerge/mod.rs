//! Auto-merge scheduler
//!
//! A merge intent is stored per pull request while its checks are pending.
//! Status and review events push `"<pullID>_<sha>"` keys onto a unique
//! queue; [`AutoMergeWorker`] drains the queue and re-validates each pull
//! request before merging it. Failures are logged and reported, never
//! retried: the next event enqueues the pull request again.

pub mod queue;
pub mod store;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::collaborators::{MergeEvent, Notifier, PullRequestStore};
use crate::error::{MergeError, Result};
use crate::gate::GateRejection;
use crate::git::{Git2Backend, RepositoryReader};
use crate::service::{MergeOptions, PullService};
use crate::telemetry::create_queue_span;
use crate::types::{parse_queue_key, MergeStyle, PullRequest, PullRequestStatus, RepoId, ScheduledAutoMerge, User};

pub use queue::UniqueQueue;
pub use store::ScheduleStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Stored; the merge happens once checks pass.
    Scheduled,
    /// Checks already pass; the caller should merge right away.
    ReadyNow,
}

pub struct AutoMergeService {
    pulls: Arc<dyn PullRequestStore>,
    schedules: Arc<dyn ScheduleStore>,
    queue: Arc<dyn UniqueQueue>,
    notifier: Arc<dyn Notifier>,
    merger: Arc<PullService>,
}

impl AutoMergeService {
    pub fn new(
        pulls: Arc<dyn PullRequestStore>,
        schedules: Arc<dyn ScheduleStore>,
        queue: Arc<dyn UniqueQueue>,
        notifier: Arc<dyn Notifier>,
        merger: Arc<PullService>,
    ) -> Self {
        Self {
            pulls,
            schedules,
            queue,
            notifier,
            merger,
        }
    }

    pub fn queue(&self) -> &Arc<dyn UniqueQueue> {
        &self.queue
    }

    /// Records the intent to merge `pr` once its checks pass.
    pub async fn schedule(
        &self,
        pr: &PullRequest,
        doer: &User,
        style: MergeStyle,
        message: impl Into<String>,
    ) -> Result<ScheduleOutcome> {
        if pr.has_merged || pr.status.is_terminal() {
            return Err(GateRejection::AlreadyMerged.into());
        }
        if !self.merger.config().is_style_allowed(style) {
            return Err(MergeError::InvalidMergeStyle(style));
        }

        if self.merger.head_status(pr).await?.is_success() {
            debug!(pull_id = pr.id, "Checks already pass, not scheduling");
            return Ok(ScheduleOutcome::ReadyNow);
        }

        let inserted = self
            .schedules
            .insert(ScheduledAutoMerge {
                pull_id: pr.id,
                doer: doer.clone(),
                style,
                message: message.into(),
                created_at: Utc::now(),
            })
            .await?;
        if !inserted {
            return Err(MergeError::AlreadyScheduled { pull_id: pr.id });
        }

        info!(pull_id = pr.id, doer = %doer.name, %style, "Auto merge scheduled");
        self.merger.metrics().record_auto_merge_queued();
        self.notifier
            .notify(MergeEvent::AutoMergeScheduled {
                pull_id: pr.id,
                doer: doer.clone(),
            })
            .await;
        self.enqueue(pr).await?;
        Ok(ScheduleOutcome::Scheduled)
    }

    /// Drops the intent. Returns whether one existed.
    pub async fn cancel(&self, pr: &PullRequest, doer: &User) -> Result<bool> {
        let removed = self.schedules.delete(pr.id).await?;
        if removed {
            info!(pull_id = pr.id, doer = %doer.name, "Auto merge cancelled");
            self.notifier
                .notify(MergeEvent::AutoMergeCancelled {
                    pull_id: pr.id,
                    doer: doer.clone(),
                })
                .await;
        }
        Ok(removed)
    }

    async fn enqueue(&self, pr: &PullRequest) -> Result<bool> {
        let key = pr.queue_key();
        let pushed = self.queue.push(&key).await?;
        if pushed {
            debug!(%key, "Queued auto merge check");
        } else {
            debug!(%key, "Auto merge check already queued");
        }
        Ok(pushed)
    }

    /// A commit status on `repo_id` turned successful for `sha`.
    /// Returns how many pull requests were queued.
    pub async fn on_commit_status_success(&self, repo_id: RepoId, sha: &str) -> Result<usize> {
        let pulls = self.pulls.pulls_by_head_commit(repo_id, sha).await?;
        let mut queued = 0;
        for pr in pulls.iter().filter(|pr| !pr.has_merged && !pr.status.is_terminal()) {
            if self.enqueue(pr).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// A review was submitted or dismissed on `pr`.
    pub async fn on_review_changed(&self, pr: &PullRequest) -> Result<bool> {
        if self.schedules.get(pr.id).await?.is_none() {
            return Ok(false);
        }
        self.enqueue(pr).await
    }

    /// Processes one queue key. Safe to call again with the same key.
    pub async fn handle(&self, key: &str) -> Result<()> {
        let Some((pull_id, sha)) = parse_queue_key(key) else {
            warn!(%key, "Ignoring malformed auto merge key");
            return Ok(());
        };

        let Some(pr) = self.pulls.get(pull_id).await? else {
            debug!(pull_id, "Pull request no longer exists");
            return Ok(());
        };
        if pr.has_merged || pr.status.is_terminal() {
            debug!(pull_id, "Pull request already merged");
            return Ok(());
        }
        let Some(schedule) = self.schedules.get(pull_id).await? else {
            return Ok(());
        };

        match self.try_merge(pr, schedule, sha).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(pull_id, error = %e, "Auto merge failed");
                self.notifier
                    .notify(MergeEvent::AutoMergeFailed {
                        pull_id,
                        reason: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn try_merge(&self, mut pr: PullRequest, schedule: ScheduledAutoMerge, sha: &str) -> Result<()> {
        let Some(head_tip) = head_branch_tip(&pr)? else {
            warn!(pull_id = pr.id, branch = %pr.head_branch, "Head branch of scheduled auto merge no longer exists");
            return Ok(());
        };
        if head_tip != sha {
            debug!(pull_id = pr.id, %sha, %head_tip, "Queued commit is no longer the head");
        }

        if head_tip != pr.head_commit_id || pr.status == PullRequestStatus::Checking {
            self.merger.test_pull(pr.id).await?;
            pr = self.merger.pull(pr.id).await?;
        }

        if !self.merger.head_status(&pr).await?.is_success() {
            info!(pull_id = pr.id, "Scheduled auto merge still waiting for checks");
            return Ok(());
        }

        self.merger.check_mergeable(&pr, &schedule.doer, false).await?;

        let options = MergeOptions {
            style: Some(schedule.style),
            message: (!schedule.message.is_empty()).then(|| schedule.message.clone()),
            expected_head: Some(head_tip),
            was_auto: true,
            ..Default::default()
        };
        let outcome = self.merger.merge(pr.id, &schedule.doer, options).await?;
        info!(pull_id = pr.id, commit_id = %outcome.commit_id, "Auto merge completed");
        Ok(())
    }
}

fn head_branch_tip(pr: &PullRequest) -> Result<Option<String>> {
    let Some(head) = &pr.head_repo else {
        return Ok(None);
    };
    Ok(Git2Backend::open(&head.path)?.branch_commit_id(&pr.head_branch)?)
}

/// Drains the auto-merge queue until cancelled.
pub struct AutoMergeWorker {
    service: Arc<AutoMergeService>,
    poll_interval: Duration,
}

impl AutoMergeWorker {
    pub fn new(service: Arc<AutoMergeService>, poll_interval: Duration) -> Self {
        Self {
            service,
            poll_interval,
        }
    }

    async fn process(&self, key: String) {
        let span = create_queue_span(&key);
        if let Err(e) = self.service.handle(&key).instrument(span).await {
            debug!(%key, error = %e, "Dropping auto merge entry");
        }
        if let Err(e) = self.service.queue.ack(&key).await {
            warn!(%key, error = %e, "Failed to acknowledge auto merge entry");
        }
    }

    /// Handles every key currently waiting. Returns how many were handled.
    pub async fn drain(&self) -> anyhow::Result<usize> {
        let mut handled = 0;
        while let Some(key) = self.service.queue.pop().await? {
            self.process(key).await;
            handled += 1;
        }
        Ok(handled)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("Auto merge worker started");
        while !cancel.is_cancelled() {
            match self.service.queue.pop().await {
                Ok(Some(key)) => self.process(key).await,
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.service.queue.wait_for_work(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to read auto merge queue");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        info!("Auto merge worker stopped");
    }
}
