use anyhow::Result;
use async_trait::async_trait;

use crate::types::{PullId, ScheduledAutoMerge};

/// Persistence for auto-merge intents, at most one per pull request.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Returns `false` without writing when the pull request already has one.
    async fn insert(&self, schedule: ScheduledAutoMerge) -> Result<bool>;

    async fn get(&self, pull_id: PullId) -> Result<Option<ScheduledAutoMerge>>;

    /// Returns whether a record existed.
    async fn delete(&self, pull_id: PullId) -> Result<bool>;
}
