//! In-process collaborators
//!
//! Map-backed implementations of every capability trait. The CLI wires
//! these around local repositories and the tests seed them directly.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::automerge::{ScheduleStore, UniqueQueue};
use crate::collaborators::{MergeEvent, Notifier, PolicyService, PullRequestStore, UserDirectory};
use crate::gate::{BranchProtection, PermissionSnapshot, ReviewSummary};
use crate::lfs::{LfsMetaObject, LfsMetaStore};
use crate::types::{CommitStatus, PullId, PullRequest, RepoId, ScheduledAutoMerge, User, UserId};

#[derive(Debug, Default)]
pub struct MemoryPullStore {
    pulls: Mutex<HashMap<PullId, PullRequest>>,
}

impl MemoryPullStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, pr: PullRequest) {
        self.pulls.lock().await.insert(pr.id, pr);
    }
}

#[async_trait]
impl PullRequestStore for MemoryPullStore {
    async fn get(&self, pull_id: PullId) -> Result<Option<PullRequest>> {
        Ok(self.pulls.lock().await.get(&pull_id).cloned())
    }

    async fn update(&self, pr: &PullRequest) -> Result<()> {
        self.pulls.lock().await.insert(pr.id, pr.clone());
        Ok(())
    }

    async fn pulls_by_head_commit(&self, repo_id: RepoId, sha: &str) -> Result<Vec<PullRequest>> {
        let pulls = self.pulls.lock().await;
        let mut matching: Vec<PullRequest> = pulls
            .values()
            .filter(|pr| !pr.has_merged && pr.head_commit_id == sha)
            .filter(|pr| pr.head_repo.as_ref().is_some_and(|head| head.id == repo_id))
            .cloned()
            .collect();
        matching.sort_by_key(|pr| pr.id);
        Ok(matching)
    }

    async fn open_pulls_by_base(&self, repo_id: RepoId, branch: &str) -> Result<Vec<PullRequest>> {
        let pulls = self.pulls.lock().await;
        let mut matching: Vec<PullRequest> = pulls
            .values()
            .filter(|pr| !pr.has_merged && !pr.issue_closed && !pr.status.is_terminal())
            .filter(|pr| pr.base_repo.id == repo_id && pr.base_branch == branch)
            .cloned()
            .collect();
        matching.sort_by_key(|pr| pr.id);
        Ok(matching)
    }
}

/// Policy with everything allowed unless configured otherwise.
#[derive(Debug)]
pub struct MemoryPolicy {
    protections: Mutex<HashMap<(RepoId, String), BranchProtection>>,
    permissions: Mutex<HashMap<(RepoId, UserId), PermissionSnapshot>>,
    statuses: Mutex<HashMap<(RepoId, String), Vec<CommitStatus>>>,
    reviews: Mutex<HashMap<PullId, ReviewSummary>>,
    default_permission: PermissionSnapshot,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPolicy {
    pub fn new() -> Self {
        Self::with_default_permission(PermissionSnapshot {
            can_write_base: true,
            is_admin: false,
        })
    }

    pub fn with_default_permission(default_permission: PermissionSnapshot) -> Self {
        Self {
            protections: Mutex::new(HashMap::new()),
            permissions: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            reviews: Mutex::new(HashMap::new()),
            default_permission,
        }
    }

    pub async fn set_protection(&self, repo_id: RepoId, protection: BranchProtection) {
        self.protections
            .lock()
            .await
            .insert((repo_id, protection.branch_name.clone()), protection);
    }

    pub async fn set_permission(&self, repo_id: RepoId, user_id: UserId, permission: PermissionSnapshot) {
        self.permissions.lock().await.insert((repo_id, user_id), permission);
    }

    /// Records `status`, replacing an earlier one with the same context.
    pub async fn set_status(&self, repo_id: RepoId, sha: &str, status: CommitStatus) {
        let mut statuses = self.statuses.lock().await;
        let entry = statuses.entry((repo_id, sha.to_string())).or_default();
        entry.retain(|existing| existing.context != status.context);
        entry.push(status);
    }

    pub async fn set_reviews(&self, pull_id: PullId, reviews: ReviewSummary) {
        self.reviews.lock().await.insert(pull_id, reviews);
    }
}

#[async_trait]
impl PolicyService for MemoryPolicy {
    async fn branch_protection(&self, repo_id: RepoId, branch: &str) -> Result<Option<BranchProtection>> {
        Ok(self
            .protections
            .lock()
            .await
            .get(&(repo_id, branch.to_string()))
            .cloned())
    }

    async fn permission(&self, repo_id: RepoId, user: &User) -> Result<PermissionSnapshot> {
        Ok(self
            .permissions
            .lock()
            .await
            .get(&(repo_id, user.id))
            .copied()
            .unwrap_or(self.default_permission))
    }

    async fn commit_statuses(&self, repo_id: RepoId, sha: &str) -> Result<Vec<CommitStatus>> {
        Ok(self
            .statuses
            .lock()
            .await
            .get(&(repo_id, sha.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn reviews(&self, pr: &PullRequest) -> Result<ReviewSummary> {
        Ok(self.reviews.lock().await.get(&pr.id).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    by_email: Mutex<HashMap<String, User>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, user: User) {
        self.by_email.lock().await.insert(user.email.to_lowercase(), user);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self.by_email.lock().await.get(&email.to_lowercase()).cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<HashMap<PullId, ScheduledAutoMerge>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, schedule: ScheduledAutoMerge) -> Result<bool> {
        let mut schedules = self.schedules.lock().await;
        if schedules.contains_key(&schedule.pull_id) {
            return Ok(false);
        }
        schedules.insert(schedule.pull_id, schedule);
        Ok(true)
    }

    async fn get(&self, pull_id: PullId) -> Result<Option<ScheduledAutoMerge>> {
        Ok(self.schedules.lock().await.get(&pull_id).cloned())
    }

    async fn delete(&self, pull_id: PullId) -> Result<bool> {
        Ok(self.schedules.lock().await.remove(&pull_id).is_some())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLfsMetaStore {
    objects: Mutex<HashMap<(RepoId, String), LfsMetaObject>>,
}

impl MemoryLfsMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered objects of `repository_id`, sorted by oid.
    pub async fn objects(&self, repository_id: RepoId) -> Vec<LfsMetaObject> {
        let mut objects: Vec<LfsMetaObject> = self
            .objects
            .lock()
            .await
            .values()
            .filter(|meta| meta.repository_id == repository_id)
            .cloned()
            .collect();
        objects.sort_by(|a, b| a.oid.cmp(&b.oid));
        objects
    }
}

#[async_trait]
impl LfsMetaStore for MemoryLfsMetaStore {
    async fn get_meta_object(&self, repository_id: RepoId, oid: &str) -> Result<Option<LfsMetaObject>> {
        Ok(self
            .objects
            .lock()
            .await
            .get(&(repository_id, oid.to_string()))
            .cloned())
    }

    async fn new_meta_object(&self, meta: LfsMetaObject) -> Result<()> {
        self.objects
            .lock()
            .await
            .entry((meta.repository_id, meta.oid.clone()))
            .or_insert(meta);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
}

/// FIFO unique queue that wakes its worker on push.
#[derive(Debug, Default)]
pub struct MemoryUniqueQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl MemoryUniqueQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl UniqueQueue for MemoryUniqueQueue {
    async fn push(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.queued.insert(key.to_string()) {
            return Ok(false);
        }
        state.pending.push_back(key.to_string());
        drop(state);
        self.wake.notify_one();
        Ok(true)
    }

    async fn pop(&self) -> Result<Option<String>> {
        let mut state = self.state.lock().await;
        let Some(key) = state.pending.pop_front() else {
            return Ok(None);
        };
        state.queued.remove(&key);
        state.in_flight.insert(key.clone());
        Ok(Some(key))
    }

    async fn ack(&self, key: &str) -> Result<()> {
        self.state.lock().await.in_flight.remove(key);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.lock().await.pending.len())
    }

    async fn wait_for_work(&self, poll: Duration) {
        tokio::select! {
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Keeps every event it is sent.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<MergeEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<MergeEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: MergeEvent) {
        self.events.lock().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommitStatusState, MergeStyle};
    use chrono::Utc;

    #[tokio::test]
    async fn test_queue_dedups_pending_keys() {
        let queue = MemoryUniqueQueue::new();
        assert!(queue.push("1_a").await.unwrap());
        assert!(!queue.push("1_a").await.unwrap());
        assert!(queue.push("2_b").await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 2);

        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("1_a"));
        assert_eq!(queue.in_flight().await, 1);

        // In flight keys can be queued again.
        assert!(queue.push("1_a").await.unwrap());
        queue.ack("1_a").await.unwrap();
        assert_eq!(queue.in_flight().await, 0);
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("2_b"));
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("1_a"));
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_push_wakes_waiter() {
        let queue = std::sync::Arc::new(MemoryUniqueQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_for_work(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        queue.push("3_c").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_schedule_store_rejects_duplicates() {
        let store = MemoryScheduleStore::new();
        let schedule = ScheduledAutoMerge {
            pull_id: 1,
            doer: User {
                id: 1,
                name: "alice".into(),
                email: "alice@example.com".into(),
            },
            style: MergeStyle::Merge,
            message: String::new(),
            created_at: Utc::now(),
        };
        assert!(store.insert(schedule.clone()).await.unwrap());
        assert!(!store.insert(schedule).await.unwrap());
        assert!(store.delete(1).await.unwrap());
        assert!(!store.delete(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_policy_replaces_status_per_context() {
        let policy = MemoryPolicy::new();
        let status = |state| CommitStatus {
            context: "ci".into(),
            state,
        };
        policy.set_status(1, "abc", status(CommitStatusState::Pending)).await;
        policy.set_status(1, "abc", status(CommitStatusState::Success)).await;

        let statuses = policy.commit_statuses(1, "abc").await.unwrap();
        assert_eq!(statuses, vec![status(CommitStatusState::Success)]);
        assert!(policy.commit_statuses(2, "abc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lfs_store_registration_is_idempotent() {
        let store = MemoryLfsMetaStore::new();
        let meta = LfsMetaObject {
            oid: "a".repeat(64),
            size: 12,
            repository_id: 3,
        };
        store.new_meta_object(meta.clone()).await.unwrap();
        store.new_meta_object(meta.clone()).await.unwrap();
        assert_eq!(store.objects(3).await, vec![meta]);
    }
}
