use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Work queue whose keys are unique while queued.
///
/// Pushing a key that is already waiting is a no-op. Delivery is at least
/// once: a popped key stays in flight until acknowledged, and durable
/// implementations hand unacknowledged keys out again after a restart.
#[async_trait]
pub trait UniqueQueue: Send + Sync {
    /// Returns `false` when an equal key was already waiting.
    async fn push(&self, key: &str) -> Result<bool>;

    /// Next waiting key, if any.
    async fn pop(&self) -> Result<Option<String>>;

    async fn ack(&self, key: &str) -> Result<()>;

    /// Keys waiting to be popped.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Resolves when work may be available. Queues without a wake-up
    /// signal just wait for `poll`.
    async fn wait_for_work(&self, poll: Duration) {
        tokio::time::sleep(poll).await;
    }
}
