use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Graceful shutdown coordinator for the merge engine
///
/// Owns the root cancellation token. Git subprocesses, LFS pipelines and
/// the auto-merge worker all watch children of it.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Initiating graceful shutdown");
        }
        self.token.cancel();
    }

    /// Cancel the root token on Ctrl-C
    pub fn install_signal_handlers(&self) -> Result<()> {
        info!("Installing signal handlers for graceful shutdown");
        let coordinator = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => coordinator.trigger(),
                Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
            }
        });
        Ok(())
    }

    /// Wait for the shutdown signal
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Let `task` finish within `grace` once shutdown was requested
    pub async fn drain<F>(&self, name: &str, grace: Duration, task: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        timeout(grace, task)
            .await
            .map_err(|_| anyhow::anyhow!("Timeout waiting for {name} to stop"))?;
        info!("{} stopped", name);
        Ok(())
    }
}
