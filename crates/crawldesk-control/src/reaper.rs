use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;

/// Periodically applies queued job completions to every session's table.
#[derive(Clone)]
pub struct CompletionReaper {
    registry: SessionRegistry,
    interval: Duration,
}

impl CompletionReaper {
    pub fn new(registry: SessionRegistry, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// One pass over all sessions. Never waits on an empty queue.
    pub async fn sweep(&self) -> usize {
        let mut reaped = 0;
        for session in self.registry.sessions().await {
            reaped += session.drain_completions().await;
        }
        if reaped > 0 {
            tracing::debug!(reaped, "completion sweep");
        }
        reaped
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.sweep().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
            tracing::debug!("completion reaper stopped");
        })
    }
}
