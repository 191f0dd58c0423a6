use std::sync::Arc;

use crawldesk_job::{JobConfig, JobId, JobKey, TenantId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    artifacts::{ArtifactLayout, write_job_config},
    error::LaunchError,
    worker::{WorkerSpawner, WorkerSpec},
};

/// Published by a job's waiter when its worker is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub key: JobKey,
    pub job_id: JobId,
}

pub type CompletionSender = mpsc::UnboundedSender<JobCompletion>;

pub struct LaunchRequest {
    pub tenant: TenantId,
    pub key: JobKey,
    pub job_id: JobId,
    pub config: JobConfig,
    pub cancel: CancellationToken,
    pub completions: CompletionSender,
}

/// Sends the completion when dropped unless already sent. Every exit path of a
/// launch, including early errors and panics in the waiter, goes through here.
struct CompletionGuard {
    tx: CompletionSender,
    completion: Option<JobCompletion>,
}

impl CompletionGuard {
    fn new(tx: CompletionSender, completion: JobCompletion) -> Self {
        Self {
            tx,
            completion: Some(completion),
        }
    }

    fn publish(&mut self) {
        if let Some(c) = self.completion.take() {
            if self.tx.send(c).is_err() {
                tracing::debug!("session dropped before job completion was delivered");
            }
        }
    }

    fn complete(mut self) {
        self.publish();
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.publish();
    }
}

#[derive(Clone)]
pub struct JobLauncher {
    layout: ArtifactLayout,
    spawner: Arc<dyn WorkerSpawner>,
}

impl JobLauncher {
    pub fn new(layout: ArtifactLayout, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self { layout, spawner }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Writes the config artifact, starts the worker and detaches a waiter.
    ///
    /// Exactly one [`JobCompletion`] is published per call, whether the launch
    /// fails here or the worker exits later.
    pub async fn launch(&self, req: LaunchRequest) -> Result<(), LaunchError> {
        let LaunchRequest {
            tenant,
            key,
            job_id,
            config,
            cancel,
            completions,
        } = req;
        let guard = CompletionGuard::new(
            completions,
            JobCompletion {
                key: key.clone(),
                job_id,
            },
        );

        let config_path = self.layout.job_config(&tenant, job_id);
        if let Err(source) = write_job_config(&config_path, &config).await {
            tracing::warn!(tenant = %tenant, job = %key, error = %source, "write job config failed");
            return Err(LaunchError::WriteArtifact {
                path: config_path,
                source,
            });
        }

        let spec = WorkerSpec {
            tenant: tenant.clone(),
            key: key.clone(),
            job_id,
            config_path: config_path.clone(),
            log_path: self.layout.job_log(&tenant, job_id),
        };
        let worker = match self.spawner.spawn(spec, cancel).await {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(tenant = %tenant, job = %key, error = %e, "crawl worker failed to start");
                let _ = tokio::fs::remove_file(&config_path).await;
                return Err(e);
            }
        };
        tracing::info!(tenant = %tenant, job = %key, job_id = %job_id, pid = ?worker.pid, "crawl worker started");

        tokio::spawn(async move {
            let exit = worker.wait().await;
            if exit.cancelled {
                tracing::info!(tenant = %tenant, job = %key, code = ?exit.code, "crawl worker stopped");
            } else if exit.success() {
                tracing::info!(tenant = %tenant, job = %key, "crawl worker finished");
            } else {
                tracing::warn!(
                    tenant = %tenant,
                    job = %key,
                    code = ?exit.code,
                    error = exit.error.as_deref().unwrap_or(""),
                    "crawl worker exited abnormally"
                );
            }
            if let Err(e) = tokio::fs::remove_file(&config_path).await {
                tracing::debug!(path = %config_path.display(), error = %e, "job config already gone");
            }
            guard.complete();
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::worker::fake::{Behavior, FakeSpawner};

    fn request(tx: CompletionSender) -> (LaunchRequest, JobId) {
        let job_id = JobId::new();
        let req = LaunchRequest {
            tenant: TenantId::parse("t-1").unwrap(),
            key: JobKey::normalize("https://www.example.com"),
            job_id,
            config: JobConfig {
                starting_url: "https://www.example.com".to_string(),
                ..JobConfig::default()
            },
            cancel: CancellationToken::new(),
            completions: tx,
        };
        (req, job_id)
    }

    #[tokio::test]
    async fn finished_worker_publishes_once_and_cleans_config() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = FakeSpawner::new(Behavior::Immediate);
        let launcher = JobLauncher::new(ArtifactLayout::new(dir.path()), Arc::new(spawner.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (req, job_id) = request(tx);

        launcher.launch(req).await.unwrap();

        let done = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.job_id, job_id);
        assert!(rx.try_recv().is_err());

        let cfg = spawner.specs.lock().unwrap()[0].config_path.clone();
        assert!(!cfg.exists());
    }

    #[tokio::test]
    async fn spawn_failure_still_publishes_completion() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = JobLauncher::new(
            ArtifactLayout::new(dir.path()),
            Arc::new(FakeSpawner::new(Behavior::Fail)),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (req, job_id) = request(tx);

        let err = launcher.launch(req).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert_eq!(rx.try_recv().unwrap().job_id, job_id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unwritable_config_dir_is_a_write_error() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the data root should be makes every artifact path unwritable.
        let root = dir.path().join("root");
        tokio::fs::write(&root, b"x").await.unwrap();
        let launcher = JobLauncher::new(
            ArtifactLayout::new(&root),
            Arc::new(FakeSpawner::new(Behavior::Immediate)),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (req, _) = request(tx);

        let err = launcher.launch(req).await.unwrap_err();
        assert!(matches!(err, LaunchError::WriteArtifact { .. }));
        assert!(rx.try_recv().is_ok());
    }
}
