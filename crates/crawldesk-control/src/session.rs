use std::{collections::HashMap, sync::Mutex as StdMutex};

use chrono::{DateTime, Utc};
use crawldesk_job::{ActiveJob, JobConfig, JobId, JobKey, TenantId};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Admission, SessionError},
    launcher::{CompletionSender, JobCompletion, JobLauncher, LaunchRequest},
    result_store::ResultStore,
};

/// One running job as tracked by its session.
#[derive(Debug)]
pub struct JobHandle {
    key: JobKey,
    job_id: JobId,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

impl JobHandle {
    fn new(key: JobKey, job_id: JobId) -> Self {
        Self {
            key,
            job_id,
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn summary(&self) -> ActiveJob {
        ActiveJob {
            key: self.key.clone(),
            job_id: self.job_id,
            started_at: self.started_at,
            cancel_requested: self.is_cancelled(),
        }
    }
}

/// Per-tenant crawl state: the active-job table and its completion queue.
///
/// An entry stays in the table from admission until its worker's completion
/// has been drained, cancelled or not, so the table always reflects processes
/// that may still be running.
pub struct CrawlSession {
    tenant: TenantId,
    max_active: usize,
    jobs: RwLock<HashMap<JobKey, JobHandle>>,
    completions_tx: CompletionSender,
    completions_rx: Mutex<mpsc::UnboundedReceiver<JobCompletion>>,
    created_at: DateTime<Utc>,
    updated_at: StdMutex<DateTime<Utc>>,
    store: ResultStore,
    launcher: JobLauncher,
}

impl std::fmt::Debug for CrawlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlSession")
            .field("tenant", &self.tenant)
            .field("max_active", &self.max_active)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl CrawlSession {
    pub fn new(tenant: TenantId, max_active: usize, store: ResultStore, launcher: JobLauncher) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let now = Utc::now();
        Self {
            tenant,
            max_active,
            jobs: RwLock::new(HashMap::new()),
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
            created_at: now,
            updated_at: StdMutex::new(now),
            store,
            launcher,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        *self.updated_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn touch(&self) {
        *self.updated_at.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: chrono::Duration) {
        *self.updated_at.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now() - by;
    }

    #[cfg(test)]
    pub(crate) async fn lock_jobs(&self) -> tokio::sync::RwLockWriteGuard<'_, HashMap<JobKey, JobHandle>> {
        self.jobs.write().await
    }

    /// Admits and launches a job.
    ///
    /// The entry is reserved under the table lock before anything is written or
    /// spawned, so it is cancellable from the moment it exists. A launch
    /// failure leaves the entry in place until its completion is drained.
    pub async fn start_job(&self, mut config: JobConfig) -> Result<ActiveJob, SessionError> {
        let key = config.job_key()?;
        config.starting_url = key.to_string();
        config.sqlite_path = self.store.path().display().to_string();

        let (summary, cancel) = {
            let mut jobs = self.jobs.write().await;
            if jobs.len() >= self.max_active {
                return Err(Admission::TooManyActiveJobs {
                    cap: self.max_active,
                }
                .into());
            }
            if jobs.contains_key(&key) {
                return Err(Admission::DuplicateJob { key }.into());
            }
            let handle = JobHandle::new(key.clone(), JobId::new());
            let out = (handle.summary(), handle.cancel.clone());
            jobs.insert(key.clone(), handle);
            out
        };
        self.touch();
        tracing::info!(tenant = %self.tenant, job = %key, job_id = %summary.job_id, "crawl job admitted");

        self.launcher
            .launch(LaunchRequest {
                tenant: self.tenant.clone(),
                key: key.clone(),
                job_id: summary.job_id,
                config,
                cancel,
                completions: self.completions_tx.clone(),
            })
            .await
            .map_err(|source| SessionError::LaunchFailure { key, source })?;

        Ok(summary)
    }

    /// Signals cancellation. The entry is removed only once the worker's
    /// completion is drained.
    pub async fn cancel_job(&self, key: &JobKey) -> Result<(), SessionError> {
        let jobs = self.jobs.read().await;
        let Some(handle) = jobs.get(key) else {
            return Err(SessionError::JobNotFound { key: key.clone() });
        };
        handle.cancel();
        drop(jobs);
        self.touch();
        tracing::info!(tenant = %self.tenant, job = %key, "crawl job cancel requested");
        Ok(())
    }

    pub async fn cancel_all(&self) -> usize {
        let jobs = self.jobs.read().await;
        for handle in jobs.values() {
            handle.cancel();
        }
        let n = jobs.len();
        drop(jobs);
        if n > 0 {
            self.touch();
            tracing::info!(tenant = %self.tenant, count = n, "all crawl jobs cancel requested");
        }
        n
    }

    /// Sorted snapshot of active job keys.
    pub async fn list_active(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self.jobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn active_jobs(&self) -> Vec<ActiveJob> {
        let mut out: Vec<ActiveJob> = self.jobs.read().await.values().map(JobHandle::summary).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub async fn active_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Applies every completion queued so far without waiting for more.
    /// Returns how many table entries were removed.
    ///
    /// A completion whose job id no longer matches the entry under its key is
    /// stale and ignored.
    pub async fn drain_completions(&self) -> usize {
        let pending = {
            let Ok(mut rx) = self.completions_rx.try_lock() else {
                return 0;
            };
            let mut pending = Vec::new();
            while let Ok(c) = rx.try_recv() {
                pending.push(c);
            }
            pending
        };
        if pending.is_empty() {
            return 0;
        }

        let mut jobs = self.jobs.write().await;
        let mut removed = 0;
        for c in pending {
            if jobs.get(&c.key).is_some_and(|h| h.job_id == c.job_id) {
                jobs.remove(&c.key);
                removed += 1;
                tracing::debug!(tenant = %self.tenant, job = %c.key, "crawl job reaped");
            } else {
                tracing::debug!(tenant = %self.tenant, job = %c.key, "stale job completion ignored");
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        artifacts::ArtifactLayout,
        worker::fake::{Behavior, FakeSpawner},
    };

    fn session(dir: &std::path::Path, behavior: Behavior, cap: usize) -> (CrawlSession, FakeSpawner) {
        let spawner = FakeSpawner::new(behavior);
        let layout = ArtifactLayout::new(dir);
        let tenant = TenantId::parse("t-1").unwrap();
        let store = ResultStore::new(layout.result_store(&tenant));
        let launcher = JobLauncher::new(layout, Arc::new(spawner.clone()));
        (CrawlSession::new(tenant, cap, store, launcher), spawner)
    }

    fn config(url: &str) -> JobConfig {
        JobConfig {
            starting_url: url.to_string(),
            ..JobConfig::default()
        }
    }

    async fn drain_until_empty(s: &CrawlSession) {
        for _ in 0..100 {
            s.drain_completions().await;
            if s.active_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs never drained: {:?}", s.list_active().await);
    }

    #[tokio::test]
    async fn cap_rejects_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let (s, spawner) = session(dir.path(), Behavior::UntilCancelled, 2);

        s.start_job(config("https://www.a.com")).await.unwrap();
        s.start_job(config("https://www.b.com")).await.unwrap();
        let err = s.start_job(config("https://www.c.com")).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::AdmissionRejected(Admission::TooManyActiveJobs { cap: 2 })
        ));
        assert_eq!(spawner.spawned(), 2);
        assert_eq!(s.active_count().await, 2);
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = session(dir.path(), Behavior::UntilCancelled, 5);

        s.start_job(config("https://www.a.com")).await.unwrap();
        let err = s.start_job(config("HTTPS://WWW.A.COM/")).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::AdmissionRejected(Admission::DuplicateJob { .. })
        ));
        assert_eq!(s.active_count().await, 1);
    }

    #[tokio::test]
    async fn invalid_url_never_reserves_a_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (s, spawner) = session(dir.path(), Behavior::UntilCancelled, 5);

        let err = s.start_job(config("https://example.com")).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidJob(_)));
        assert_eq!(s.active_count().await, 0);
        assert_eq!(spawner.spawned(), 0);
    }

    #[tokio::test]
    async fn cancel_keeps_entry_until_completion_drains() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = session(dir.path(), Behavior::UntilCancelled, 5);
        let key = s.start_job(config("https://www.a.com")).await.unwrap().key;

        s.cancel_job(&key).await.unwrap();
        let jobs = s.active_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].cancel_requested);

        drain_until_empty(&s).await;
        assert!(s.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_unknown_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = session(dir.path(), Behavior::UntilCancelled, 5);
        s.start_job(config("https://www.a.com")).await.unwrap();

        let err = s
            .cancel_job(&JobKey::normalize("https://www.zzz.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::JobNotFound { .. }));
        assert!(!s.active_jobs().await[0].cancel_requested);
    }

    #[tokio::test]
    async fn launch_failure_is_reported_and_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = session(dir.path(), Behavior::Fail, 5);

        let err = s.start_job(config("https://www.a.com")).await.unwrap_err();
        assert!(matches!(err, SessionError::LaunchFailure { .. }));
        assert_eq!(s.drain_completions().await, 1);
        assert_eq!(s.active_count().await, 0);
    }

    #[tokio::test]
    async fn stale_completion_does_not_remove_relaunched_job() {
        let dir = tempfile::tempdir().unwrap();
        let (s, _) = session(dir.path(), Behavior::UntilCancelled, 5);
        let first = s.start_job(config("https://www.a.com")).await.unwrap();

        s.completions_tx
            .send(JobCompletion {
                key: first.key.clone(),
                job_id: JobId::new(),
            })
            .unwrap();
        assert_eq!(s.drain_completions().await, 0);
        assert_eq!(s.list_active().await, vec![first.key]);
    }

    #[tokio::test]
    async fn start_sets_result_store_path_in_config() {
        let dir = tempfile::tempdir().unwrap();
        let (s, spawner) = session(dir.path(), Behavior::UntilCancelled, 5);
        s.start_job(config("https://www.a.com")).await.unwrap();

        let cfg_path = spawner.specs.lock().unwrap()[0].config_path.clone();
        let raw = tokio::fs::read(&cfg_path).await.unwrap();
        let written: JobConfig = serde_json::from_slice(&raw).unwrap();
        assert_eq!(written.sqlite_path, s.store().path().display().to_string());
    }
}
