use std::{collections::BTreeSet, path::Path, sync::Arc, time::Duration};

use crawldesk_job::TenantId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    artifacts::{ArtifactLayout, tenant_of_artifact},
    liveness::{LivenessError, LivenessSource},
    registry::SessionRegistry,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleSweepReport {
    pub evicted_sessions: usize,
    pub removed_artifacts: usize,
    pub failed_removals: usize,
}

/// Evicts idle sessions and deletes on-disk artifacts of tenants that are
/// neither in memory nor reported live.
pub struct IdleSessionReaper {
    registry: SessionRegistry,
    liveness: Arc<dyn LivenessSource>,
    layout: ArtifactLayout,
    session_idle: Duration,
    interval: Duration,
}

impl IdleSessionReaper {
    pub fn new(
        registry: SessionRegistry,
        liveness: Arc<dyn LivenessSource>,
        layout: ArtifactLayout,
        session_idle: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            liveness,
            layout,
            session_idle,
            interval,
        }
    }

    /// One sweep. Nothing is evicted or deleted when liveness is unknown.
    pub async fn sweep(&self) -> Result<IdleSweepReport, LivenessError> {
        let recent = self.liveness.recently_active().await?;
        let mut report = IdleSweepReport::default();

        let idle = chrono::Duration::from_std(self.session_idle).unwrap_or(chrono::Duration::hours(1));
        let cutoff = chrono::Utc::now() - idle;
        for tenant in self.registry.tenants().await {
            if recent.contains(&tenant) {
                continue;
            }
            if self.registry.evict_if_idle(&tenant, cutoff).await {
                report.evicted_sessions += 1;
            }
        }

        let mut live = recent;
        live.extend(self.registry.tenants().await);

        for dir in self.layout.artifact_dirs() {
            self.prune_dir(&dir, &live, &mut report).await;
        }

        if report != IdleSweepReport::default() {
            tracing::info!(
                evicted = report.evicted_sessions,
                removed = report.removed_artifacts,
                failed = report.failed_removals,
                "idle session sweep"
            );
        }
        Ok(report)
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }
                if let Err(e) = self.sweep().await {
                    tracing::warn!(error = %e, "idle session sweep skipped");
                }
            }
            tracing::debug!("idle session reaper stopped");
        })
    }

    /// Deletes entries of `dir` owned by tenants outside `live`. A tenant that
    /// gained a session since `live` was taken keeps its files.
    async fn prune_dir(&self, dir: &Path, live: &BTreeSet<TenantId>, report: &mut IdleSweepReport) {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "artifact dir unreadable");
                return;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "artifact dir listing failed");
                    break;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Files that don't carry a well-formed tenant are not ours to delete.
            let Some(tenant) = tenant_of_artifact(name).and_then(|t| TenantId::parse(t).ok()) else {
                continue;
            };
            if live.contains(&tenant) {
                continue;
            }

            let path = entry.path();
            let is_dir = matches!(entry.file_type().await, Ok(ft) if ft.is_dir());
            if self.registry.get(&tenant).await.is_some() {
                continue;
            }
            let res = if is_dir {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match res {
                Ok(()) => {
                    report.removed_artifacts += 1;
                    tracing::debug!(tenant = %tenant, path = %path.display(), "stale artifact removed");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    report.failed_removals += 1;
                    tracing::warn!(tenant = %tenant, path = %path.display(), error = %e, "stale artifact removal failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        launcher::JobLauncher,
        liveness::StaticLiveness,
        worker::fake::{Behavior, FakeSpawner},
    };

    struct FailingLiveness;

    #[async_trait::async_trait]
    impl LivenessSource for FailingLiveness {
        async fn recently_active(&self) -> Result<BTreeSet<TenantId>, LivenessError> {
            Err(LivenessError::Query(sea_orm::DbErr::Custom("down".into())))
        }
    }

    fn tid(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    async fn touch(path: std::path::PathBuf) {
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, b"x").await.unwrap();
    }

    fn reaper(layout: &ArtifactLayout, live: Arc<dyn LivenessSource>) -> (IdleSessionReaper, SessionRegistry) {
        let launcher = JobLauncher::new(
            layout.clone(),
            Arc::new(FakeSpawner::new(Behavior::UntilCancelled)),
        );
        let registry = SessionRegistry::new(launcher, 5);
        let reaper = IdleSessionReaper::new(
            registry.clone(),
            live,
            layout.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        (reaper, registry)
    }

    #[tokio::test]
    async fn prunes_only_dead_tenants() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let live = StaticLiveness([tid("alive")].into_iter().collect());
        let (reaper, registry) = reaper(&layout, Arc::new(live));
        registry.resolve(&tid("in-memory")).await;

        for t in ["alive", "in-memory", "gone"] {
            touch(layout.result_store(&tid(t))).await;
            touch(layout.graph(&tid(t))).await;
        }
        touch(layout.logs_dir().join("gone__abc.log.1")).await;
        touch(layout.configs_dir().join(".keep")).await;

        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.removed_artifacts, 3);
        assert_eq!(report.failed_removals, 0);
        assert!(layout.result_store(&tid("alive")).exists());
        assert!(layout.graph(&tid("in-memory")).exists());
        assert!(!layout.result_store(&tid("gone")).exists());
        assert!(!layout.graph(&tid("gone")).exists());
        assert!(!layout.logs_dir().join("gone__abc.log.1").exists());
        assert!(layout.configs_dir().join(".keep").exists());
    }

    #[tokio::test]
    async fn liveness_failure_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let (reaper, _) = reaper(&layout, Arc::new(FailingLiveness));
        touch(layout.result_store(&tid("gone"))).await;

        assert!(reaper.sweep().await.is_err());
        assert!(layout.result_store(&tid("gone")).exists());
    }

    #[tokio::test]
    async fn idle_session_is_evicted_and_its_artifacts_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let (reaper, registry) = reaper(&layout, Arc::new(StaticLiveness::default()));
        let s = registry.resolve(&tid("idle")).await;
        touch(layout.result_store(&tid("idle"))).await;

        // Fresh session survives.
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.evicted_sessions, 0);
        assert!(layout.result_store(&tid("idle")).exists());

        s.backdate(chrono::Duration::hours(2));
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.evicted_sessions, 1);
        assert!(registry.is_empty().await);
        assert!(!layout.result_store(&tid("idle")).exists());
    }

    #[tokio::test]
    async fn missing_dirs_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path().join("never-created"));
        let (reaper, _) = reaper(&layout, Arc::new(StaticLiveness::default()));
        assert_eq!(reaper.sweep().await.unwrap(), IdleSweepReport::default());
    }

    #[tokio::test]
    async fn tenant_registered_after_snapshot_keeps_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let (reaper, registry) = reaper(&layout, Arc::new(StaticLiveness::default()));
        touch(layout.result_store(&tid("late"))).await;
        touch(layout.result_store(&tid("gone"))).await;

        // The live set was taken before "late" showed up.
        let stale_live = BTreeSet::new();
        registry.resolve(&tid("late")).await;

        let mut report = IdleSweepReport::default();
        reaper.prune_dir(&layout.results_dir(), &stale_live, &mut report).await;
        assert_eq!(report.removed_artifacts, 1);
        assert!(layout.result_store(&tid("late")).exists());
        assert!(!layout.result_store(&tid("gone")).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn job_started_mid_sweep_keeps_its_config() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let spawner = FakeSpawner::new(Behavior::UntilCancelled);
        let launcher = JobLauncher::new(layout.clone(), Arc::new(spawner.clone()));
        let registry = SessionRegistry::new(launcher, 5);
        let reaper = IdleSessionReaper::new(
            registry.clone(),
            Arc::new(StaticLiveness::default()),
            layout.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );

        // Enough stale files that the sweep is still running when the job starts.
        tokio::fs::create_dir_all(layout.results_dir()).await.unwrap();
        tokio::fs::create_dir_all(layout.configs_dir()).await.unwrap();
        for i in 0..3000 {
            tokio::fs::write(layout.results_dir().join(format!("stale{i}.db")), b"x")
                .await
                .unwrap();
        }

        let sweeping = tokio::spawn(async move { reaper.sweep().await });
        let session = registry.resolve(&tid("newcomer")).await;
        session
            .start_job(crawldesk_job::JobConfig {
                starting_url: "https://www.a.com".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let report = sweeping.await.unwrap().unwrap();

        assert_eq!(report.removed_artifacts, 3000);
        let config = spawner.specs.lock().unwrap()[0].config_path.clone();
        assert!(config.exists(), "config of a running job was pruned");
        assert_eq!(session.active_count().await, 1);
    }

    #[tokio::test]
    async fn spawned_reaper_prunes_on_its_interval_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let launcher = JobLauncher::new(
            layout.clone(),
            Arc::new(FakeSpawner::new(Behavior::UntilCancelled)),
        );
        let registry = SessionRegistry::new(launcher, 5);
        let reaper = IdleSessionReaper::new(
            registry,
            Arc::new(StaticLiveness::default()),
            layout.clone(),
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        let stale = layout.result_store(&tid("gone"));
        touch(stale.clone()).await;

        let shutdown = CancellationToken::new();
        let handle = reaper.spawn(shutdown.clone());
        for _ in 0..200 {
            if !stale.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!stale.exists());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("idle reaper did not stop")
            .unwrap();
    }
}
