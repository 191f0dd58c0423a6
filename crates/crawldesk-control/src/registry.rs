use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use crawldesk_job::TenantId;
use tokio::sync::RwLock;

use crate::{launcher::JobLauncher, result_store::ResultStore, session::CrawlSession};

/// Process-wide tenant → session map. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<TenantId, Arc<CrawlSession>>>>,
    launcher: JobLauncher,
    max_active: usize,
}

impl SessionRegistry {
    pub fn new(launcher: JobLauncher, max_active: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            launcher,
            max_active,
        }
    }

    /// Returns the tenant's session, creating it on first use. Concurrent
    /// callers for a fresh tenant all receive the same instance.
    pub async fn resolve(&self, tenant: &TenantId) -> Arc<CrawlSession> {
        if let Some(s) = self.inner.read().await.get(tenant).cloned() {
            s.touch();
            return s;
        }

        let mut map = self.inner.write().await;
        if let Some(s) = map.get(tenant).cloned() {
            s.touch();
            return s;
        }
        let store = ResultStore::new(self.launcher.layout().result_store(tenant));
        let session = Arc::new(CrawlSession::new(
            tenant.clone(),
            self.max_active,
            store,
            self.launcher.clone(),
        ));
        map.insert(tenant.clone(), session.clone());
        tracing::info!(tenant = %tenant, sessions = map.len(), "crawl session created");
        session
    }

    pub async fn get(&self, tenant: &TenantId) -> Option<Arc<CrawlSession>> {
        self.inner.read().await.get(tenant).cloned()
    }

    pub async fn evict(&self, tenant: &TenantId) -> Option<Arc<CrawlSession>> {
        let removed = self.inner.write().await.remove(tenant);
        if removed.is_some() {
            tracing::info!(tenant = %tenant, "crawl session evicted");
        }
        removed
    }

    /// Evicts the session only if it has been idle since `cutoff` and has no
    /// active jobs. The job table is inspected without the registry lock; the
    /// removal re-checks that the same session is still registered and was
    /// not touched in between.
    pub async fn evict_if_idle(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> bool {
        let Some(candidate) = self.get(tenant).await else {
            return false;
        };
        if candidate.updated_at() > cutoff || candidate.active_count().await > 0 {
            return false;
        }

        let mut map = self.inner.write().await;
        match map.get(tenant) {
            Some(current) if Arc::ptr_eq(current, &candidate) => {}
            _ => return false,
        }
        // Every resolve touches the session, so a caller that picked it up
        // since the check above shows up here.
        if candidate.updated_at() > cutoff {
            return false;
        }
        map.remove(tenant);
        tracing::info!(tenant = %tenant, "idle crawl session evicted");
        true
    }

    pub async fn tenants(&self) -> BTreeSet<TenantId> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn sessions(&self) -> Vec<Arc<CrawlSession>> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Signals every job of every session. Used on shutdown.
    pub async fn cancel_all_jobs(&self) -> usize {
        let mut n = 0;
        for session in self.sessions().await {
            n += session.cancel_all().await;
        }
        n
    }
}
