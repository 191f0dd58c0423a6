use std::{collections::BTreeSet, sync::Arc, time::Duration};

use crawldesk_db::{
    entities::auth,
    sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QuerySelect},
};
use crawldesk_job::TenantId;

#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("liveness query failed: {0}")]
    Query(#[from] DbErr),
}

/// Answers which tenants must be treated as alive regardless of in-memory state.
#[async_trait::async_trait]
pub trait LivenessSource: Send + Sync + 'static {
    async fn recently_active(&self) -> Result<BTreeSet<TenantId>, LivenessError>;
}

/// Tenants whose `auth` row was refreshed within `window`.
#[derive(Clone)]
pub struct AuthActivity {
    db: Arc<DatabaseConnection>,
    window: Duration,
}

impl AuthActivity {
    pub fn new(db: Arc<DatabaseConnection>, window: Duration) -> Self {
        Self { db, window }
    }
}

#[async_trait::async_trait]
impl LivenessSource for AuthActivity {
    async fn recently_active(&self) -> Result<BTreeSet<TenantId>, LivenessError> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::hours(72));
        let cutoff = chrono::Utc::now() - window;

        let ids: Vec<String> = auth::Entity::find()
            .select_only()
            .column(auth::Column::UserId)
            .filter(auth::Column::UpdatedAt.gt(cutoff))
            .into_tuple()
            .all(&*self.db)
            .await?;

        Ok(ids
            .into_iter()
            .filter_map(|id| match TenantId::parse(&id) {
                Ok(t) => Some(t),
                Err(e) => {
                    tracing::warn!(user_id = %id, error = %e, "auth row has unusable tenant id");
                    None
                }
            })
            .collect())
    }
}

/// Fixed liveness set.
#[derive(Debug, Clone, Default)]
pub struct StaticLiveness(pub BTreeSet<TenantId>);

#[async_trait::async_trait]
impl LivenessSource for StaticLiveness {
    async fn recently_active(&self) -> Result<BTreeSet<TenantId>, LivenessError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sea_orm::{DatabaseBackend, MockDatabase, Value};

    use super::*;

    fn row(user_id: &str) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([("user_id", Value::from(user_id.to_string()))])
    }

    #[tokio::test]
    async fn auth_activity_maps_rows_and_skips_bad_ids() {
        let rows = vec![row("t-1"), row("bad/id")];
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([rows])
            .into_connection();
        let src = AuthActivity::new(Arc::new(db), Duration::from_secs(3600));

        let live = src.recently_active().await.unwrap();
        assert_eq!(live.into_iter().collect::<Vec<_>>(), vec![TenantId::parse("t-1").unwrap()]);
    }

    #[tokio::test]
    async fn query_failure_surfaces_as_error() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_errors([DbErr::Custom("down".into())])
            .into_connection();
        let src = AuthActivity::new(Arc::new(db), Duration::from_secs(3600));
        assert!(src.recently_active().await.is_err());
    }
}
