use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::extract::cookie::CookieJar;
use crawldesk_db::{
    entities::auth,
    sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait, QueryFilter},
};
use crawldesk_job::TenantId;

use crate::{
    error::{ApiError, SessionError},
    state::AppState,
};

pub const TENANT_COOKIE: &str = "uuid";
pub const SESSION_COOKIE: &str = "session_token";

/// Confirms that a tenant id and session token belong together.
#[async_trait::async_trait]
pub trait IdentityCheck: Send + Sync + 'static {
    async fn confirm(&self, tenant: &TenantId, session_token: &str) -> Result<bool, DbErr>;
}

#[derive(Clone)]
pub struct AuthTable {
    db: Arc<DatabaseConnection>,
}

impl AuthTable {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl IdentityCheck for AuthTable {
    async fn confirm(&self, tenant: &TenantId, session_token: &str) -> Result<bool, DbErr> {
        let n = auth::Entity::find()
            .filter(auth::Column::UserId.eq(tenant.as_str()))
            .filter(auth::Column::SessionToken.eq(session_token))
            .count(&*self.db)
            .await?;
        Ok(n > 0)
    }
}

/// The confirmed tenant behind a request.
#[derive(Debug, Clone)]
pub struct Tenant(pub TenantId);

#[axum::async_trait]
impl FromRequestParts<AppState> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let tenant = jar
            .get(TENANT_COOKIE)
            .and_then(|c| TenantId::parse(c.value()).ok())
            .ok_or(SessionError::IdentityMissing)?;
        let token = jar
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(SessionError::IdentityMissing)?;

        match state.identity.confirm(&tenant, &token).await {
            Ok(true) => Ok(Tenant(tenant)),
            Ok(false) => {
                tracing::debug!(tenant = %tenant, "session token rejected");
                Err(SessionError::IdentityMissing.into())
            }
            Err(e) => {
                tracing::warn!(tenant = %tenant, error = %e, "identity lookup failed");
                Err(ApiError::internal("identity lookup failed"))
            }
        }
    }
}
