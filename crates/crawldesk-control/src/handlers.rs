use std::{collections::HashMap, path::Path};

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use crawldesk_job::{ActiveJob, JobConfig, JobKey};
use rand::seq::SliceRandom;
use tokio_util::io::ReaderStream;

use crate::{
    error::{ApiError, SessionError},
    identity::Tenant,
    result_store::FileCategory,
    security,
    state::AppState,
};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/crawl", post(start_crawl))
        .route("/crawl-random", post(start_random_crawl))
        .route("/kill-crawler", post(kill_crawler))
        .route("/kill-all-crawlers", post(kill_all_crawlers))
        .route("/active-crawlers", get(active_crawlers))
        .route("/recent-urls", get(recent_urls))
        .route("/files", get(files))
        .route("/export", get(export))
        .route("/gen-network", post(gen_network))
        .route("/network", get(network))
        .layer(middleware::from_fn(security::origin_guard))
        .with_state(state)
}

#[derive(Debug, serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    sessions: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.registry.len().await,
    })
}

#[derive(Debug, serde::Serialize)]
struct StartedResponse {
    message: String,
    job: ActiveJob,
}

#[derive(Debug, serde::Serialize)]
struct ActiveCrawlers {
    crawlers: Vec<ActiveJob>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "snake_case")]
enum NoticeLevel {
    Success,
    Notice,
}

#[derive(Debug, serde::Serialize)]
struct Notice {
    level: NoticeLevel,
    message: String,
}

async fn start(state: &AppState, tenant: Tenant, form: &HashMap<String, String>) -> Result<Response, ApiError> {
    let config = JobConfig::from_form(form).map_err(SessionError::from)?;
    let session = state.registry.resolve(&tenant.0).await;
    let job = session.start_job(config).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartedResponse {
            message: format!("Crawl started: {}", job.key),
            job,
        }),
    )
        .into_response())
}

async fn start_crawl(
    State(state): State<AppState>,
    tenant: Tenant,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    start(&state, tenant, &form).await
}

async fn start_random_crawl(
    State(state): State<AppState>,
    tenant: Tenant,
    Form(mut form): Form<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let url = pick_seed_site(&state.settings.seed_sites).await?;
    form.insert("StartingURL".to_string(), url);
    start(&state, tenant, &form).await
}

async fn pick_seed_site(path: &Path) -> Result<String, ApiError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "seed sites unreadable");
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "no_seed_sites", "Error selecting starting url")
    })?;
    let urls: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    urls.choose(&mut rand::thread_rng())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "no_seed_sites", "Failed to randomly select url")
        })
}

#[derive(Debug, serde::Deserialize)]
struct KillForm {
    url: String,
}

async fn kill_crawler(
    State(state): State<AppState>,
    tenant: Tenant,
    Form(form): Form<KillForm>,
) -> Result<Json<ActiveCrawlers>, ApiError> {
    let session = state.registry.resolve(&tenant.0).await;
    session.cancel_job(&JobKey::normalize(&form.url)).await?;
    Ok(Json(ActiveCrawlers {
        crawlers: session.active_jobs().await,
    }))
}

async fn kill_all_crawlers(State(state): State<AppState>, tenant: Tenant) -> Json<Notice> {
    let session = state.registry.resolve(&tenant.0).await;
    let notice = match session.cancel_all().await {
        0 => Notice {
            level: NoticeLevel::Notice,
            message: "No active crawlers to kill".to_string(),
        },
        1 => Notice {
            level: NoticeLevel::Success,
            message: "1 crawler killed".to_string(),
        },
        n => Notice {
            level: NoticeLevel::Success,
            message: format!("{n} crawlers killed"),
        },
    };
    Json(notice)
}

async fn active_crawlers(State(state): State<AppState>, tenant: Tenant) -> Json<ActiveCrawlers> {
    let session = state.registry.resolve(&tenant.0).await;
    Json(ActiveCrawlers {
        crawlers: session.active_jobs().await,
    })
}

async fn recent_urls(State(state): State<AppState>, tenant: Tenant) -> Result<Response, ApiError> {
    let session = state.registry.resolve(&tenant.0).await;
    let rows = session.store().recent_visited().await?;
    Ok(Json(rows).into_response())
}

#[derive(Debug, serde::Deserialize)]
struct FilesQuery {
    #[serde(rename = "type")]
    file_type: String,
}

async fn files(
    State(state): State<AppState>,
    tenant: Tenant,
    Query(q): Query<FilesQuery>,
) -> Result<Response, ApiError> {
    let category: FileCategory = q.file_type.parse()?;
    let session = state.registry.resolve(&tenant.0).await;
    let files = session.store().files_by_category(category).await?;
    Ok(Json(files).into_response())
}

/// Streams a file from disk. `Ok(None)` when it does not exist.
async fn stream_file(path: &Path, content_type: &'static str) -> std::io::Result<Option<Response>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await.ok().map(|m| m.len());

    let mut resp = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Some(len) = len {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    Ok(Some(resp))
}

async fn export(State(state): State<AppState>, tenant: Tenant) -> Result<Response, ApiError> {
    let session = state.registry.resolve(&tenant.0).await;
    let path = session.store().path();
    let mut resp = match stream_file(path, "application/octet-stream").await {
        Ok(Some(resp)) => resp,
        Ok(None) => {
            return Err(ApiError::new(StatusCode::NOT_FOUND, "not_found", "Results DB not found"));
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "result store export failed");
            return Err(ApiError::internal("result store export failed"));
        }
    };
    resp.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static("attachment; filename=results.db"),
    );
    Ok(resp)
}

#[derive(Debug, serde::Deserialize)]
struct GraphForm {
    checked: Option<String>,
}

async fn gen_network(
    State(state): State<AppState>,
    tenant: Tenant,
    Form(form): Form<GraphForm>,
) -> Result<Json<Notice>, ApiError> {
    state.registry.resolve(&tenant.0).await;
    let physics = form.checked.as_deref() == Some("true");
    state.graph.generate(&tenant.0, physics).await?;
    Ok(Json(Notice {
        level: NoticeLevel::Success,
        message: "Network graph generated".to_string(),
    }))
}

/// Serves the tenant's network graph, rendering it first if there is none.
async fn network(State(state): State<AppState>, tenant: Tenant) -> Result<Response, ApiError> {
    state.registry.resolve(&tenant.0).await;
    let path = state.graph.graph_path(&tenant.0);
    let unreadable = |e: std::io::Error| {
        tracing::warn!(path = %path.display(), error = %e, "network graph unreadable");
        ApiError::internal("network graph unreadable")
    };

    if let Some(resp) = stream_file(&path, "text/html; charset=utf-8").await.map_err(unreadable)? {
        return Ok(resp);
    }
    let path = state.graph.generate(&tenant.0, false).await?;
    stream_file(&path, "text/html; charset=utf-8")
        .await
        .map_err(unreadable)?
        .ok_or_else(|| ApiError::internal("network graph vanished after generation"))
}
