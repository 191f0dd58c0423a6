use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ApiError;

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn parse_allowed_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn allowed_origins() -> Vec<String> {
    // e.g. CRAWLDESK_ALLOWED_ORIGINS=https://crawl.example.com,http://localhost:8080
    let raw = std::env::var("CRAWLDESK_ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:8080,http://127.0.0.1:8080".to_string());
    parse_allowed_origins(&raw)
}

fn origin_is_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    // Missing Origin means a non-browser client.
    let origin = match headers.get(axum::http::header::ORIGIN) {
        Some(v) => match v.to_str() {
            Ok(s) => s,
            Err(_) => return false,
        },
        None => return true,
    };
    allowed.iter().any(|a| a == origin)
}

/// Rejects cross-origin browser requests that start or stop crawls.
pub async fn origin_guard(req: Request<Body>, next: Next) -> Response {
    if is_unsafe_method(req.method()) && !origin_is_allowed(req.headers(), &allowed_origins()) {
        tracing::debug!(method = %req.method(), uri = %req.uri(), "cross-origin request rejected");
        return ApiError::new(StatusCode::FORBIDDEN, "origin_not_allowed", "origin not allowed")
            .into_response();
    }
    next.run(req).await
}
