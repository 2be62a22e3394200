//! Admin HTTP surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::{Control, StatusReport, SystemConfig};

#[derive(Debug, Default, Deserialize)]
struct CheckpointRequest {
    #[serde(default)]
    checkpoint_id: String,
}

#[derive(Debug, Serialize)]
struct ConfigureResponse {
    status: &'static str,
    stacks: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CheckpointResponse {
    status: &'static str,
    checkpoint_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
struct ReleaseResponse {
    status: &'static str,
    component: String,
}

/// Builds the admin router. Host, token and conflict checks run ahead of
/// routing, so a rejected request never reaches method dispatch.
pub fn router(control: Arc<Control>) -> Router {
    Router::new()
        .route("/", get(status).post(configure))
        .route("/status", get(status))
        .route("/checkpoint", post(checkpoint))
        .route("/restore", post(restore))
        .route("/release-lease", post(release_lease))
        .route("/stack/{name}/release", post(release_stack))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(middleware::from_fn_with_state(control.clone(), guard))
        .with_state(control)
}

async fn guard(State(control): State<Arc<Control>>, request: Request, next: Next) -> Response {
    let settings = control.settings();

    let host = request_host(&request);
    if !host.is_some_and(|h| h.eq_ignore_ascii_case(&settings.admin_host)) {
        tracing::debug!(host = ?host, "Rejected request for foreign host");
        return ApiError::not_found("not found").into_response();
    }
    if bearer_token(request.headers()) != Some(settings.token.as_str()) {
        return ApiError::unauthorized().into_response();
    }
    if let Some(reason) = control.conflict() {
        return ApiError::internal(format!("configuration conflict: {}", reason)).into_response();
    }

    next.run(request).await
}

/// Host the request was addressed to, without any port.
fn request_host(request: &Request) -> Option<&str> {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())?;
    Some(strip_port(raw))
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split_once(':').map_or(host, |(name, _)| name)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn parse_checkpoint_request(body: &Bytes) -> ApiResult<String> {
    let request: CheckpointRequest = if body.is_empty() {
        CheckpointRequest::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|e| ApiError::bad_request(format!("invalid request body: {}", e)))?
    };
    if request.checkpoint_id.trim().is_empty() {
        return Err(ApiError::bad_request("checkpoint_id is required"));
    }
    Ok(request.checkpoint_id)
}

async fn status(State(control): State<Arc<Control>>) -> Json<StatusReport> {
    Json(control.status())
}

async fn configure(
    State(control): State<Arc<Control>>,
    body: Bytes,
) -> ApiResult<Json<ConfigureResponse>> {
    let config: SystemConfig = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid configuration: {}", e)))?;
    let stacks = config.stacks.clone();

    control.configure(config).await?;
    Ok(Json(ConfigureResponse {
        status: "configured",
        stacks,
    }))
}

async fn checkpoint(
    State(control): State<Arc<Control>>,
    body: Bytes,
) -> ApiResult<Json<CheckpointResponse>> {
    let id = parse_checkpoint_request(&body)?;
    let results = control.create_checkpoint(&id).await?;
    Ok(Json(CheckpointResponse {
        status: "ok",
        checkpoint_id: id,
        results: Some(results),
    }))
}

async fn restore(
    State(control): State<Arc<Control>>,
    body: Bytes,
) -> ApiResult<Json<CheckpointResponse>> {
    let id = parse_checkpoint_request(&body)?;
    control.restore(&id).await?;
    Ok(Json(CheckpointResponse {
        status: "ok",
        checkpoint_id: id,
        results: None,
    }))
}

async fn release_lease(State(control): State<Arc<Control>>) -> ApiResult<Json<ReleaseResponse>> {
    let component = control.release_lease(None).await?;
    Ok(Json(ReleaseResponse {
        status: "released",
        component,
    }))
}

async fn release_stack(
    State(control): State<Arc<Control>>,
    Path(name): Path<String>,
) -> ApiResult<Json<ReleaseResponse>> {
    let component = control.release_lease(Some(&name)).await?;
    Ok(Json(ReleaseResponse {
        status: "released",
        component,
    }))
}

async fn not_found() -> ApiError {
    ApiError::not_found("not found")
}

async fn method_not_allowed() -> ApiError {
    ApiError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
}
