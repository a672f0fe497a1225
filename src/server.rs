//! Inbound HTTP API used by other networks.
use crate::distributor::Distributor;
use crate::error::SyncError;
use crate::remote::{RemoteDistribution, StatusReport};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct ApiState {
    pub distributor: Arc<Distributor>,
    /// Bearer token inbound calls must present.
    pub token: Option<String>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/contentsync/v1/distribute", post(distribute_handler))
        .route("/contentsync/v1/items/:id/status", post(item_status_handler))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

pub async fn serve(bind: SocketAddr, state: Arc<ApiState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "inbound API listening");
    axum::serve(listener, router(state).into_make_service()).await?;
    Ok(())
}

async fn distribute_handler(
    State(state): State<Arc<ApiState>>,
    Json(payload): Json<RemoteDistribution>,
) -> Response {
    let origin = payload.origin.clone();
    match state.distributor.receive_remote_distribution(payload).await {
        Ok(items) => {
            info!(%origin, items = items.len(), "remote distribution accepted");
            Json(json!({ "status": "started", "items": items })).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn item_status_handler(
    State(state): State<Arc<ApiState>>,
    Path(item_id): Path<i64>,
    Json(report): Json<StatusReport>,
) -> Response {
    match state.distributor.queue_status_report(item_id, &report).await {
        Ok(task_id) => (StatusCode::ACCEPTED, Json(json!({ "status": "queued", "task": task_id }))).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: anyhow::Error) -> Response {
    let status = match err.downcast_ref::<SyncError>() {
        Some(SyncError::Validation(_)) | Some(SyncError::PostNotFound(_)) => StatusCode::BAD_REQUEST,
        Some(SyncError::ItemNotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(?err, "inbound request failed");
    } else {
        warn!(error = %err, "inbound request rejected");
    }
    (status, Json(json!({ "error": format!("{err:#}") }))).into_response()
}

async fn auth_middleware(
    State(state): State<Arc<ApiState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.token.as_deref() else {
        return next.run(request).await;
    };
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);
    if provided == Some(expected) {
        return next.run(request).await;
    }
    warn!(uri = %request.uri(), "unauthorized inbound request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, r#"Bearer realm="contentsync""#)],
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

fn bearer_token(value: &str) -> Option<&str> {
    value.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_tokens() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }

    #[test]
    fn validation_errors_are_client_errors() {
        let response = error_response(SyncError::Validation("no blogs".into()).into());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = error_response(SyncError::ItemNotFound(4).into());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = error_response(anyhow::anyhow!("database gone"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
