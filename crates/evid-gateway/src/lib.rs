//! HTTP surface for the refresh engine.
//!
//! Thin translation layer: handlers parse requests, call
//! [`RefreshService`], and map domain errors to structured JSON error
//! envelopes. No orchestration logic lives here.

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use evid_pipeline::ResolutionError;
use evid_refresh::{RefreshError, RefreshService};
use evid_store::FeedbackVote;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Error payload mapped to a JSON error envelope.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    suggestions: Vec<String>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            suggestions: Vec::new(),
        }
    }

    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    fn unresolved(message: impl Into<String>, suggestions: Vec<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            code: "condition_unresolved",
            message: message.into(),
            suggestions,
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "resolver_unavailable",
            message,
        )
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            message,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if !self.suggestions.is_empty() {
            error["suggestions"] = json!(self.suggestions);
        }
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Resolution(ResolutionError::Unresolved {
                normalized_condition,
                suggestions,
            }) => ApiError::unresolved(
                format!("no MeSH terms matched '{normalized_condition}'"),
                suggestions,
            ),
            RefreshError::Resolution(ResolutionError::Unavailable { reason }) => {
                ApiError::unavailable(reason)
            }
            RefreshError::Store(err) => {
                tracing::error!(error = %err, "store operation failed");
                ApiError::internal("storage backend failure")
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    condition: String,
}

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    vote: FeedbackVote,
}

/// Builds the API router around a shared [`RefreshService`].
pub fn build_router(service: Arc<RefreshService>) -> Router {
    Router::new()
        .route("/api/claims/resolve", post(handle_resolve))
        .route("/api/claims/refresh/{key}", get(handle_refresh_status))
        .route("/api/claims/{reference}", get(handle_get_claim_set))
        .route("/api/claims/feedback/{group_id}", post(handle_feedback))
        .route("/api/health", get(handle_health))
        .with_state(service)
}

/// Binds and serves the API until ctrl-c.
pub async fn serve(addr: SocketAddr, service: Arc<RefreshService>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind api server on {addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound api server address")?;
    tracing::info!(addr = %local_addr, "api server listening");

    let app = build_router(service);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("api server exited unexpectedly")
}

async fn handle_health() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

async fn handle_resolve(
    State(service): State<Arc<RefreshService>>,
    Json(request): Json<ResolveRequest>,
) -> Response {
    if request.condition.trim().is_empty() {
        return ApiError::bad_request("empty_condition", "condition must not be blank")
            .into_response();
    }

    match service.resolve(&request.condition).await {
        Ok(outcome) => {
            let mut body = match serde_json::to_value(&outcome) {
                Ok(body) => body,
                Err(error) => {
                    return ApiError::internal(format!("response encoding failed: {error}"))
                        .into_response();
                }
            };
            if outcome.job.is_some() {
                body["refresh_url"] =
                    json!(format!("/api/claims/refresh/{}", outcome.key.as_str()));
            }
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn handle_refresh_status(
    State(service): State<Arc<RefreshService>>,
    Path(key): Path<String>,
) -> Response {
    match service.job_status(&key).await {
        Ok(Some(view)) => (StatusCode::OK, Json(view)).into_response(),
        Ok(None) => ApiError::not_found(
            "unknown_key",
            format!("no refresh has ever been requested for '{key}'"),
        )
        .into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn handle_get_claim_set(
    State(service): State<Arc<RefreshService>>,
    Path(reference): Path<String>,
) -> Response {
    match service.get_claim_set(&reference).await {
        Ok(Some(claim_set)) => (StatusCode::OK, Json(claim_set)).into_response(),
        Ok(None) => ApiError::not_found(
            "unknown_claim_set",
            format!("no claim set matches '{reference}'"),
        )
        .into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn handle_feedback(
    State(service): State<Arc<RefreshService>>,
    Path(group_id): Path<String>,
    Json(request): Json<FeedbackRequest>,
) -> Response {
    if !group_id.starts_with("grp-") {
        return ApiError::bad_request(
            "invalid_group_id",
            format!("'{group_id}' is not a claim group id"),
        )
        .into_response();
    }

    match service.record_feedback(&group_id, request.vote).await {
        Ok(aggregate) => (
            StatusCode::OK,
            Json(json!({
                "claim_group_id": group_id,
                "up": aggregate.up,
                "down": aggregate.down,
            })),
        )
            .into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}
