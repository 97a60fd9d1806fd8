//! HTTP API routes - JSON endpoints over the pipeline and poll routines.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

pub mod pipeline;
pub mod polls;

use crate::app_state::AppState;

pub const MAX_POLL_REQUEST_LENGTH: u64 = 2048;
pub const MAX_GITHUB_USERNAME_LENGTH: u64 = 39;
pub const MAX_MODEL_NAME_LENGTH: u64 = 100;
pub const MAX_WORKFLOW_ID_LENGTH: usize = 256;
pub const MAX_OPTION_LENGTH: usize = 100;

#[derive(Clone)]
pub struct ApiState {
    pub app_state: AppState,
}

/// Configure all API routes
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        // Content pipeline
        .route("/generate", post(pipeline::start_generation))
        .route("/workflow/{id}/status", get(pipeline::get_workflow_status))
        .route(
            "/workflow/{id}/transcript",
            get(pipeline::get_workflow_transcript),
        )
        // Polls
        .route("/polls", get(polls::list_polls))
        .route("/poll", post(polls::create_poll))
        .route(
            "/poll/{id}",
            get(polls::get_poll_details).delete(polls::delete_poll),
        )
        .route("/poll/{id}/vote", post(polls::vote_on_poll))
        .route("/poll/{id}/signal", post(polls::signal_poll))
        .route("/poll/{id}/votes/{option}", get(polls::get_poll_votes))
        .route("/poll/{id}/profile/{option}", get(polls::get_poll_profile))
}

/// Health check endpoint
pub async fn health_check(State(_state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "reportcard",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": message.into()
        })),
    )
        .into_response()
}

pub(crate) fn bad_request(message: impl Into<String>) -> Response {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub(crate) fn internal_error(message: impl Into<String>) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

pub(crate) fn not_found(message: impl Into<String>) -> Response {
    error_response(StatusCode::NOT_FOUND, message)
}

/// Reject path ids longer than the workflow id limit.
pub(crate) fn check_workflow_id(id: &str, message: &str) -> Result<(), Response> {
    if id.len() > MAX_WORKFLOW_ID_LENGTH {
        return Err(bad_request(message));
    }
    Ok(())
}

/// First validation failure as a readable line.
pub(crate) fn validation_message(errors: &validator::ValidationErrors) -> String {
    errors
        .field_errors()
        .into_iter()
        .next()
        .map(|(field, errs)| {
            errs.first()
                .and_then(|e| e.message.as_ref().map(|m| m.to_string()))
                .unwrap_or_else(|| format!("{field} is invalid"))
        })
        .unwrap_or_else(|| "invalid request".to_string())
}
