//! Content pipeline endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use crate::api::{
    bad_request, check_workflow_id, error_response, not_found, validation_message, ApiState,
    MAX_GITHUB_USERNAME_LENGTH, MAX_MODEL_NAME_LENGTH,
};
use crate::durable::RegistryError;

#[derive(Debug, Deserialize, Validate)]
pub struct GenerateRequest {
    #[validate(length(
        min = 1,
        max = MAX_GITHUB_USERNAME_LENGTH,
        message = "GitHub username must be 1-39 characters."
    ))]
    pub github_username: String,
    #[validate(length(max = MAX_MODEL_NAME_LENGTH, message = "Model name is too long."))]
    pub model_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub success: bool,
    pub workflow_id: String,
    pub run_id: String,
    pub status_url: String,
}

/// Start a content pipeline for one GitHub user.
pub async fn start_generation(
    State(state): State<ApiState>,
    Json(req): Json<GenerateRequest>,
) -> impl IntoResponse {
    if let Err(errors) = req.validate() {
        return bad_request(validation_message(&errors));
    }
    let username = req.github_username.trim();

    match state
        .app_state
        .start_pipeline(username, req.model_name.as_deref())
    {
        Ok(info) => {
            tracing::info!(workflow_id = %info.workflow_id, run_id = %info.run_id, "Content generation started");
            (
                StatusCode::OK,
                Json(GenerateResponse {
                    success: true,
                    status_url: format!("/workflow/{}/status", info.workflow_id),
                    workflow_id: info.workflow_id,
                    run_id: info.run_id,
                }),
            )
                .into_response()
        }
        Err(e @ RegistryError::AlreadyStarted(_)) => {
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Live status of a pipeline run.
pub async fn get_workflow_status(
    Path(workflow_id): Path<String>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    if let Err(response) = check_workflow_id(&workflow_id, "Invalid workflow ID.") {
        return response;
    }
    tracing::debug!(workflow_id = %workflow_id, "Checking status for workflow");

    match state.app_state.pipeline_status(&workflow_id) {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => not_found("Workflow not found"),
    }
}

/// Transcript of the profile agent behind a pipeline or agent routine.
pub async fn get_workflow_transcript(
    Path(workflow_id): Path<String>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    if let Err(response) = check_workflow_id(&workflow_id, "Invalid workflow ID.") {
        return response;
    }

    match state.app_state.transcript(&workflow_id) {
        Some(transcript) => (
            StatusCode::OK,
            Json(json!({
                "workflow_id": workflow_id,
                "transcript": transcript
            })),
        )
            .into_response(),
        None => not_found("Transcript not found"),
    }
}
