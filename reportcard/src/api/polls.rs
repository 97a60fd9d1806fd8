//! Poll endpoints.
//!
//! Voters are identified by the `voter_id` cookie unless the request names one.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_types::{PollConfig, PollPhase, PollSignal, PollState, VoteUpdate};
use validator::Validate;

use crate::api::{
    bad_request, check_workflow_id, error_response, internal_error, not_found,
    validation_message, ApiState, MAX_OPTION_LENGTH, MAX_POLL_REQUEST_LENGTH,
};
use crate::app_state::AppError;
use crate::actors::poll::{PollError, PollHandle};

pub const POLL_ID_PREFIX: &str = "g2i-poll-";
pub const VOTER_COOKIE: &str = "voter_id";
/// USDC mint on Solana mainnet
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
const MAX_SANITIZED_ID_LENGTH: usize = 200;
const POLL_LIST_LIMIT: usize = 20;

static INVALID_ID_CHARS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_-]+").ok());

/// Lowercase id fragment made of `[a-z0-9_-]`, at most 200 characters.
pub fn sanitize_workflow_id(input: &str) -> String {
    let replaced = match INVALID_ID_CHARS.as_ref() {
        Some(re) => re.replace_all(input, "-").into_owned(),
        None => input
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
            .collect(),
    };
    let mut sanitized = replaced.trim_matches('-').to_lowercase();
    sanitized.truncate(MAX_SANITIZED_ID_LENGTH);
    sanitized
}

pub fn poll_workflow_id(question: &str) -> String {
    format!("{POLL_ID_PREFIX}{}", sanitize_workflow_id(question))
}

/// Solana Pay URI for the poll fee, memo set to the poll id.
pub fn payment_uri(wallet: &str, amount: f64, poll_id: &str) -> String {
    let memo: String = url::form_urlencoded::byte_serialize(poll_id.as_bytes()).collect();
    format!("solana:{wallet}?amount={amount}&spl-token={USDC_MINT}&memo={memo}")
}

fn poll_error_response(err: PollError) -> Response {
    let status = match &err {
        PollError::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
        PollError::Closed => StatusCode::CONFLICT,
        e if e.is_rejection() => StatusCode::BAD_REQUEST,
        PollError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

fn lookup_poll(state: &ApiState, poll_id: &str) -> Result<PollHandle, Response> {
    check_workflow_id(poll_id, "Invalid poll ID.")?;
    state
        .app_state
        .poll(poll_id)
        .ok_or_else(|| not_found("Poll not found"))
}

// ============================================================================
// Listing / creation
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PollListItem {
    pub workflow_id: String,
    pub run_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Most recent running polls.
pub async fn list_polls(State(state): State<ApiState>) -> impl IntoResponse {
    tracing::debug!("Listing polls");
    let polls: Vec<PollListItem> = state
        .app_state
        .list_polls(POLL_LIST_LIMIT)
        .into_iter()
        .map(|info| PollListItem {
            workflow_id: info.workflow_id,
            run_id: info.run_id,
            started_at: info.started_at,
        })
        .collect();
    (StatusCode::OK, Json(json!({ "polls": polls })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePollRequest {
    #[validate(length(
        min = 1,
        max = MAX_POLL_REQUEST_LENGTH,
        message = "Poll request must be between 1 and 2048 characters."
    ))]
    pub poll_request: String,
}

#[derive(Debug, Serialize)]
pub struct CreatePollResponse {
    pub success: bool,
    pub poll_id: String,
    /// False when the poll already existed
    pub created: bool,
    pub poll_url: String,
}

/// Parse a free-text request into a one-week poll over GitHub users.
pub async fn create_poll(
    State(state): State<ApiState>,
    Json(req): Json<CreatePollRequest>,
) -> impl IntoResponse {
    if let Err(errors) = req.validate() {
        return bad_request(validation_message(&errors));
    }

    let parsed = match state.app_state.parse_poll_request(&req.poll_request).await {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(error = %e, "Failed to parse poll request");
            return internal_error(format!("Failed to parse poll request: {e}"));
        }
    };

    let poll_id = poll_workflow_id(&parsed.question);
    let config = state.app_state.poll_config(&parsed);

    let creation = match state.app_state.create_poll(&poll_id, config).await {
        Ok(creation) => creation,
        Err(AppError::Registry(e)) => return error_response(StatusCode::CONFLICT, e.to_string()),
        Err(AppError::Poll(e)) => {
            tracing::error!(poll_id = %poll_id, error = %e, "Failed to start poll");
            return internal_error(e.to_string());
        }
    };

    if creation.created {
        state.app_state.start_poll_images(&poll_id, parsed.usernames);
    }

    (
        StatusCode::OK,
        Json(CreatePollResponse {
            success: true,
            poll_url: format!("/poll/{poll_id}"),
            poll_id,
            created: creation.created,
        }),
    )
        .into_response()
}

// ============================================================================
// Details / votes
// ============================================================================

#[derive(Debug, Serialize)]
pub struct PollDetailsResponse {
    pub poll_id: String,
    pub config: PollConfig,
    pub options: Vec<String>,
    pub state: PollState,
    pub phase: PollPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_uri: Option<String>,
}

pub async fn get_poll_details(
    Path(poll_id): Path<String>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    let poll = match lookup_poll(&state, &poll_id) {
        Ok(poll) => poll,
        Err(response) => return response,
    };

    let details = async {
        Ok::<_, PollError>((
            poll.config().await?,
            poll.options().await?,
            poll.state().await?,
            poll.phase().await?,
        ))
    };
    let (config, options, poll_state, phase) = match details.await {
        Ok(details) => details,
        Err(e) => return poll_error_response(e),
    };

    let uri = match &config.payment {
        Some(payment) if !poll_state.payment_paid => {
            Some(payment_uri(&payment.wallet, payment.amount, &poll_id))
        }
        _ => None,
    };

    (
        StatusCode::OK,
        Json(PollDetailsResponse {
            poll_id,
            config,
            options,
            state: poll_state,
            phase,
            payment_uri: uri,
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub option: String,
}

/// Each HTTP vote carries one unit of weight.
const HTTP_VOTE_WEIGHT: u64 = 1;

fn voter_cookie(voter_id: String) -> Cookie<'static> {
    Cookie::build((VOTER_COOKIE, voter_id))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::days(365))
        .build()
}

pub async fn vote_on_poll(
    Path(poll_id): Path<String>,
    State(state): State<ApiState>,
    jar: CookieJar,
    Json(req): Json<VoteRequest>,
) -> Response {
    let poll = match lookup_poll(&state, &poll_id) {
        Ok(poll) => poll,
        Err(response) => return response,
    };
    if req.option.len() > MAX_OPTION_LENGTH {
        return bad_request("Invalid option.");
    }

    // Voter identity comes only from the cookie
    let cookie_voter = jar
        .get(VOTER_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|id| !id.is_empty());
    let (voter_id, jar) = match cookie_voter {
        Some(id) => (id, jar),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            (id.clone(), jar.add(voter_cookie(id)))
        }
    };
    if voter_id.len() > MAX_OPTION_LENGTH {
        return bad_request("Invalid voter ID.");
    }

    let update = VoteUpdate {
        user_id: voter_id,
        option: req.option,
        amount: HTTP_VOTE_WEIGHT,
    };
    let option = update.option.clone();
    match poll.vote(update).await {
        Ok(result) => (
            jar,
            (
                StatusCode::OK,
                Json(json!({
                    "poll_id": poll_id,
                    "option": option,
                    "votes": result.total_votes
                })),
            ),
        )
            .into_response(),
        Err(e) => {
            tracing::info!(poll_id = %poll_id, error = %e, "Vote not accepted");
            (jar, poll_error_response(e)).into_response()
        }
    }
}

/// Current tally for one option; 0 while the poll is still starting.
pub async fn get_poll_votes(
    Path((poll_id, option)): Path<(String, String)>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    if let Err(response) = check_workflow_id(&poll_id, "Invalid poll ID.") {
        return response;
    }
    if option.len() > MAX_OPTION_LENGTH {
        return bad_request("Invalid option.");
    }

    let votes = match state.app_state.poll(&poll_id) {
        Some(poll) => match poll.state().await {
            Ok(poll_state) => poll_state.options.get(&option).copied().unwrap_or(0),
            Err(e) => {
                tracing::debug!(poll_id = %poll_id, error = %e, "Poll state unavailable");
                0
            }
        },
        None => 0,
    };

    (
        StatusCode::OK,
        Json(json!({
            "poll_id": poll_id,
            "option": option,
            "votes": votes
        })),
    )
        .into_response()
}

/// Whether a subject's image has landed in the poll folder.
pub async fn get_poll_profile(
    Path((poll_id, option)): Path<(String, String)>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    if let Err(response) = check_workflow_id(&poll_id, "Invalid poll ID.") {
        return response;
    }
    if option.len() > MAX_OPTION_LENGTH {
        return bad_request("Invalid option.");
    }

    let image_url = match state.app_state.poll_image_url(&poll_id, &option).await {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!(poll_id = %poll_id, option = %option, error = %e, "Poll image not available");
            None
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "poll_id": poll_id,
            "option": option,
            "ready": image_url.is_some(),
            "image_url": image_url
        })),
    )
        .into_response()
}

// ============================================================================
// Admin
// ============================================================================

/// Deliver an admin signal (`{"signal": "add_option", "value": "bob"}`).
pub async fn signal_poll(
    Path(poll_id): Path<String>,
    State(state): State<ApiState>,
    Json(signal): Json<PollSignal>,
) -> impl IntoResponse {
    let poll = match lookup_poll(&state, &poll_id) {
        Ok(poll) => poll,
        Err(response) => return response,
    };
    let value_len = match &signal {
        PollSignal::AddVoter(v)
        | PollSignal::RemoveVoter(v)
        | PollSignal::AddOption(v)
        | PollSignal::RemoveOption(v) => v.len(),
        PollSignal::StartPoll | PollSignal::EndPoll => 0,
    };
    if value_len > MAX_OPTION_LENGTH {
        return bad_request("Invalid signal value.");
    }

    let name = signal.name();
    match poll.signal(signal) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "success": true, "signal": name })),
        )
            .into_response(),
        Err(e) => poll_error_response(e),
    }
}

pub async fn delete_poll(
    Path(poll_id): Path<String>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    if let Err(response) = check_workflow_id(&poll_id, "Invalid poll ID.") {
        return response;
    }

    match state.app_state.delete_poll(&poll_id).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "message": "Poll deleted successfully" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(poll_id = %poll_id, error = %e, "Failed to delete poll storage");
            internal_error(format!("Failed to delete poll: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_workflow_id() {
        assert_eq!(
            sanitize_workflow_id("Who is the best Rustacean?"),
            "who-is-the-best-rustacean"
        );
        assert_eq!(sanitize_workflow_id("--a__b--"), "a__b");
        assert_eq!(sanitize_workflow_id("¿Qué?"), "qu");
        assert_eq!(sanitize_workflow_id(&"x".repeat(300)).len(), 200);
        assert_eq!(poll_workflow_id("Best dev"), "g2i-poll-best-dev");
    }

    #[test]
    fn test_payment_uri() {
        assert_eq!(
            payment_uri("Wallet111", 0.01, "g2i-poll-best dev"),
            "solana:Wallet111?amount=0.01&spl-token=EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v&memo=g2i-poll-best+dev"
        );
        assert!(payment_uri("W", 2.0, "p").contains("amount=2&"));
    }

    #[test]
    fn test_voter_cookie_attributes() {
        let cookie = voter_cookie("abc".to_string());
        assert_eq!(cookie.name(), VOTER_COOKIE);
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.max_age(), Some(time::Duration::days(365)));
    }
}
