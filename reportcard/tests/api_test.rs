//! HTTP API Integration Tests
//!
//! Full request/response cycles against the router with fake model, image
//! and command services and file-backed storage in a temp directory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use ractor::Actor;
use serde_json::{json, Value};
use tower::ServiceExt;

use reportcard::activities::content::{GeneratedImage, ImageGenerator, ImageSpec};
use reportcard::activities::llm::POLL_REQUEST_TOOL;
use reportcard::activities::storage::{LocalObjectStorage, ObjectStorage};
use reportcard::actors::agent::{
    ProfileCommandExecutor, ToolCallRequest, TurnProvider, TurnRequest, TurnResult,
    SUBMIT_PROFILE_TOOL,
};
use reportcard::actors::{EventStoreActor, EventStoreArguments};
use reportcard::api;
use reportcard::app_state::{AppState, Services};
use reportcard::config::AppConfig;
use reportcard::durable::ActivityError;

// ============================================================================
// Fakes
// ============================================================================

/// Answers poll parsing with a fixed question and every agent turn with a submission.
struct FakeModel;

#[async_trait]
impl TurnProvider for FakeModel {
    async fn generate_turn(&self, request: &TurnRequest) -> Result<TurnResult, ActivityError> {
        let (name, arguments) = if request.tools.iter().any(|t| t.name == POLL_REQUEST_TOOL) {
            (
                POLL_REQUEST_TOOL,
                json!({"question": "Who ships the most?", "usernames": ["@alice", "bob"]}),
            )
        } else {
            (SUBMIT_PROFILE_TOOL, profile())
        };
        Ok(TurnResult {
            response_id: "resp-1".to_string(),
            assistant_text: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: "call-1".to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
        })
    }
}

struct FakeImages;

#[async_trait]
impl ImageGenerator for FakeImages {
    async fn generate(&self, _prompt: &str, _spec: &ImageSpec) -> Result<GeneratedImage, ActivityError> {
        Ok(GeneratedImage {
            data: b"\x89PNG fake".to_vec(),
            content_type: "image/png".to_string(),
        })
    }
}

struct NoGh;

#[async_trait]
impl ProfileCommandExecutor for NoGh {
    async fn execute(&self, _command: &str) -> Result<String, ActivityError> {
        Err(ActivityError::non_retryable(
            "GhCommandExecutionError",
            "gh is not available in tests",
        ))
    }
}

fn profile() -> Value {
    json!({
        "username": "alice",
        "bio": "Builds things",
        "location": "Lisbon",
        "website": "",
        "public_repos": 12,
        "original_repos": 10,
        "forked_repos": 2,
        "languages": ["Rust"],
        "top_repositories": [],
        "contribution_graph": {"total_contributions": 900, "streak": 30},
        "professional_summary": "Prolific maintainer",
        "code_snippets": []
    })
}

// ============================================================================
// Setup
// ============================================================================

fn test_config(storage_root: &std::path::Path) -> AppConfig {
    AppConfig {
        port: 8080,
        database_url: ":memory:".to_string(),
        storage_bucket: "reportcards".to_string(),
        storage_root: storage_root.to_path_buf(),
        public_base_url: "http://localhost:8080/storage".to_string(),
        google_api_key: "test-key".to_string(),
        gemini_model: "gemini-test".to_string(),
        llm_api_key: "test-key".to_string(),
        llm_model: "test-model".to_string(),
        llm_base_url: "http://localhost:1".to_string(),
        image_format: "png".to_string(),
        image_width: 1024,
        image_height: 1024,
        payment: None,
        research_agent_prompt: "Research the profile.".to_string(),
        content_generation_prompt: "Design a report card.".to_string(),
        poll_parser_prompt: "Extract a poll.".to_string(),
        github_token: None,
    }
}

async fn setup_test_app() -> (axum::Router, tempfile::TempDir, Arc<LocalObjectStorage>) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let config = test_config(temp_dir.path());

    let (event_store, _handle) = Actor::spawn(None, EventStoreActor, EventStoreArguments::InMemory)
        .await
        .expect("Failed to create event store");

    let storage = Arc::new(LocalObjectStorage::new(
        temp_dir.path(),
        config.storage_bucket.clone(),
        config.public_base_url.clone(),
    ));
    let services = Services {
        provider: Arc::new(FakeModel),
        executor: Arc::new(NoGh),
        images: Arc::new(FakeImages),
        storage: storage.clone(),
        payment_watcher: None,
    };

    let app_state = AppState::new(config, services, event_store);
    let app = api::router().with_state(api::ApiState { app_state });
    (app, temp_dir, storage)
}

async fn send(app: &axum::Router, req: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let response = app.clone().oneshot(req).await.expect("Request failed");
    let status = response.status();
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let value: Value = serde_json::from_slice(&body).expect("Invalid JSON response");
    (status, cookie, value)
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, _, value) = send(app, req).await;
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Poll `uri` until `done` holds for the JSON body.
async fn wait_for(app: &axum::Router, uri: &str, done: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..200 {
        let (status, body) = json_response(app, get(uri)).await;
        if status == StatusCode::OK && done(&body) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition on {uri} never held");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let (app, _temp_dir, _storage) = setup_test_app().await;

    let (status, body) = json_response(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "reportcard");
}

#[tokio::test]
async fn test_generate_rejects_bad_username() {
    let (app, _temp_dir, _storage) = setup_test_app().await;

    let (status, body) =
        json_response(&app, post("/generate", json!({"github_username": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "GitHub username must be 1-39 characters.");

    let long = "x".repeat(40);
    let (status, _) =
        json_response(&app, post("/generate", json!({"github_username": long}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_generate_runs_pipeline_to_completion() {
    let (app, _temp_dir, storage) = setup_test_app().await;

    let (status, body) =
        json_response(&app, post("/generate", json!({"github_username": "alice"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflow_id"], "content-generation-alice");
    assert_eq!(body["status_url"], "/workflow/content-generation-alice/status");

    let status_body = wait_for(&app, "/workflow/content-generation-alice/status", |b| {
        b["completed"] == true
    })
    .await;
    assert!(status_body["error"].is_null());
    let result = &status_body["result"];
    assert_eq!(result["content_type"], "image/png");
    assert_eq!(result["github_profile"]["username"], "alice");
    let key = result["storage_key"].as_str().unwrap();
    assert!(key.starts_with("alice/"));
    assert!(storage.stat(key).await.unwrap().is_some());

    let (status, transcript) =
        json_response(&app, get("/workflow/content-generation-alice/transcript")).await;
    assert_eq!(status, StatusCode::OK);
    let entries = transcript["transcript"].as_array().unwrap();
    assert!(entries[0]
        .as_str()
        .unwrap()
        .starts_with("Turn 1: Tool Calls: [{ID:call-1 Name:submit_github_profile"));
}

#[tokio::test]
async fn test_unknown_workflow_is_not_found() {
    let (app, _temp_dir, _storage) = setup_test_app().await;

    let (status, body) = json_response(&app, get("/workflow/content-generation-nobody/status")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Workflow not found");

    let long = "w".repeat(300);
    let (status, _) = json_response(&app, get(&format!("/workflow/{long}/status"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_poll_lifecycle() {
    let (app, _temp_dir, storage) = setup_test_app().await;
    // bob already has stored content, so his image is copied rather than generated
    storage
        .store("bob/1700000000/content.png", b"bob", "image/png")
        .await
        .unwrap();

    let (status, body) = json_response(
        &app,
        post("/poll", json!({"poll_request": "Who ships more, @alice or @bob?"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], true);
    let poll_id = body["poll_id"].as_str().unwrap().to_string();
    assert_eq!(poll_id, "g2i-poll-who-ships-the-most");
    assert_eq!(body["poll_url"], format!("/poll/{poll_id}"));

    // Same question again returns the running poll
    let (status, again) = json_response(
        &app,
        post("/poll", json!({"poll_request": "Who ships more, @alice or @bob?"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["created"], false);

    let (status, details) = json_response(&app, get(&format!("/poll/{poll_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["config"]["question"], "Who ships the most?");
    assert_eq!(details["options"], json!(["alice", "bob"]));
    assert_eq!(details["phase"], "open");
    assert!(details.get("payment_uri").is_none());

    let (status, polls) = json_response(&app, get("/polls")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(polls["polls"][0]["workflow_id"], poll_id);

    // First vote without a cookie mints a voter id
    let (status, cookie, vote) = send(
        &app,
        post(&format!("/poll/{poll_id}/vote"), json!({"option": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vote["votes"], 1);
    let cookie = cookie.expect("voter cookie should be set");
    assert!(cookie.starts_with("voter_id="));
    let voter = cookie
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let req = Request::builder()
        .method("POST")
        .uri(format!("/poll/{poll_id}/vote"))
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, voter)
        .body(Body::from(json!({"option": "alice", "amount": 1000000}).to_string()))
        .unwrap();
    let (status, cookie, vote) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    // Weight in the body is ignored, every vote counts once
    assert_eq!(vote["votes"], 2);
    assert!(cookie.is_none());

    // A body user_id does not stand in for the cookie
    let (status, cookie, vote) = send(
        &app,
        post(
            &format!("/poll/{poll_id}/vote"),
            json!({"option": "bob", "amount": 0, "user_id": "someone-else"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vote["votes"], 1);
    let minted = cookie.expect("a fresh voter cookie should be set");
    assert!(!minted.starts_with("voter_id=someone-else"));

    let (status, rejected) = json_response(
        &app,
        post(&format!("/poll/{poll_id}/vote"), json!({"option": "carol"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(rejected["error"], "vote rejected for non-allowed option: carol");

    let (status, votes) = json_response(&app, get(&format!("/poll/{poll_id}/votes/alice"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(votes["votes"], 2);

    // Images land in the poll folder: alice through the fan-out, bob by copy
    for user in ["alice", "bob"] {
        let profile = wait_for(&app, &format!("/poll/{poll_id}/profile/{user}"), |b| {
            b["ready"] == true
        })
        .await;
        assert_eq!(
            profile["image_url"],
            format!("http://localhost:8080/storage/reportcards/{poll_id}/{user}.png")
        );
    }

    let (status, signal) = json_response(
        &app,
        post(
            &format!("/poll/{poll_id}/signal"),
            json!({"signal": "add_option", "value": "carol"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(signal["signal"], "add_option");
    wait_for(&app, &format!("/poll/{poll_id}"), |b| {
        b["options"] == json!(["alice", "bob", "carol"])
    })
    .await;

    let req = Request::builder()
        .method("DELETE")
        .uri(format!("/poll/{poll_id}"))
        .body(Body::empty())
        .unwrap();
    let (status, deleted) = json_response(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["message"], "Poll deleted successfully");

    let (status, _) = json_response(&app, get(&format!("/poll/{poll_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(storage
        .stat(&format!("{poll_id}/alice.png"))
        .await
        .unwrap()
        .is_none());

    let (status, votes) = json_response(&app, get(&format!("/poll/{poll_id}/votes/alice"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(votes["votes"], 0);
}

#[tokio::test]
async fn test_poll_request_validation() {
    let (app, _temp_dir, _storage) = setup_test_app().await;

    let (status, body) = json_response(&app, post("/poll", json!({"poll_request": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["error"],
        "Poll request must be between 1 and 2048 characters."
    );

    let (status, _) = json_response(
        &app,
        post("/poll/g2i-poll-nothing/vote", json!({"option": "a"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
