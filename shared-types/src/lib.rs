//! Shared types between the orchestration backend and its HTTP clients
//!
//! These types cross the HTTP boundary and the routine boundary:
//! - the structured profile produced by the agent loop
//! - poll configuration, tally snapshots and vote updates
//! - content pipeline input/output/status
//!
//! Serializable with serde for JSON over HTTP

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Profile Result
// ============================================================================

/// Structured profile submitted by the agent through `submit_github_profile`.
///
/// Fields listed as required by the submission tool schema have no serde default,
/// so a submission missing one of them fails to parse and is reported back to the
/// model as a tool error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct GitHubProfile {
    pub username: String,
    pub bio: String,
    pub location: String,
    pub website: String,
    pub public_repos: i64,
    pub original_repos: i64,
    pub forked_repos: i64,
    pub languages: Vec<String>,
    pub top_repositories: Vec<Repository>,
    pub contribution_graph: ContributionGraph,
    pub professional_summary: String,
    #[serde(default)]
    pub professional_score: f64,
    #[serde(default)]
    pub safety_flags: Vec<String>,
    pub code_snippets: Vec<CodeSnippet>,
}

/// Terminal payload of the agent loop.
pub type ProfileResult = GitHubProfile;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct Repository {
    pub name: String,
    pub description: String,
    pub language: String,
    pub stars: i64,
    pub forks: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub is_fork: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct ContributionGraph {
    pub total_contributions: i64,
    pub streak: i64,
    /// date -> count
    #[serde(default)]
    pub contributions: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct CodeSnippet {
    pub repository: String,
    pub file_path: String,
    pub content: String,
    pub language: String,
}

// ============================================================================
// Polls
// ============================================================================

/// Payment that must be received before a poll accepts votes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct PaymentRequirement {
    /// Wallet address receiving the payment
    pub wallet: String,
    /// Exact amount expected
    pub amount: f64,
}

/// Immutable configuration of one poll instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct PollConfig {
    pub question: String,
    /// `None` means anyone can vote
    #[serde(default)]
    pub allowed_voters: Option<Vec<String>>,
    /// `None` means any option string is votable
    #[serde(default)]
    pub allowed_options: Option<Vec<String>>,
    /// 0 means the poll runs until explicitly ended
    #[serde(default)]
    pub duration_seconds: u64,
    #[serde(default)]
    pub start_blocked: bool,
    #[serde(default)]
    pub single_vote: bool,
    #[serde(default)]
    pub payment: Option<PaymentRequirement>,
}

impl PollConfig {
    pub fn payment_required(&self) -> bool {
        self.payment.is_some()
    }

    pub fn duration(&self) -> Option<std::time::Duration> {
        (self.duration_seconds > 0).then(|| std::time::Duration::from_secs(self.duration_seconds))
    }
}

/// Snapshot of a poll's mutable tally.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct PollState {
    pub options: BTreeMap<String, u64>,
    pub voters: BTreeSet<String>,
    pub payment_paid: bool,
    #[serde(default)]
    pub payment_txn_id: Option<String>,
}

/// Summary returned when a poll ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct PollSummary {
    pub question: String,
    pub options: BTreeMap<String, u64>,
    pub voters: BTreeSet<String>,
}

fn default_vote_amount() -> u64 {
    1
}

/// Payload of the `vote` update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export)]
pub struct VoteUpdate {
    pub user_id: String,
    pub option: String,
    #[serde(default = "default_vote_amount")]
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export)]
pub struct VoteUpdateResult {
    pub total_votes: u64,
}

/// Signals accepted by a running poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(tag = "signal", content = "value", rename_all = "snake_case")]
#[ts(export)]
pub enum PollSignal {
    StartPoll,
    EndPoll,
    AddVoter(String),
    RemoveVoter(String),
    AddOption(String),
    RemoveOption(String),
}

impl PollSignal {
    pub fn name(&self) -> &'static str {
        match self {
            PollSignal::StartPoll => "start_poll",
            PollSignal::EndPoll => "end_poll",
            PollSignal::AddVoter(_) => "add_voter",
            PollSignal::RemoveVoter(_) => "remove_voter",
            PollSignal::AddOption(_) => "add_option",
            PollSignal::RemoveOption(_) => "remove_option",
        }
    }
}

/// Lifecycle phase of a poll instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum PollPhase {
    BlockedForStart,
    AwaitingPayment,
    Open,
    Closed,
}

// ============================================================================
// Content Pipeline
// ============================================================================

/// Input to the content pipeline for one profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct PipelineInput {
    pub github_username: String,
    /// Prompt for the agentic profile scrape
    pub research_agent_system_prompt: String,
    /// Prompt for report-card prompt synthesis
    pub content_generation_system_prompt: String,
    /// If provided, prompt synthesis is skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_prompt: Option<String>,
    pub model_name: String,
    #[serde(default)]
    pub image_format: String,
    #[serde(default)]
    pub image_width: u32,
    #[serde(default)]
    pub image_height: u32,
    pub storage_bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct PipelineOutput {
    pub github_profile: GitHubProfile,
    pub content_generation_prompt: String,
    pub content_url: String,
    pub content_type: String,
    pub storage_key: String,
    #[serde(default)]
    pub image_format: String,
    #[serde(default)]
    pub image_width: u32,
    #[serde(default)]
    pub image_height: u32,
    pub created_at: DateTime<Utc>,
}

/// Answer to the pipeline status query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct PipelineStatus {
    pub status: String,
    #[serde(default)]
    pub result: Option<PipelineOutput>,
    pub completed: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            status: "Initializing...".to_string(),
            result: None,
            completed: false,
            error: None,
        }
    }
}

/// Input to the image fan-out for a poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct PollImageGenerationInput {
    pub poll_id: String,
    pub usernames: Vec<String>,
    pub base: PipelineInput,
}

// ============================================================================
// Routine Registry
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum RoutineKind {
    ContentPipeline,
    AgentScrape,
    Poll,
    PollImages,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
#[ts(export)]
pub enum RoutineStatus {
    Running,
    Completed,
    Failed(String),
    Terminated(String),
}

impl RoutineStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, RoutineStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export)]
pub struct RoutineInfo {
    pub workflow_id: String,
    pub run_id: String,
    pub kind: RoutineKind,
    pub status: RoutineStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Journal
// ============================================================================

/// Journal entry - append-only routine history
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Event {
    /// Global sequence number (strictly increasing)
    pub seq: i64,
    /// Unique event ID (ULID)
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// Routine instance that produced this event
    pub actor_id: String,
    /// Event type (e.g., "poll.vote.accepted")
    pub event_type: String,
    #[ts(type = "unknown")]
    pub payload: serde_json::Value,
}

pub const EVENT_POLL_CREATED: &str = "poll.created";
pub const EVENT_POLL_STARTED: &str = "poll.started";
pub const EVENT_POLL_PAYMENT_RECEIVED: &str = "poll.payment.received";
pub const EVENT_POLL_OPENED: &str = "poll.opened";
pub const EVENT_POLL_VOTE_ACCEPTED: &str = "poll.vote.accepted";
pub const EVENT_POLL_SIGNAL_APPLIED: &str = "poll.signal.applied";
pub const EVENT_POLL_CLOSED: &str = "poll.closed";
pub const EVENT_AGENT_TURN_COMPLETED: &str = "agent.turn.completed";
pub const EVENT_PIPELINE_STATUS: &str = "pipeline.status";
