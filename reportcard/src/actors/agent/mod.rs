//! Profile Agent - bounded tool-orchestration loop
//!
//! Drives a multi-turn conversation with a language model that can call two
//! tools: `gh` (fetch profile data through the GitHub CLI) and
//! `submit_github_profile` (the terminal result).
//!
//! ## Loop
//!
//! TURN -> DISPATCH CALLS -> (return on submit | next turn)
//!
//! Every model turn and every `gh` invocation is an activity, so transient
//! failures are retried under [`AgentConfig`]'s policies. Tool failures that
//! are not transient are fed back to the model as the call's output.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let agent = ProfileAgent::new(provider, executor, AgentConfig::default());
//! let transcript = agent.transcript();
//! let profile = agent.run(&ctx, &instruction).await?;
//! ```

pub mod policy;
pub mod tools;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ractor::ActorRef;
use serde_json::json;
use shared_types::{ProfileResult, EVENT_AGENT_TURN_COMPLETED};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::actors::event_store::{AppendEvent, EventStoreMsg};
use crate::durable::{execute_activity, ActivityError, ActivityOptions, WorkflowContext};

pub use tools::{
    profile_agent_tools, ToolCallRequest, ToolDeclaration, TurnRequest, TurnResult, GH_TOOL,
    SUBMIT_PROFILE_TOOL,
};

use policy::{reminder_for, truncate_for_log};
use tools::{format_calls, tool_error, GhArguments};

// ============================================================================
// Ports
// ============================================================================

/// One model turn. Implementations sit at the activity boundary.
#[async_trait]
pub trait TurnProvider: Send + Sync {
    async fn generate_turn(&self, request: &TurnRequest) -> Result<TurnResult, ActivityError>;
}

/// Runs a `gh` command string and returns its stdout.
#[async_trait]
pub trait ProfileCommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<String, ActivityError>;
}

#[async_trait]
impl<T: TurnProvider + ?Sized> TurnProvider for Arc<T> {
    async fn generate_turn(&self, request: &TurnRequest) -> Result<TurnResult, ActivityError> {
        (**self).generate_turn(request).await
    }
}

#[async_trait]
impl<T: ProfileCommandExecutor + ?Sized> ProfileCommandExecutor for Arc<T> {
    async fn execute(&self, command: &str) -> Result<String, ActivityError> {
        (**self).execute(command).await
    }
}

// ============================================================================
// Config / Errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hard bound on model turns
    pub max_turns: usize,
    /// Turns completed before the gentle reminder is injected
    pub gentle_reminder_turn: usize,
    /// Urgent reminder once `max_turns - urgent_reminder_margin` turns are used
    pub urgent_reminder_margin: usize,
    pub turn_activity: ActivityOptions,
    pub tool_activity: ActivityOptions,
    /// Transcript cap for tool results, in bytes
    pub max_log_length: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 20,
            gentle_reminder_turn: 5,
            urgent_reminder_margin: 3,
            turn_activity: ActivityOptions::with_timeout(Duration::from_secs(60)),
            tool_activity: ActivityOptions::with_timeout(Duration::from_secs(60)),
            max_log_length: 512,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum AgentError {
    #[error("turn provider failed: {0}")]
    Provider(ActivityError),

    #[error("empty response on turn {turn}: no text and no tool calls")]
    EmptyResponse { turn: usize },

    #[error("turn {turn} returned no continuation token")]
    MissingContinuation { turn: usize },

    #[error("agentic loop finished without submitting a result after {max_turns} turns")]
    Exhausted { max_turns: usize },
}

// ============================================================================
// Transcript
// ============================================================================

/// Read-only view of the ordered transcript, answerable while the loop runs.
#[derive(Debug, Clone)]
pub struct TranscriptHandle {
    rx: watch::Receiver<Vec<String>>,
}

impl TranscriptHandle {
    pub fn snapshot(&self) -> Vec<String> {
        self.rx.borrow().clone()
    }
}

// ============================================================================
// ProfileAgent
// ============================================================================

pub struct ProfileAgent<P: TurnProvider, E: ProfileCommandExecutor> {
    provider: P,
    executor: E,
    config: AgentConfig,
    tools: Vec<ToolDeclaration>,
    transcript: watch::Sender<Vec<String>>,
    journal: Option<ActorRef<EventStoreMsg>>,
}

impl<P: TurnProvider, E: ProfileCommandExecutor> ProfileAgent<P, E> {
    pub fn new(provider: P, executor: E, config: AgentConfig) -> Self {
        let (transcript, _) = watch::channel(Vec::new());
        Self {
            provider,
            executor,
            config,
            tools: profile_agent_tools(),
            transcript,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: ActorRef<EventStoreMsg>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn transcript(&self) -> TranscriptHandle {
        TranscriptHandle {
            rx: self.transcript.subscribe(),
        }
    }

    fn record(&self, entry: String) {
        self.transcript.send_modify(|entries| entries.push(entry));
    }

    /// Run the loop until a valid submission or the turn budget runs out.
    pub async fn run(
        &self,
        ctx: &WorkflowContext,
        instruction: &str,
    ) -> Result<ProfileResult, AgentError> {
        info!(
            workflow_id = %ctx.workflow_id(),
            max_turns = self.config.max_turns,
            "Starting profile agent loop"
        );

        let mut continuation: Option<String> = None;
        let mut pending_outputs: BTreeMap<String, String> = BTreeMap::new();

        for turns_taken in 0..self.config.max_turns {
            let turn = turns_taken + 1;
            let request = match continuation.take() {
                None => TurnRequest::initial(instruction, self.tools.clone()),
                Some(previous) => TurnRequest::continuation(
                    previous,
                    std::mem::take(&mut pending_outputs),
                    reminder_for(turns_taken, &self.config),
                    self.tools.clone(),
                ),
            };

            debug!(workflow_id = %ctx.workflow_id(), turn, "Agent turn");
            let result = execute_activity("generate_turn", &self.config.turn_activity, || {
                self.provider.generate_turn(&request)
            })
            .await
            .map_err(AgentError::Provider)?;

            let text = result.assistant_text.trim();
            if text.is_empty() && result.tool_calls.is_empty() {
                warn!(workflow_id = %ctx.workflow_id(), turn, "No tool calls and no assistant content");
                return Err(AgentError::EmptyResponse { turn });
            }
            if result.response_id.is_empty() {
                return Err(AgentError::MissingContinuation { turn });
            }
            continuation = Some(result.response_id.clone());

            if !text.is_empty() {
                self.record(format!("Turn {turn}: Assistant Response: {text}"));
            }

            if result.tool_calls.is_empty() {
                info!(workflow_id = %ctx.workflow_id(), turn, "Model responded with text only");
                self.journal_turn(ctx, turn, &result.response_id, &[], false);
                continue;
            }

            let calls = unique_call_ids(ctx, result.tool_calls);
            info!(
                workflow_id = %ctx.workflow_id(),
                turn,
                calls = calls.len(),
                "Model requested tool calls"
            );
            self.record(format!("Turn {turn}: Tool Calls: {}", format_calls(&calls)));

            for call in &calls {
                let output = match call.name.as_str() {
                    SUBMIT_PROFILE_TOOL => {
                        match serde_json::from_str::<ProfileResult>(&call.arguments) {
                            Ok(profile) => {
                                info!(
                                    workflow_id = %ctx.workflow_id(),
                                    turn,
                                    username = %profile.username,
                                    "Profile submitted, exiting agent loop"
                                );
                                self.journal_turn(ctx, turn, &result.response_id, &calls, true);
                                return Ok(profile);
                            }
                            Err(e) => tool_error(format!("failed to parse arguments: {e}")),
                        }
                    }
                    GH_TOOL => self.dispatch_gh(call).await,
                    _ => tool_error("unknown tool requested"),
                };

                let logged = truncate_for_log(&output, self.config.max_log_length);
                debug!(call_id = %call.id, name = %call.name, result = %logged, "Tool call result");
                self.record(format!("Turn {turn}: Tool Result for {}: {logged}", call.id));
                pending_outputs.insert(call.id.clone(), output);
            }

            self.journal_turn(ctx, turn, &result.response_id, &calls, false);
        }

        warn!(
            workflow_id = %ctx.workflow_id(),
            max_turns = self.config.max_turns,
            "Agent loop exhausted its turn budget"
        );
        Err(AgentError::Exhausted {
            max_turns: self.config.max_turns,
        })
    }

    async fn dispatch_gh(&self, call: &ToolCallRequest) -> String {
        let args = match serde_json::from_str::<GhArguments>(&call.arguments) {
            Ok(args) => args,
            Err(e) => return tool_error(format!("failed to parse arguments: {e}")),
        };

        match execute_activity("execute_gh_command", &self.config.tool_activity, || {
            self.executor.execute(&args.command)
        })
        .await
        {
            Ok(stdout) => stdout,
            Err(e) => tool_error(format!("failed to execute tool: {e}")),
        }
    }

    fn journal_turn(
        &self,
        ctx: &WorkflowContext,
        turn: usize,
        response_id: &str,
        calls: &[ToolCallRequest],
        submitted: bool,
    ) {
        let Some(journal) = &self.journal else {
            return;
        };
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        let payload = json!({
            "run_id": ctx.run_id(),
            "turn": turn,
            "response_id": response_id,
            "tool_calls": names,
            "submitted": submitted,
            "at": ctx.now(),
        });
        match AppendEvent::new(EVENT_AGENT_TURN_COMPLETED, payload, ctx.workflow_id()) {
            Ok(event) => {
                let _ = journal.send_message(EventStoreMsg::AppendAsync { event });
            }
            Err(e) => warn!(error = %e, "Failed to build agent turn event"),
        }
    }
}

/// Give empty or repeated call ids a fresh id so every call gets exactly one output slot.
fn unique_call_ids(ctx: &WorkflowContext, calls: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.is_empty() || seen.contains(&call.id) {
                let replacement = ctx.new_id();
                warn!(original = %call.id, replacement = %replacement, "Reassigning tool call id");
                call.id = replacement;
            }
            seen.insert(call.id.clone());
            call
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::SystemClock;

    fn call(id: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: GH_TOOL.to_string(),
            arguments: "{}".to_string(),
        }
    }

    #[test]
    fn test_unique_call_ids_fills_gaps() {
        let ctx = WorkflowContext::new("agentic-scrape-x", "run", Arc::new(SystemClock));
        let calls = unique_call_ids(&ctx, vec![call("a"), call(""), call("a"), call("b")]);
        let ids: Vec<_> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "run-0001", "run-0002", "b"]);
    }

    #[test]
    fn test_exhausted_message() {
        let err = AgentError::Exhausted { max_turns: 20 };
        assert!(err
            .to_string()
            .starts_with("agentic loop finished without submitting a result"));
    }
}
