//! Content pipeline - profile agent -> report-card prompt -> image -> storage.
//!
//! The profile agent runs as a child routine with its own registry entry
//! (`agentic-scrape-<username>`). Pipeline progress is published through a
//! watch channel so the status query never waits on the running step.

use std::sync::Arc;

use dashmap::DashMap;
use ractor::ActorRef;
use serde_json::json;
use shared_types::{
    PipelineInput, PipelineOutput, PipelineStatus, RoutineKind, EVENT_PIPELINE_STATUS,
};
use tokio::sync::watch;

use crate::activities::content::{build_report_card_prompt, ImageGenerator, ImageSpec};
use crate::activities::storage::{generate_storage_key, ObjectStorage};
use crate::actors::agent::{
    AgentConfig, AgentError, ProfileAgent, ProfileCommandExecutor, TranscriptHandle, TurnProvider,
};
use crate::actors::event_store::{AppendEvent, EventStoreMsg};
use crate::durable::{
    execute_activity, ActivityError, ActivityOptions, RegistryError, ReusePolicy, RoutineRegistry,
    WorkflowContext,
};

pub const STATUS_ANALYZING: &str = "Analyzing GitHub profile...";
pub const STATUS_PROMPT: &str = "Generating prompt...";
pub const STATUS_IMAGE: &str = "Generating image...";
pub const STATUS_STORING: &str = "Storing content...";
pub const STATUS_COMPLETED: &str = "Completed";
pub const STATUS_FAILED: &str = "Failed";

pub fn pipeline_workflow_id(username: &str) -> String {
    format!("content-generation-{username}")
}

pub fn agent_workflow_id(username: &str) -> String {
    format!("agentic-scrape-{username}")
}

/// Research instruction handed to the profile agent.
pub fn agent_instruction(research_prompt: &str, username: &str) -> String {
    format!("{research_prompt}\n\nScrape this info from the GitHub profile for the user: {username}")
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to scrape GitHub profile: {0}")]
    Agent(#[from] AgentError),

    #[error("{step} failed: {source}")]
    Activity {
        step: &'static str,
        source: ActivityError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Collaborators shared by every pipeline run.
#[derive(Clone)]
pub struct PipelineDeps {
    pub provider: Arc<dyn TurnProvider>,
    pub executor: Arc<dyn ProfileCommandExecutor>,
    pub images: Arc<dyn ImageGenerator>,
    pub storage: Arc<dyn ObjectStorage>,
    pub registry: RoutineRegistry,
    pub agent: AgentConfig,
    /// Options for prompt, image and storage steps
    pub activity: ActivityOptions,
    pub journal: Option<ActorRef<EventStoreMsg>>,
    /// Live agent transcripts by agent and pipeline workflow id
    pub transcripts: Arc<DashMap<String, TranscriptHandle>>,
    /// Status of every pipeline started with these deps, by workflow id
    pub statuses: Arc<DashMap<String, PipelineStatusHandle>>,
}

#[derive(Debug, Clone)]
pub struct PipelineStatusHandle {
    rx: watch::Receiver<PipelineStatus>,
}

impl PipelineStatusHandle {
    pub fn snapshot(&self) -> PipelineStatus {
        self.rx.borrow().clone()
    }
}

pub struct ContentPipeline {
    deps: PipelineDeps,
    status: watch::Sender<PipelineStatus>,
}

impl ContentPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        let (status, _) = watch::channel(PipelineStatus::default());
        Self { deps, status }
    }

    pub fn status(&self) -> PipelineStatusHandle {
        PipelineStatusHandle {
            rx: self.status.subscribe(),
        }
    }

    fn set_status(&self, ctx: &WorkflowContext, status: &str) {
        self.status.send_modify(|s| s.status = status.to_string());
        tracing::info!(workflow_id = %ctx.workflow_id(), status, "Pipeline status");
        if let Some(journal) = &self.deps.journal {
            let payload = json!({ "run_id": ctx.run_id(), "status": status, "at": ctx.now() });
            if let Ok(event) = AppendEvent::new(EVENT_PIPELINE_STATUS, payload, ctx.workflow_id()) {
                let _ = journal.send_message(EventStoreMsg::AppendAsync { event });
            }
        }
    }

    pub async fn run(
        &self,
        ctx: &WorkflowContext,
        input: &PipelineInput,
    ) -> Result<PipelineOutput, PipelineError> {
        tracing::info!(
            workflow_id = %ctx.workflow_id(),
            username = %input.github_username,
            "Starting content generation pipeline"
        );
        self.deps
            .statuses
            .insert(ctx.workflow_id().to_string(), self.status());
        match self.run_steps(ctx, input).await {
            Ok(output) => {
                self.status.send_modify(|s| {
                    s.status = STATUS_COMPLETED.to_string();
                    s.completed = true;
                    s.result = Some(output.clone());
                });
                self.set_status(ctx, STATUS_COMPLETED);
                tracing::info!(
                    workflow_id = %ctx.workflow_id(),
                    content_url = %output.content_url,
                    "Content generation pipeline completed"
                );
                Ok(output)
            }
            Err(e) => {
                tracing::error!(workflow_id = %ctx.workflow_id(), error = %e, "Content generation pipeline failed");
                self.status.send_modify(|s| s.error = Some(e.to_string()));
                self.set_status(ctx, STATUS_FAILED);
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        ctx: &WorkflowContext,
        input: &PipelineInput,
    ) -> Result<PipelineOutput, PipelineError> {
        let deps = &self.deps;
        let username = input.github_username.as_str();

        // Step 1: profile agent as a child routine
        self.set_status(ctx, STATUS_ANALYZING);
        let profile = self.run_agent(ctx, input).await?;

        // Step 2: report-card prompt
        self.set_status(ctx, STATUS_PROMPT);
        let prompt = match input.content_prompt.as_deref().map(str::trim) {
            Some(given) if !given.is_empty() => given.to_string(),
            _ => build_report_card_prompt(&profile, &input.content_generation_system_prompt),
        };

        // Step 3: image
        self.set_status(ctx, STATUS_IMAGE);
        let spec = ImageSpec {
            model: input.model_name.clone(),
            format: input.image_format.clone(),
            width: input.image_width,
            height: input.image_height,
        };
        let image = execute_activity("generate_content", &deps.activity, || {
            deps.images.generate(&prompt, &spec)
        })
        .await
        .map_err(|source| PipelineError::Activity {
            step: "generate_content",
            source,
        })?;

        // Step 4: storage
        self.set_status(ctx, STATUS_STORING);
        let storage_key = match input.storage_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => key.to_string(),
            None => generate_storage_key(username, &image.content_type, ctx.now()),
        };
        let storage = &deps.storage;
        let (key, data, content_type) = (
            storage_key.as_str(),
            image.data.as_slice(),
            image.content_type.as_str(),
        );
        let content_url = execute_activity("store_content", &deps.activity, || async move {
            storage
                .store(key, data, content_type)
                .await
                .map_err(ActivityError::from)
        })
        .await
        .map_err(|source| PipelineError::Activity {
            step: "store_content",
            source,
        })?;

        Ok(PipelineOutput {
            github_profile: profile,
            content_generation_prompt: prompt,
            content_url,
            content_type: image.content_type,
            storage_key,
            image_format: input.image_format.clone(),
            image_width: input.image_width,
            image_height: input.image_height,
            created_at: ctx.now(),
        })
    }

    async fn run_agent(
        &self,
        ctx: &WorkflowContext,
        input: &PipelineInput,
    ) -> Result<shared_types::ProfileResult, PipelineError> {
        let deps = &self.deps;
        let child_id = agent_workflow_id(&input.github_username);
        let info = deps.registry.register(
            &child_id,
            RoutineKind::AgentScrape,
            ReusePolicy::AllowDuplicate,
            ctx.now(),
        )?;
        let child_ctx = WorkflowContext::new(child_id.clone(), info.run_id, ctx.clock());

        let mut agent = ProfileAgent::new(
            deps.provider.clone(),
            deps.executor.clone(),
            deps.agent.clone(),
        );
        if let Some(journal) = &deps.journal {
            agent = agent.with_journal(journal.clone());
        }
        let transcript = agent.transcript();
        deps.transcripts.insert(child_id.clone(), transcript.clone());
        deps.transcripts
            .insert(ctx.workflow_id().to_string(), transcript);

        let instruction =
            agent_instruction(&input.research_agent_system_prompt, &input.github_username);
        let result = agent.run(&child_ctx, &instruction).await;

        let closed = match &result {
            Ok(_) => deps.registry.complete(&child_id, ctx.now()),
            Err(e) => deps.registry.fail(&child_id, e.to_string(), ctx.now()),
        };
        if let Err(e) = closed {
            tracing::warn!(workflow_id = %child_id, error = %e, "Could not close agent routine");
        }
        Ok(result?)
    }
}

/// Run one pipeline to completion without exposing its status.
pub async fn run_content_pipeline(
    ctx: &WorkflowContext,
    input: &PipelineInput,
    deps: PipelineDeps,
) -> Result<PipelineOutput, PipelineError> {
    ContentPipeline::new(deps).run(ctx, input).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert_eq!(pipeline_workflow_id("octocat"), "content-generation-octocat");
        assert_eq!(agent_workflow_id("octocat"), "agentic-scrape-octocat");
        assert_eq!(
            agent_instruction("Research.", "octocat"),
            "Research.\n\nScrape this info from the GitHub profile for the user: octocat"
        );
    }

    #[test]
    fn test_status_handle_starts_initializing() {
        let (tx, rx) = watch::channel(PipelineStatus::default());
        let handle = PipelineStatusHandle { rx };
        assert_eq!(handle.snapshot().status, "Initializing...");
        tx.send_modify(|s| s.status = STATUS_IMAGE.to_string());
        assert_eq!(handle.snapshot().status, STATUS_IMAGE);
    }
}
