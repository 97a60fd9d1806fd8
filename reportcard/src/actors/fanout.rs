//! Poll image fan-out - one content pipeline per poll subject.
//!
//! Subjects run concurrently and independently: a failed pipeline or a
//! failed copy is logged and reported, never propagated to its siblings.
//! Successful images are copied into the poll's namespace as
//! `<poll_id>/<username>.<ext>`.

use futures_util::future::join_all;
use serde::Serialize;
use shared_types::{PipelineInput, PollImageGenerationInput, RoutineKind};

use crate::activities::storage::extension_for_content_type;
use crate::durable::{execute_activity, ActivityError, ReusePolicy, WorkflowContext};

use super::pipeline::{pipeline_workflow_id, ContentPipeline, PipelineDeps};

pub fn fanout_workflow_id(poll_id: &str) -> String {
    format!("g2i-poll-image-generation-{poll_id}")
}

/// Destination of a subject's image inside the poll namespace.
pub fn poll_image_key(poll_id: &str, username: &str, extension: &str) -> String {
    format!("{poll_id}/{username}.{extension}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectOutcome {
    pub username: String,
    /// Set when the image landed in the poll namespace
    pub destination_key: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FanoutReport {
    pub poll_id: String,
    pub subjects: Vec<SubjectOutcome>,
}

impl FanoutReport {
    pub fn succeeded(&self) -> usize {
        self.subjects
            .iter()
            .filter(|s| s.destination_key.is_some())
            .count()
    }
}

pub async fn generate_poll_images(
    ctx: &WorkflowContext,
    input: &PollImageGenerationInput,
    deps: PipelineDeps,
) -> FanoutReport {
    tracing::info!(
        workflow_id = %ctx.workflow_id(),
        poll_id = %input.poll_id,
        user_count = input.usernames.len(),
        "Starting poll image generation"
    );

    let subjects = join_all(
        input
            .usernames
            .iter()
            .map(|username| generate_one(ctx, input, username, deps.clone())),
    )
    .await;

    let report = FanoutReport {
        poll_id: input.poll_id.clone(),
        subjects,
    };
    tracing::info!(
        workflow_id = %ctx.workflow_id(),
        succeeded = report.succeeded(),
        total = report.subjects.len(),
        "Poll image generation finished"
    );
    report
}

async fn generate_one(
    ctx: &WorkflowContext,
    input: &PollImageGenerationInput,
    username: &str,
    deps: PipelineDeps,
) -> SubjectOutcome {
    let failed = |error: String| SubjectOutcome {
        username: username.to_string(),
        destination_key: None,
        error: Some(error),
    };

    let child_id = pipeline_workflow_id(username);
    let info = match deps.registry.register(
        &child_id,
        RoutineKind::ContentPipeline,
        ReusePolicy::AllowDuplicate,
        ctx.now(),
    ) {
        Ok(info) => info,
        Err(e) => {
            tracing::warn!(username = %username, error = %e, "Skipping subject");
            return failed(e.to_string());
        }
    };
    let child_ctx = WorkflowContext::new(child_id.clone(), info.run_id, ctx.clock());

    let child_input = PipelineInput {
        github_username: username.to_string(),
        ..input.base.clone()
    };
    let registry = deps.registry.clone();
    let storage = deps.storage.clone();
    let activity = deps.activity.clone();

    let output = match ContentPipeline::new(deps).run(&child_ctx, &child_input).await {
        Ok(output) => {
            registry.settle(&child_id, None, ctx.now());
            output
        }
        Err(e) => {
            registry.settle(&child_id, Some(e.to_string()), ctx.now());
            tracing::error!(username = %username, error = %e, "Child pipeline failed");
            return failed(e.to_string());
        }
    };

    let Some(extension) = extension_for_content_type(&output.content_type) else {
        tracing::warn!(username = %username, content_type = %output.content_type, "Child pipeline returned invalid content type");
        return failed(format!("invalid content type: {}", output.content_type));
    };
    let destination = poll_image_key(&input.poll_id, username, extension);

    let (source, dest) = (output.storage_key.as_str(), destination.as_str());
    let storage = &storage;
    let copied = execute_activity("copy_object", &activity, || async move {
        storage.copy(source, dest).await.map_err(ActivityError::from)
    })
    .await;

    match copied {
        Ok(()) => {
            tracing::info!(destination_key = %destination, "Copied image to poll folder");
            SubjectOutcome {
                username: username.to_string(),
                destination_key: Some(destination),
                error: None,
            }
        }
        Err(e) => {
            tracing::error!(destination_key = %destination, error = %e, "Failed to copy image to poll folder");
            failed(e.to_string())
        }
    }
}
