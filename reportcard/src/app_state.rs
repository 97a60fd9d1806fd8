use std::sync::Arc;

use dashmap::DashMap;
use ractor::ActorRef;
use shared_types::{
    PaymentRequirement, PipelineInput, PipelineStatus, PollConfig, PollImageGenerationInput,
    RoutineInfo, RoutineKind, RoutineStatus,
};
use tokio::task::JoinHandle;

use crate::activities::content::ImageGenerator;
use crate::activities::llm::{parse_poll_request, ParsedPollRequest};
use crate::activities::storage::{ObjectStorage, StorageError};
use crate::actors::agent::{AgentConfig, ProfileCommandExecutor, TurnProvider};
use crate::actors::event_store::EventStoreMsg;
use crate::actors::fanout::{fanout_workflow_id, generate_poll_images, poll_image_key};
use crate::actors::pipeline::{pipeline_workflow_id, ContentPipeline, PipelineDeps};
use crate::actors::poll::{
    spawn_poll, PaymentSettings, PaymentWatcher, PollDeps, PollError, PollHandle,
};
use crate::config::AppConfig;
use crate::durable::{
    execute_activity, ActivityError, ActivityOptions, Clock, RegistryError, ReusePolicy,
    RoutineRegistry, SystemClock, WorkflowContext,
};

/// Every poll runs for one week.
pub const POLL_DURATION_SECONDS: u64 = 7 * 24 * 60 * 60;

const DELETED_REASON: &str = "Poll deleted by user";

/// External collaborators, injected so tests can swap in fakes.
#[derive(Clone)]
pub struct Services {
    pub provider: Arc<dyn TurnProvider>,
    pub executor: Arc<dyn ProfileCommandExecutor>,
    pub images: Arc<dyn ImageGenerator>,
    pub storage: Arc<dyn ObjectStorage>,
    pub payment_watcher: Option<Arc<dyn PaymentWatcher>>,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Poll(#[from] PollError),
}

/// Result of asking for a poll to be created.
#[derive(Debug, Clone)]
pub struct PollCreation {
    pub handle: PollHandle,
    /// False when a poll with the same id was already running
    pub created: bool,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    registry: RoutineRegistry,
    event_store: ActorRef<EventStoreMsg>,
    pipeline: PipelineDeps,
    poll_deps: PollDeps,
    polls: DashMap<String, PollHandle>,
    /// Background routines that can be aborted, by workflow id
    tasks: DashMap<String, JoinHandle<()>>,
}

impl AppState {
    pub fn new(config: AppConfig, services: Services, event_store: ActorRef<EventStoreMsg>) -> Self {
        let registry = RoutineRegistry::new();
        let pipeline = PipelineDeps {
            provider: services.provider,
            executor: services.executor,
            images: services.images,
            storage: services.storage,
            registry: registry.clone(),
            agent: AgentConfig::default(),
            activity: ActivityOptions::default(),
            journal: Some(event_store.clone()),
            transcripts: Arc::new(DashMap::new()),
            statuses: Arc::new(DashMap::new()),
        };

        let payment = match (&config.payment, services.payment_watcher) {
            (Some(payment), Some(watcher)) => match &payment.server_url {
                Some(server_url) => Some(PaymentSettings::new(
                    watcher,
                    server_url.clone(),
                    payment.network.clone(),
                )),
                None => {
                    tracing::warn!("Payment wallet configured without FOROHTOO_SERVER_URL; paid polls cannot open");
                    None
                }
            },
            _ => None,
        };
        let poll_deps = PollDeps {
            payment,
            journal: Some(event_store.clone()),
        };

        Self {
            inner: Arc::new(AppStateInner {
                config,
                clock: Arc::new(SystemClock),
                registry,
                event_store,
                pipeline,
                poll_deps,
                polls: DashMap::new(),
                tasks: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn event_store(&self) -> ActorRef<EventStoreMsg> {
        self.inner.event_store.clone()
    }

    pub fn registry(&self) -> &RoutineRegistry {
        &self.inner.registry
    }

    pub fn storage(&self) -> Arc<dyn ObjectStorage> {
        self.inner.pipeline.storage.clone()
    }

    // ------------------------------------------------------------------
    // Content pipeline
    // ------------------------------------------------------------------

    /// Pipeline input built from configuration for one user.
    pub fn pipeline_input(&self, username: &str, model_name: Option<&str>) -> PipelineInput {
        let config = &self.inner.config;
        PipelineInput {
            github_username: username.to_string(),
            research_agent_system_prompt: config.research_agent_prompt.clone(),
            content_generation_system_prompt: config.content_generation_prompt.clone(),
            content_prompt: None,
            model_name: model_name
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(&config.gemini_model)
                .to_string(),
            image_format: config.image_format.clone(),
            image_width: config.image_width,
            image_height: config.image_height,
            storage_bucket: config.storage_bucket.clone(),
            storage_key: None,
        }
    }

    /// Start `content-generation-<username>` in the background.
    pub fn start_pipeline(
        &self,
        username: &str,
        model_name: Option<&str>,
    ) -> Result<RoutineInfo, RegistryError> {
        let workflow_id = pipeline_workflow_id(username);
        let info = self.inner.registry.register(
            &workflow_id,
            RoutineKind::ContentPipeline,
            ReusePolicy::AllowDuplicate,
            self.inner.clock.now(),
        )?;

        let ctx = WorkflowContext::new(workflow_id.clone(), info.run_id.clone(), self.inner.clock.clone());
        let input = self.pipeline_input(username, model_name);
        let pipeline = ContentPipeline::new(self.inner.pipeline.clone());
        self.inner
            .pipeline
            .statuses
            .insert(workflow_id.clone(), pipeline.status());

        let registry = self.inner.registry.clone();
        let handle = tokio::spawn(async move {
            let closed = match pipeline.run(&ctx, &input).await {
                Ok(_) => registry.complete(ctx.workflow_id(), ctx.now()),
                Err(e) => registry.fail(ctx.workflow_id(), e.to_string(), ctx.now()),
            };
            if let Err(e) = closed {
                tracing::debug!(workflow_id = %ctx.workflow_id(), error = %e, "Pipeline routine already closed");
            }
        });
        self.inner.tasks.insert(workflow_id, handle);
        Ok(info)
    }

    pub fn pipeline_status(&self, workflow_id: &str) -> Option<PipelineStatus> {
        self.inner
            .pipeline
            .statuses
            .get(workflow_id)
            .map(|handle| handle.snapshot())
    }

    pub fn transcript(&self, workflow_id: &str) -> Option<Vec<String>> {
        self.inner
            .pipeline
            .transcripts
            .get(workflow_id)
            .map(|handle| handle.snapshot())
    }

    // ------------------------------------------------------------------
    // Polls
    // ------------------------------------------------------------------

    pub async fn parse_poll_request(&self, poll_request: &str) -> Result<ParsedPollRequest, ActivityError> {
        let provider = self.inner.pipeline.provider.as_ref();
        let prompt = self.inner.config.poll_parser_prompt.as_str();
        execute_activity(
            "parse_poll_request",
            &self.inner.pipeline.agent.turn_activity,
            || parse_poll_request(provider, prompt, poll_request),
        )
        .await
    }

    /// One-week poll over `usernames`, paid when a wallet is configured.
    pub fn poll_config(&self, parsed: &ParsedPollRequest) -> PollConfig {
        PollConfig {
            question: parsed.question.clone(),
            allowed_voters: None,
            allowed_options: Some(parsed.usernames.clone()),
            duration_seconds: POLL_DURATION_SECONDS,
            start_blocked: false,
            single_vote: false,
            payment: self.inner.config.payment.as_ref().map(|p| PaymentRequirement {
                wallet: p.wallet_address.clone(),
                amount: p.amount,
            }),
        }
    }

    /// Start a poll, or return the one already registered under `poll_id`.
    pub async fn create_poll(&self, poll_id: &str, config: PollConfig) -> Result<PollCreation, AppError> {
        let info = match self.inner.registry.register(
            poll_id,
            RoutineKind::Poll,
            ReusePolicy::AllowDuplicateFailedOnly,
            self.inner.clock.now(),
        ) {
            Ok(info) => info,
            Err(RegistryError::AlreadyStarted(id)) => {
                if let Some(existing) = self.poll(&id) {
                    tracing::info!(poll_id = %id, "Poll already exists");
                    return Ok(PollCreation {
                        handle: existing,
                        created: false,
                    });
                }
                return Err(RegistryError::AlreadyStarted(id).into());
            }
            Err(e) => return Err(e.into()),
        };

        let run = match spawn_poll(poll_id, config, self.inner.poll_deps.clone()).await {
            Ok(run) => run,
            Err(e) => {
                self.inner
                    .registry
                    .settle(poll_id, Some(e.to_string()), self.inner.clock.now());
                return Err(e.into());
            }
        };
        let handle = run.handle();
        self.inner.polls.insert(poll_id.to_string(), handle.clone());
        tracing::info!(poll_id = %poll_id, run_id = %info.run_id, "Poll started");

        let registry = self.inner.registry.clone();
        let clock = self.inner.clock.clone();
        let id = poll_id.to_string();
        tokio::spawn(async move {
            let closed = match run.outcome().await {
                Ok(summary) => {
                    tracing::info!(poll_id = %id, voters = summary.voters.len(), "Poll ended");
                    registry.complete(&id, clock.now())
                }
                Err(e) => {
                    tracing::warn!(poll_id = %id, error = %e, "Poll failed");
                    registry.fail(&id, e.to_string(), clock.now())
                }
            };
            if let Err(e) = closed {
                tracing::debug!(poll_id = %id, error = %e, "Poll routine already closed");
            }
        });

        Ok(PollCreation {
            handle,
            created: true,
        })
    }

    pub fn poll(&self, poll_id: &str) -> Option<PollHandle> {
        self.inner.polls.get(poll_id).map(|h| h.clone())
    }

    /// Most recent running polls first.
    pub fn list_polls(&self, limit: usize) -> Vec<RoutineInfo> {
        self.inner
            .registry
            .list(RoutineKind::Poll, usize::MAX)
            .into_iter()
            .filter(|info| info.status == RoutineStatus::Running)
            .take(limit)
            .collect()
    }

    /// Make sure every subject of a new poll gets an image in the poll folder.
    ///
    /// Users with stored content get their latest object copied; the rest
    /// go through the image fan-out.
    pub fn start_poll_images(&self, poll_id: &str, usernames: Vec<String>) {
        let state = self.clone();
        let poll_id = poll_id.to_string();
        tokio::spawn(async move {
            let storage = state.storage();
            let existing = match storage.list_top_level_folders().await {
                Ok(folders) => folders,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to list existing creators");
                    Vec::new()
                }
            };

            let (known, fresh): (Vec<String>, Vec<String>) =
                usernames.into_iter().partition(|u| existing.contains(u));

            if !known.is_empty() {
                tracing::info!(count = known.len(), users = ?known, "Copying existing images");
            }
            for username in known {
                let storage = storage.clone();
                let poll_id = poll_id.clone();
                tokio::spawn(async move {
                    copy_latest_image(storage.as_ref(), &poll_id, &username).await;
                });
            }

            if !fresh.is_empty() {
                tracing::info!(count = fresh.len(), users = ?fresh, "Starting image generation");
                if let Err(e) = state.start_fanout(&poll_id, fresh) {
                    tracing::error!(poll_id = %poll_id, error = %e, "Failed to start poll image generation");
                }
            }
        });
    }

    fn start_fanout(&self, poll_id: &str, usernames: Vec<String>) -> Result<RoutineInfo, RegistryError> {
        let workflow_id = fanout_workflow_id(poll_id);
        let info = self.inner.registry.register(
            &workflow_id,
            RoutineKind::PollImages,
            ReusePolicy::AllowDuplicateFailedOnly,
            self.inner.clock.now(),
        )?;

        let ctx = WorkflowContext::new(workflow_id.clone(), info.run_id.clone(), self.inner.clock.clone());
        let input = PollImageGenerationInput {
            poll_id: poll_id.to_string(),
            usernames,
            base: self.pipeline_input("", None),
        };
        let deps = self.inner.pipeline.clone();
        let registry = self.inner.registry.clone();
        let handle = tokio::spawn(async move {
            let report = generate_poll_images(&ctx, &input, deps).await;
            tracing::debug!(poll_id = %report.poll_id, succeeded = report.succeeded(), "Fan-out report");
            if let Err(e) = registry.complete(ctx.workflow_id(), ctx.now()) {
                tracing::debug!(workflow_id = %ctx.workflow_id(), error = %e, "Fan-out routine already closed");
            }
        });
        self.inner.tasks.insert(workflow_id, handle);
        Ok(info)
    }

    /// Terminate the poll and its fan-out, then delete `<poll_id>/` objects.
    pub async fn delete_poll(&self, poll_id: &str) -> Result<usize, StorageError> {
        let now = self.inner.clock.now();

        if let Err(e) = self.inner.registry.terminate(poll_id, DELETED_REASON, now) {
            tracing::warn!(poll_id = %poll_id, error = %e, "Failed to terminate poll routine");
        }
        if let Some((_, handle)) = self.inner.polls.remove(poll_id) {
            handle.stop().await;
        }

        let fanout_id = fanout_workflow_id(poll_id);
        if let Err(e) = self.inner.registry.terminate(&fanout_id, DELETED_REASON, now) {
            tracing::warn!(workflow_id = %fanout_id, error = %e, "Failed to terminate image generation routine");
        }
        if let Some((_, task)) = self.inner.tasks.remove(&fanout_id) {
            task.abort();
        }

        let removed = self.storage().delete_prefix(&format!("{poll_id}/")).await?;
        tracing::info!(poll_id = %poll_id, removed, "Poll deleted");
        Ok(removed)
    }

    /// Public URL of a subject's poll image, if it exists yet.
    pub async fn poll_image_url(&self, poll_id: &str, option: &str) -> Result<Option<String>, StorageError> {
        let key = poll_image_key(poll_id, option, &self.inner.config.image_format);
        self.storage().stat(&key).await
    }
}

/// Copy a user's newest stored object into the poll folder.
async fn copy_latest_image(storage: &dyn ObjectStorage, poll_id: &str, username: &str) {
    let latest = match storage.latest_key_with_prefix(username).await {
        Ok(Some(key)) => key,
        Ok(None) => {
            tracing::warn!(username = %username, "No stored image for existing creator");
            return;
        }
        Err(e) => {
            tracing::error!(username = %username, error = %e, "Failed to find latest image");
            return;
        }
    };

    let filename = latest.rsplit('/').next().unwrap_or(&latest);
    let extension = filename.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    let destination = poll_image_key(poll_id, username, extension);
    match storage.copy(&latest, &destination).await {
        Ok(()) => tracing::info!(username = %username, destination_key = %destination, "Copied existing image to poll folder"),
        Err(e) => tracing::error!(username = %username, error = %e, "Failed to copy image to poll folder"),
    }
}
