use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, Method};
use ractor::Actor;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reportcard::activities::content::GeminiImageClient;
use reportcard::activities::gh::GhCommandExecutor;
use reportcard::activities::llm::ResponsesClient;
use reportcard::activities::payment::HttpPaymentWatcher;
use reportcard::activities::storage::LocalObjectStorage;
use reportcard::actors::event_store::{
    AppendEvent, EventStoreActor, EventStoreArguments, EventStoreMsg,
};
use reportcard::actors::poll::PaymentWatcher;
use reportcard::api;
use reportcard::app_state::{AppState, Services};
use reportcard::config::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reportcard=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    load_env_file();
    let config = AppConfig::from_env()?;
    tracing::info!(port = config.port, "Configuration loaded and validated");

    tracing::info!(path = %config.database_url, "Connecting to journal database");
    let (event_store, _handle) = Actor::spawn(
        None,
        EventStoreActor,
        EventStoreArguments::File(config.database_url.clone()),
    )
    .await
    .context("failed to start event store")?;

    let startup = AppendEvent::new(
        "system.startup",
        serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
        "system",
    )?;
    match ractor::call!(event_store, |reply| EventStoreMsg::Append {
        event: startup,
        reply,
    }) {
        Ok(Ok(event)) => tracing::info!(seq = event.seq, "Startup event logged"),
        Ok(Err(e)) => tracing::error!(error = %e, "Failed to log startup"),
        Err(e) => tracing::error!(error = %e, "Event store RPC failed"),
    }

    let services = build_services(&config)?;
    let storage_root = config.storage_root.clone();
    let port = config.port;
    let app_state = AppState::new(config, services, event_store);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600));

    let app = api::router()
        .with_state(api::ApiState { app_state })
        .nest_service("/storage", ServeDir::new(storage_root))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Starting HTTP server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server exiting");
    Ok(())
}

fn build_services(config: &AppConfig) -> anyhow::Result<Services> {
    let provider = ResponsesClient::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    )?;
    let images = GeminiImageClient::new(config.google_api_key.clone())?;
    let storage = LocalObjectStorage::new(
        config.storage_root.clone(),
        config.storage_bucket.clone(),
        config.public_base_url.clone(),
    );

    let payment_watcher: Option<Arc<dyn PaymentWatcher>> = match &config.payment {
        Some(payment) => {
            tracing::info!(
                wallet = %payment.wallet_address,
                amount = payment.amount,
                network = %payment.network,
                "Poll payments enabled"
            );
            Some(Arc::new(HttpPaymentWatcher::new()?))
        }
        None => None,
    };

    Ok(Services {
        provider: Arc::new(provider),
        executor: Arc::new(GhCommandExecutor::new(config.github_token.clone())),
        images: Arc::new(images),
        storage: Arc::new(storage),
        payment_watcher,
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down gracefully");
}
