use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use review_relay::config::{AppConfig, ConfigError};
use review_relay::jobqueue::{JobRunner, JobStore, RestError, RestHooks, StoreError};
use review_relay::providers::CaptureSink;
use review_relay::server::{AppState, InboundEvent, build_router};

/// Inbound events waiting for the consumer.
const EVENT_BUFFER: usize = 256;

/// Per-request timeout for forge API calls made by queue jobs.
const FORGE_API_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Forge(#[from] RestError),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "review_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "review-relay failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = AppConfig::from_env()?;
    let store = JobStore::open(&config.database_path)?;
    let runner = JobRunner::new(
        store.clone(),
        RestHooks::new(FORGE_API_TIMEOUT)?,
        config.queue.clone(),
    );

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let state = AppState::builder(Arc::new(store))
        .default_secret(config.webhook_secret.clone())
        .secret_ttl(config.secret_cache_ttl)
        .capture(CaptureSink::from_option(config.capture_dir.clone()))
        .events(events_tx)
        .build();

    let cancel = CancellationToken::new();
    let consumer = tokio::spawn(consume_events(events_rx, cancel.clone()));
    let jobs = {
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(cancel).await })
    };

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %config.bind, db = %config.database_path.display(), "listening");

    let shutdown = cancel.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    if let Err(e) = consumer.await {
        error!(error = %e, "Event consumer panicked");
    }
    match jobs.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Job runner failed"),
        Err(e) => error!(error = %e, "Job runner panicked"),
    }
    Ok(())
}

/// Drains accepted events until shutdown. Review dispatch needs a model
/// client and forge access, which are wired in by the embedding service;
/// here events are only logged.
async fn consume_events(mut events: mpsc::Receiver<InboundEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = events.recv() => {
                let Some(inbound) = next else { break };
                info!(
                    connector = %inbound.connector_id,
                    provider = %inbound.event.provider,
                    event_type = inbound.event.event_type(),
                    repo = %inbound.event.repository.full_name,
                    "Canonical event received"
                );
            }
        }
    }
}
