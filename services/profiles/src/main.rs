use anyhow::{Context, Result};
use profiles_messaging::{EventConsumer, EventProducer};
use profiles_service::api::{start_api_server, AppState};
use profiles_service::auth::BearerVerifier;
use profiles_service::config::Config;
use profiles_service::inbox::{InboxIngress, InboxWorker};
use profiles_service::outbox::{KafkaEventPublisher, OutboxDispatcher, OutboxWriter};
use profiles_service::pg_store::PgStore;
use profiles_service::s3_store::S3ObjectStore;
use profiles_service::service::ProfileService;
use profiles_service::upload_session::UploadSessionManager;
use profiles_service::upload_token::UploadTokenManager;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting profiles service");

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        PgStore::new(&config.database)
            .await
            .context("Failed to initialize profile store")?,
    );

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let objects = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 object store")?,
    );

    let service = Arc::new(ProfileService::new(
        store.clone(),
        UploadSessionManager::new(objects, &config.avatar),
        UploadTokenManager::new(
            config.service.name.clone(),
            &config.upload_token.secret,
            config.avatar.upload_ttl(),
        ),
        OutboxWriter::new(config.kafka.topics.profiles.clone(), config.service.name.clone()),
    ));

    let producer = EventProducer::new(&config.kafka).context("Failed to create Kafka producer")?;
    let publisher = Arc::new(KafkaEventPublisher::new(producer));

    let consumer = EventConsumer::new(&config.kafka).context("Failed to create Kafka consumer")?;
    consumer
        .subscribe(&[config.kafka.topics.accounts.as_str()])
        .context("Failed to subscribe to accounts topic")?;

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // API server
    let api_state = AppState {
        service: service.clone(),
        verifier: Arc::new(BearerVerifier::new(&config.auth)),
    };
    let api_config = config.api.clone();
    let token = shutdown.clone();
    tasks.spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, token.clone()).await {
            error!(error = %e, "API server error");
            token.cancel();
        }
    });

    // Outbox dispatcher
    let dispatcher = OutboxDispatcher::new(store.clone(), publisher, config.outbox.clone());
    let token = shutdown.clone();
    tasks.spawn(async move { dispatcher.run(token).await });

    // Inbox ingress
    let ingress = Arc::new(InboxIngress::new(store.clone()));
    let token = shutdown.clone();
    tasks.spawn(async move {
        if let Err(e) = consumer.run(ingress, token.clone()).await {
            error!(error = %e, "Inbox consumer error");
            token.cancel();
        }
    });

    // Inbox workers
    for id in 0..config.inbox.workers {
        let worker = InboxWorker::new(id, store.clone(), service.clone(), config.inbox.clone());
        let token = shutdown.clone();
        tasks.spawn(async move { worker.run(token).await });
    }

    info!(inbox_workers = config.inbox.workers, "Profiles service started successfully");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {
            warn!("A component failed, shutting down");
        }
    }

    info!("Shutting down profiles service");
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Task panicked");
        }
    }

    info!("Profiles service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
