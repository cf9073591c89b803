mod api;
mod config;
mod error;
mod models;
mod queue;
mod repo;
mod services;
mod storage;
mod workers;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::Config;
use crate::queue::{bitrate_queue_name, Broker, WorkQueue, MASTER_QUEUE};
use crate::services::{HlsTranscoder, StreamCache, StreamingService};
use crate::workers::{
    BitrateWorker, DeletionWorker, IntakeWorker, MasterWorker, BITRATE_CONCURRENCY,
    MASTER_CONCURRENCY,
};

/// In-flight jobs get this long to drain after a shutdown signal.
const SHUTDOWN_DRAIN_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,audiobook_streaming=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded ({} mode)", config.node_env);

    // Connect to database
    let db = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Connected to database");

    // Run migrations
    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("Database migrations completed");

    // Connect to Redis
    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis = redis::aio::ConnectionManager::new(redis_client).await?;
    tracing::info!("Connected to Redis");

    // Object storage
    let storage = storage::from_config(&config).await?;
    storage.probe().await?;
    tracing::info!("Object storage ready ({})", storage.provider());

    // RabbitMQ intake exchange and deletion topic
    let broker = Arc::new(Broker::connect(&config.rabbitmq_url, config.rabbitmq_message_ttl).await?);

    // Cache and work queues
    let cache = Arc::new(StreamCache::new(redis.clone(), config.streaming_cache_ttl));
    let mut bitrate_queues: HashMap<u32, WorkQueue> = HashMap::new();
    for bitrate in &config.transcoding_bitrates {
        bitrate_queues.insert(
            *bitrate,
            WorkQueue::new(
                bitrate_queue_name(*bitrate),
                redis.clone(),
                config.job_max_attempts,
                config.job_backoff_delay_ms,
                config.job_timeout_ms,
            ),
        );
    }
    let master_queue = WorkQueue::new(
        MASTER_QUEUE,
        redis.clone(),
        config.job_max_attempts,
        config.job_backoff_delay_ms,
        config.job_timeout_ms,
    );

    let transcoder = HlsTranscoder::new(config.ffmpeg_path.clone(), config.ffprobe_path.clone());
    let streaming = Arc::new(StreamingService::new(
        db.clone(),
        cache.clone(),
        storage.clone(),
        config.transcoding_bitrates.clone(),
        config.hls_segment_duration,
    ));

    // Shutdown fan-out: signal handler flips the watch, workers drain.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(handle_signals(shutdown_tx));

    let mut worker_handles = Vec::new();

    let intake = Arc::new(IntakeWorker::new(
        db.clone(),
        broker.clone(),
        bitrate_queues.clone(),
        master_queue.clone(),
        config.hls_segment_duration,
    ));
    worker_handles.push(tokio::spawn(intake.run(shutdown_rx.clone())));

    for (bitrate, queue) in &bitrate_queues {
        let handler = Arc::new(BitrateWorker::new(
            db.clone(),
            storage.clone(),
            transcoder.clone(),
            PathBuf::from(&config.storage_local_path),
            config.transcoding_bitrates.clone(),
            config.is_development(),
        ));
        tracing::info!("Starting bitrate worker for {}k", bitrate);
        worker_handles.push(tokio::spawn(queue.clone().run(
            BITRATE_CONCURRENCY,
            handler,
            shutdown_rx.clone(),
        )));
    }

    let master_handler = Arc::new(MasterWorker::new(db.clone(), storage.clone()));
    worker_handles.push(tokio::spawn(master_queue.clone().run(
        MASTER_CONCURRENCY,
        master_handler,
        shutdown_rx.clone(),
    )));

    let deletion = Arc::new(DeletionWorker::new(
        db.clone(),
        broker.clone(),
        storage.clone(),
        cache.clone(),
    ));
    worker_handles.push(tokio::spawn(deletion.run(shutdown_rx.clone())));

    // Build router
    let app_state = Arc::new(AppState {
        db: db.clone(),
        streaming,
        cache,
        storage,
        broker,
    });

    let app = Router::new()
        .nest("/api/v1/stream", api::stream_routes())
        .with_state(app_state)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::RANGE,
                    header::CONTENT_RANGE,
                    HeaderName::from_static("user_id"),
                ])
                .expose_headers([header::CONTENT_RANGE, header::ACCEPT_RANGES]),
        );

    // Start server
    let addr = format!("0.0.0.0:{}", config.streaming_port);
    tracing::info!("Starting streaming server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await?;

    // Bounded drain of in-flight jobs, then exit.
    tracing::info!("Server stopped, draining workers");
    let drain = futures::future::join_all(worker_handles);
    if tokio::time::timeout(tokio::time::Duration::from_secs(SHUTDOWN_DRAIN_SECS), drain)
        .await
        .is_err()
    {
        tracing::warn!("Workers did not drain within {}s, exiting anyway", SHUTDOWN_DRAIN_SECS);
    }

    db.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Flip the shutdown watch on SIGTERM, SIGINT or SIGUSR2.
async fn handle_signals(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = unix_signal(tokio::signal::unix::SignalKind::terminate(), "SIGTERM");

    #[cfg(unix)]
    let user_defined2 = unix_signal(tokio::signal::unix::SignalKind::user_defined2(), "SIGUSR2");

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(not(unix))]
    let user_defined2 = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
        _ = user_defined2 => tracing::info!("Received SIGUSR2, shutting down"),
    }

    let _ = shutdown_tx.send(true);
}

#[cfg(unix)]
async fn unix_signal(kind: tokio::signal::unix::SignalKind, name: &str) {
    match tokio::signal::unix::signal(kind) {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            tracing::error!("Failed to install {} handler: {}", name, e);
            std::future::pending::<()>().await;
        }
    }
}
