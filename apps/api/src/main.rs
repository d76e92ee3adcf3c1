mod blob;
mod config;
mod db;
mod dispatch;
mod enhancement;
mod errors;
mod guard;
mod llm_client;
mod models;
mod routes;
mod sources;
mod state;
mod store;

use anyhow::{Context, Result};
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use std::sync::Arc;

use crate::blob::S3BlobStore;
use crate::config::{Config, ProviderKind, RetryQueueKind};
use crate::db::create_pool;
use crate::dispatch::webhook::WebhookProvider;
use crate::dispatch::{DispatchClient, EnhancementProvider};
use crate::enhancement::orchestrator::Orchestrator;
use crate::enhancement::retry::RetryController;
use crate::enhancement::scheduler::{
    drive_queue, run_redis_poller, DriveScheduler, DriveSender, LocalScheduler, RedisScheduler,
};
use crate::enhancement::store::RequestStore;
use crate::llm_client::provider::LlmProvider;
use crate::llm_client::LlmClient;
use crate::routes::build_router;
use crate::sources::SourceStore;
use crate::state::AppState;
use crate::store::postgres::PgDocumentStore;
use crate::store::DocumentStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Enhance API v{}", env!("CARGO_PKG_VERSION"));

    // Document store: PostgreSQL plus the LISTEN-backed change feed
    let db = create_pool(&config.database_url).await?;
    let documents = PgDocumentStore::new(db);
    documents.start_change_feed().await?;
    let documents: Arc<dyn DocumentStore> = Arc::new(documents);

    // Blob store: S3 / MinIO
    let s3 = build_s3_client(&config).await;
    let blobs = Arc::new(S3BlobStore::new(s3, config.s3_bucket.clone()));
    info!("S3 client initialized (bucket: {})", config.s3_bucket);

    let provider = build_provider(&config)?;
    info!("Enhancement provider: {}", provider.name());

    // Drive queue and the scheduler feeding it
    let (queue_tx, queue_rx) = drive_queue();
    let scheduler = build_scheduler(&config, queue_tx)?;

    let sources = SourceStore::new(Arc::clone(&documents), blobs);
    let orchestrator = Arc::new(Orchestrator::new(
        RequestStore::new(documents),
        sources.clone(),
        DispatchClient::new(provider, config.dispatch_timeout),
        RetryController::new(
            config.max_attempts,
            config.retry_base_delay,
            config.retry_max_delay,
        ),
        scheduler,
        config.processing_timeout,
    ));
    tokio::spawn(Arc::clone(&orchestrator).run_worker(queue_rx));

    // Build app state
    let state = AppState {
        orchestrator,
        sources,
        provider_secret: Arc::from(config.provider_shared_secret.as_str()),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins once the frontend host is fixed

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_provider(config: &Config) -> Result<Arc<dyn EnhancementProvider>> {
    match config.provider {
        ProviderKind::Webhook => {
            let url = config
                .provider_webhook_url
                .clone()
                .context("PROVIDER_WEBHOOK_URL is not set")?;
            let webhook = WebhookProvider::new(
                url,
                config.provider_shared_secret.clone(),
                config.dispatch_timeout,
            )?;
            Ok(Arc::new(webhook))
        }
        ProviderKind::Anthropic => {
            let api_key = config
                .anthropic_api_key
                .clone()
                .context("ANTHROPIC_API_KEY is not set")?;
            let mut llm = LlmClient::new(api_key, config.dispatch_timeout)?;
            if let Some(url) = &config.anthropic_api_url {
                llm = llm.with_endpoint(url.clone());
            }
            info!("LLM client initialized (model: {})", llm_client::MODEL);
            Ok(Arc::new(LlmProvider::new(llm)))
        }
    }
}

fn build_scheduler(config: &Config, queue: DriveSender) -> Result<Arc<dyn DriveScheduler>> {
    match config.retry_queue {
        RetryQueueKind::Local => {
            info!("Using in-process retry timers; scheduled drives do not survive a restart");
            Ok(Arc::new(LocalScheduler::new(queue)))
        }
        RetryQueueKind::Redis => {
            let redis = redis::Client::open(config.redis_url.clone())?;
            info!("Redis client initialized");
            tokio::spawn(run_redis_poller(
                redis.clone(),
                config.retry_queue_key.clone(),
                queue,
                config.retry_poll_interval,
            ));
            Ok(Arc::new(RedisScheduler::new(
                redis,
                config.retry_queue_key.clone(),
            )))
        }
    }
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "enhance-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
