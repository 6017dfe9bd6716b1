//! rollcall API server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rollcall_api::notify::{LogNotifier, WebhookConfig, WebhookNotifier};
use rollcall_api::{router, AppState, AttendanceService};
use rollcall_core::{defaults, AbsenceNotifier, PipelineConfig};
use rollcall_db::{Database, FilesystemBlobStore, PoolConfig};
use rollcall_inference::{HttpOcrBackend, LlmReasoningService, OllamaBackend};
use rollcall_jobs::{
    PrecheckConfig, RecognitionHandler, RetryScheduler, WorkerBuilder, WorkerConfig,
};

/// Parse allowed CORS origins from `ALLOWED_ORIGINS` (comma-separated).
fn parse_allowed_origins() -> Vec<HeaderValue> {
    let origins_str =
        std::env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| "http://localhost:3000".to_string());

    origins_str
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "rollcall_api=debug,rollcall_jobs=debug,rollcall_inference=info,tower_http=debug".into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("rollcall-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/rollcall".to_string());
    let blob_path = std::env::var("BLOB_STORAGE_PATH")
        .unwrap_or_else(|_| defaults::BLOB_STORAGE_PATH.to_string());
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(defaults::SERVER_PORT);

    FilesystemBlobStore::new(&blob_path)
        .validate()
        .await
        .map_err(|e| anyhow::anyhow!("blob storage at {} is unusable: {}", blob_path, e))?;
    info!("Blob storage at {}", blob_path);

    info!("Connecting to database...");
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env(), &blob_path).await?;
    info!("Database connected");

    info!("Running database migrations...");
    db.migrate().await?;
    info!("Database migrations complete");

    let pipeline = PipelineConfig::from_env();
    let scheduler = RetryScheduler::system(db.jobs.clone());

    let notifier: Arc<dyn AbsenceNotifier> = match WebhookConfig::from_env() {
        Some(config) => {
            info!(url = %config.url, signed = config.secret.is_some(), "Absence webhook configured");
            Arc::new(WebhookNotifier::new(config))
        }
        None => {
            info!("NOTIFY_WEBHOOK_URL not set, absence notices are logged only");
            Arc::new(LogNotifier)
        }
    };

    let worker_config = WorkerConfig::from_env();
    let worker_handle = if worker_config.enabled {
        let ocr = HttpOcrBackend::from_env();
        let reasoning = LlmReasoningService::new(Arc::new(OllamaBackend::from_env()));
        let handler = RecognitionHandler::new(
            db.clone(),
            Arc::new(ocr),
            Arc::new(reasoning),
            scheduler.clone(),
        )
        .with_config(pipeline)
        .with_precheck(PrecheckConfig::from_env());

        let worker = WorkerBuilder::new(db.clone())
            .with_config(worker_config)
            .with_handler(handler)
            .with_scheduler(scheduler.clone())
            .build();
        let handle = worker.start();
        info!("Job worker started");
        Some(handle)
    } else {
        info!("Job worker disabled");
        None
    };

    let attendance = AttendanceService::new(db.clone(), scheduler, notifier);
    let app = router(AppState::new(db, attendance)).layer(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parse_allowed_origins()))
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
            .allow_headers([
                header::AUTHORIZATION,
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::HeaderName::from_static(rollcall_api::tenant::SCHOOL_HEADER),
                header::HeaderName::from_static(rollcall_api::tenant::ACTOR_HEADER),
            ])
            .max_age(std::time::Duration::from_secs(3600)),
    );

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = worker_handle {
        handle.shutdown().await?;
        info!("Job worker stopped");
    }

    Ok(())
}
