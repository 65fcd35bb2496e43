use logflume::auth::cache::CredentialCache;
use logflume::auth::token::TokenKeys;
use logflume::config::Config;
use logflume::ingest::{self, EngineConfig, IngestionEngine, JanitorConfig, SegmentJanitor};
use logflume::metrics::PipelineMetrics;
use logflume::server::{self, AdminAuth, AppState};
use logflume::store::PostgresStore;
use logflume::wal::Wal;
use logflume::{hub, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// How long in-flight HTTP requests get to finish after the stop signal.
const HTTP_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().await?;
    init_logging(&config);

    info!("starting LogFlume v{}", logflume::VERSION);

    if config.secrets.db_password.is_empty() {
        return Err("DB_PASSWORD environment variable is not set".into());
    }
    if config.secrets.jwt_secret.is_empty() {
        return Err("JWT_SECRET environment variable is not set".into());
    }

    // Store first: recovery needs it before anything else moves.
    let store = Arc::new(PostgresStore::connect(&config.database_url()).await?);
    store.ensure_schema().await?;

    let wal = Arc::new(Wal::open(config.wal_config())?);

    // Replay anything a previous process accepted but never flushed. This
    // must finish before the listener binds; failure here is fatal.
    let report = ingest::replay(wal.as_ref(), store.as_ref()).await?;
    if report.replayed > 0 {
        info!(records = report.replayed, "recovered unsaved records");
    }

    let metrics = Arc::new(PipelineMetrics::new()?);
    let root_cancel = CancellationToken::new();
    let http_cancel = CancellationToken::new();

    // Fan-out hub.
    let (hub, hub_handle) = hub::hub(metrics.clone(), root_cancel.clone());
    let hub_task = hub.spawn();

    // Queue, workers, janitor, WAL sync ticker.
    let (queue, queue_rx) = ingest::queue::channel(config.ingest.queue_size, metrics.clone());
    let (commit_tx, commit_rx) = ingest::commit_channel();

    let engine = IngestionEngine::start(
        EngineConfig {
            worker_count: config.ingest.worker_count,
            batch_size: config.ingest.batch_size,
            flush_interval: Duration::from_millis(config.ingest.flush_interval_ms),
        },
        queue_rx,
        store.clone(),
        hub_handle.clone(),
        commit_tx,
        metrics.clone(),
        root_cancel.clone(),
    );

    let janitor_task = SegmentJanitor::new(
        wal.clone(),
        commit_rx,
        JanitorConfig {
            sweep_interval: Duration::from_secs(config.janitor.sweep_interval_secs),
        },
        root_cancel.clone(),
    )
    .spawn();

    let sync_task = wal.spawn_sync_ticker(root_cancel.clone());
    let sweeper_task = store.spawn_retention_sweeper(root_cancel.clone());

    // HTTP surface.
    let admin = match (&config.secrets.admin_user, &config.secrets.admin_pass) {
        (Some(user), Some(password)) => Some(AdminAuth {
            user: user.clone(),
            password: password.clone(),
        }),
        _ => None,
    };

    let state = AppState {
        wal: wal.clone(),
        queue,
        hub: hub_handle,
        credentials: Arc::new(CredentialCache::new(
            store.clone(),
            Duration::from_secs(config.auth.cache_ttl_secs),
        )),
        tokens: Arc::new(TokenKeys::new(&config.secrets.jwt_secret)),
        logs: store.clone(),
        directory: store.clone(),
        metrics: metrics.clone(),
        limits: config.record_limits(),
        subscriber_buffer: config.hub.send_buffer,
        admin,
        internal_project_id: config.secrets.internal_project_id,
    };

    let router = server::build_router(state);
    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.bind_addr, config.port)).await?;

    let mut server_task = {
        let shutdown = http_cancel.clone();
        tokio::spawn(async move { server::serve(listener, router, shutdown).await })
    };

    info!(
        port = config.port,
        workers = config.ingest.worker_count,
        "LogFlume ready"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received shutdown signal"),
        result = &mut server_task => {
            error!("http server exited unexpectedly");
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
    }

    // Stop accepting requests, give in-flight ones a grace period.
    http_cancel.cancel();
    if tokio::time::timeout(HTTP_GRACE, &mut server_task).await.is_err() {
        warn!("grace period expired with requests still in flight");
        server_task.abort();
    }

    // Cancel the pipeline: workers drain, janitor and hub exit.
    root_cancel.cancel();
    engine.shutdown().await;
    let _ = janitor_task.await;
    let _ = hub_task.await;
    let _ = sweeper_task.await;
    let _ = sync_task.await;

    if let Err(e) = wal.close().await {
        warn!(error = %e, "wal close failed");
    }

    info!("shutdown complete");
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if config.logging.format == "json" {
        let subscriber = fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set tracing subscriber");
    } else {
        let subscriber = fmt().with_env_filter(filter).finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set tracing subscriber");
    }
}
