//! HTTP surface: router, state, and serving

pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;

use crate::auth::cache::CredentialCache;
use crate::auth::token::TokenKeys;
use crate::hub::HubHandle;
use crate::ingest::IngestQueue;
use crate::metrics::PipelineMetrics;
use crate::record::RecordLimits;
use crate::store::{LogStore, ProjectDirectory};
use crate::wal::Wal;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Request deadline for the plain HTTP routes (not the websocket upgrade).
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Admin basic-auth pair guarding the metrics endpoint.
#[derive(Clone)]
pub struct AdminAuth {
    pub user: String,
    pub password: String,
}

/// Everything the handlers need, threaded through axum state.
#[derive(Clone)]
pub struct AppState {
    pub wal: Arc<Wal>,
    pub queue: IngestQueue,
    pub hub: HubHandle,
    pub credentials: Arc<CredentialCache>,
    pub tokens: Arc<TokenKeys>,
    pub logs: Arc<dyn LogStore>,
    pub directory: Arc<dyn ProjectDirectory>,
    pub metrics: Arc<PipelineMetrics>,
    pub limits: RecordLimits,
    pub subscriber_buffer: usize,
    pub admin: Option<AdminAuth>,
    /// Project the service logs its own requests into, when configured.
    pub internal_project_id: Option<i32>,
}

/// Assemble the full route table.
///
/// The websocket route sits outside the request timeout; everything else is
/// bounded. Self-observation wraps the whole router and skips the ingest
/// path itself.
pub fn build_router(state: AppState) -> Router {
    let timed = Router::new()
        .route(
            "/logs",
            axum::routing::post(handlers::ingest).get(handlers::search),
        )
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    Router::new()
        .merge(timed)
        .route("/logs/ws", get(handlers::tail))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::self_observe,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the token is cancelled, then finish in-flight requests.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
