//! Router-level middleware

use crate::record::LogRecord;
use crate::server::AppState;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use std::time::Instant;
use tracing::debug;

/// Log every non-ingest request into the service's own pipeline.
///
/// Active only when an internal project id is configured. The ingest route
/// is excluded so the service does not feed on its own feeding.
pub async fn self_observe(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(project_id) = state.internal_project_id else {
        return next.run(request).await;
    };

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if method == Method::POST && path == "/logs" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status();

    let level = if status.is_server_error() {
        "error"
    } else if status.is_client_error() {
        "warn"
    } else {
        "info"
    };

    let mut batch = vec![LogRecord {
        timestamp: Utc::now(),
        level: level.to_string(),
        message: format!(
            "[{}] {} {} | {:?}",
            status.as_u16(),
            method,
            path,
            start.elapsed()
        ),
        service: "logflume-internal".to_string(),
        project_id,
        data: None,
        segment_id: 0,
    }];

    // Best effort: a full queue or a WAL hiccup must not fail user traffic.
    match state.wal.write_batch(&mut batch).await {
        Ok(_) => {
            state.queue.enqueue(batch);
        }
        Err(e) => debug!(error = %e, "self-observation record not persisted"),
    }

    response
}
