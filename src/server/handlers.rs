//! Route handlers

use crate::auth::context::{ProjectBinding, UserIdentity};
use crate::hub::client;
use crate::ingest::queue::MicroBatch;
use crate::record::IngestRecord;
use crate::server::error::ApiError;
use crate::server::AppState;
use crate::store::SearchRequest;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, warn};

/// Cap on the read path regardless of the client's `limit`.
const MAX_SEARCH_LIMIT: i64 = 1_000;
const DEFAULT_SEARCH_LIMIT: i64 = 100;

/// Deadline for read queries against the store.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(3);

/// A body that is either one record or an array of records.
#[derive(Deserialize)]
#[serde(untagged)]
enum IngestBody {
    Many(Vec<IngestRecord>),
    One(IngestRecord),
}

/// `POST /logs` — accept a micro-batch.
///
/// 202 means the batch is in the WAL; it becomes queryable after the next
/// worker flush. A full queue is not an error (the WAL replays it on the
/// next startup), but a WAL failure refuses the request outright.
pub async fn ingest(
    State(state): State<AppState>,
    binding: ProjectBinding,
    body: Bytes,
) -> Result<Response, ApiError> {
    let parsed: IngestBody =
        serde_json::from_slice(&body).map_err(|_| ApiError::bad_request("invalid json body"))?;
    let incoming = match parsed {
        IngestBody::Many(records) => records,
        IngestBody::One(record) => vec![record],
    };
    if incoming.is_empty() {
        return Err(ApiError::bad_request("empty batch"));
    }

    let arrival = Utc::now();
    let mut batch: MicroBatch = Vec::with_capacity(incoming.len());
    for record in incoming {
        let enriched = record
            .enrich(binding.project_id, arrival, &state.limits)
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        batch.push(enriched);
    }
    state.metrics.received.inc_by(batch.len() as u64);

    if let Err(e) = state.wal.write_batch(&mut batch).await {
        error!(error = %e, "wal write failed, refusing batch");
        state.metrics.wal_errors.inc();
        state.metrics.dropped.inc_by(batch.len() as u64);
        return Err(ApiError::durability());
    }

    state.queue.enqueue(batch);

    Ok((StatusCode::ACCEPTED, Json(json!({ "message": "accepted" }))).into_response())
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub project_id: i32,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

/// `GET /logs` — bounded search over one project.
pub async fn search(
    State(state): State<AppState>,
    user: UserIdentity,
    Query(params): Query<SearchParams>,
) -> Result<Response, ApiError> {
    authorize(&state, params.project_id, user.user_id).await?;

    let retention_days = state
        .directory
        .retention_days(params.project_id)
        .await
        .map_err(|e| {
            error!(error = %e, "retention lookup failed");
            ApiError::internal()
        })?;

    let request = SearchRequest {
        project_id: params.project_id,
        text: params.q.filter(|q| !q.is_empty()),
        limit: params
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT),
        offset: params.offset.unwrap_or(0).max(0),
        since: Utc::now() - ChronoDuration::days(retention_days),
    };

    let logs = tokio::time::timeout(SEARCH_TIMEOUT, state.logs.search(&request))
        .await
        .map_err(|_| {
            warn!(project_id = request.project_id, "search timed out");
            ApiError::internal()
        })?
        .map_err(|e| {
            error!(error = %e, "search failed");
            ApiError::internal()
        })?;

    Ok(Json(json!({ "logs": logs })).into_response())
}

#[derive(Deserialize)]
pub struct TailParams {
    pub project_id: i32,
}

/// `GET /logs/ws` — live tail. Authorization happens before the upgrade;
/// the hub trusts the identities we hand it.
pub async fn tail(
    State(state): State<AppState>,
    user: UserIdentity,
    Query(params): Query<TailParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    authorize(&state, params.project_id, user.user_id).await?;

    let hub = state.hub.clone();
    let buffer = state.subscriber_buffer;
    Ok(ws
        .max_message_size(client::MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| {
            client::serve(socket, hub, params.project_id, user.user_id, buffer)
        }))
}

/// `GET /healthz` — liveness.
pub async fn healthz() -> Response {
    (StatusCode::OK, "ok").into_response()
}

/// `GET /metrics` — Prometheus exposition, basic-auth when configured.
pub async fn metrics(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Some(admin) = &state.admin {
        if !basic_auth_ok(&headers, admin) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"metrics\"")],
                "unauthorized",
            )
                .into_response();
        }
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

/// Deny with 403 unless the user holds any role on the project.
async fn authorize(state: &AppState, project_id: i32, user_id: i32) -> Result<(), ApiError> {
    match state.directory.role(project_id, user_id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => {
            state.metrics.auth_failures.inc();
            Err(ApiError::forbidden())
        }
        Err(e) => {
            error!(error = %e, "role lookup failed");
            Err(ApiError::internal())
        }
    }
}

fn basic_auth_ok(headers: &axum::http::HeaderMap, admin: &crate::server::AdminAuth) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    match pair.split_once(':') {
        Some((user, password)) => user == admin.user && password == admin.password,
        None => false,
    }
}
