//! Typed identity extractors
//!
//! Handlers declare the identity they need in their signature; the extractor
//! does the validation. There is no per-request bag of values to mistype.

use crate::auth::context::{ProjectBinding, UserIdentity};
use crate::server::error::ApiError;
use crate::server::AppState;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use std::collections::HashMap;

/// Pull the bearer value out of `Authorization: Bearer <value>`.
fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, value) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

/// Ingest-path identity: `X-Api-Key` plus the secret as a bearer token,
/// validated through the credential cache.
impl FromRequestParts<AppState> for ProjectBinding {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let api_key = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let (Some(api_key), Some(api_secret)) = (api_key, bearer_token(parts)) else {
            state.metrics.auth_failures.inc();
            return Err(ApiError::unauthorized());
        };

        match state.credentials.validate(&api_key, &api_secret).await {
            Some(project_id) => Ok(ProjectBinding { project_id }),
            None => {
                state.metrics.auth_failures.inc();
                Err(ApiError::unauthorized())
            }
        }
    }
}

/// Query-path identity: a user JWT, from the Authorization header or (for
/// websocket clients, which cannot set headers from browsers) the `token`
/// query parameter.
impl FromRequestParts<AppState> for UserIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = match bearer_token(parts) {
            Some(token) => Some(token),
            None => Query::<HashMap<String, String>>::from_request_parts(parts, state)
                .await
                .ok()
                .and_then(|Query(params)| params.get("token").cloned()),
        };

        let Some(token) = token else {
            state.metrics.auth_failures.inc();
            return Err(ApiError::unauthorized());
        };

        state.tokens.verify(&token).map_err(|_| {
            state.metrics.auth_failures.inc();
            ApiError::unauthorized()
        })
    }
}
