//! Request dispatch.
//!
//! One fallback handler serves every path and routes on method:
//! 1. `OPTIONS` answers the CORS preflight
//! 2. `GET` serves the read-only audit queries
//! 3. `POST` runs the sync pipeline
//!
//! Anything else is a 405.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::audit::{AuditRecorder, EventStore, InMemoryEventStore};
use crate::error::{now_rfc3339, RelayError};
use crate::normalize::normalize;
use crate::notify::Notifier;
use crate::sync::{build_http_client, SparkLoopClient, SubscriberApi, Synchronizer};
use crate::web::rate_limit::{source_key, RateLimiter};
use crate::web::signature::{is_auth_enabled, verify_request, verify_token};
use crate::Config;

/// Page size for `GET .../events` when no `limit` is given.
pub const DEFAULT_EVENTS_LIMIT: usize = 50;

/// Largest page `GET .../events` will return.
pub const MAX_EVENTS_LIMIT: usize = 1000;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub synchronizer: Arc<Synchronizer<Arc<dyn SubscriberApi>>>,
    pub recorder: AuditRecorder,
    pub notifier: Notifier,
}

impl AppState {
    pub fn new(
        config: Config,
        api: Arc<dyn SubscriberApi>,
        store: Arc<dyn EventStore>,
        notifier: Notifier,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window());
        Self {
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            synchronizer: Arc::new(Synchronizer::new(api)),
            recorder: AuditRecorder::new(store),
            notifier,
        }
    }

    /// Wire up the production collaborators described by `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let client = build_http_client(config.request_timeout())
            .context("Failed to build HTTP client")?;

        let api = SparkLoopClient::new(
            client.clone(),
            config.sparkloop_api_base.clone(),
            config.sparkloop_api_key.clone(),
        );
        let notifier = Notifier::new(
            client,
            config.discord_webhook_url.clone(),
            config.slack_webhook_url.clone(),
        );

        Ok(Self::new(
            config,
            Arc::new(api),
            Arc::new(InMemoryEventStore::new()),
            notifier,
        ))
    }

    /// Replace the rate limiter, e.g. with one driven by a manual clock.
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }
}

/// Entry point for every request.
pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    info!(
        method = %method,
        path = uri.path(),
        source = %source_key(&headers),
        "request_received"
    );

    let result = match method {
        Method::OPTIONS => Ok(StatusCode::NO_CONTENT.into_response()),
        Method::GET => handle_get(&state, &uri, &headers).await,
        Method::POST => handle_post(&state, &uri, &headers, &body).await,
        _ => Err(RelayError::MethodNotAllowed),
    };

    if let Err(e) = &result {
        warn!(
            method = %method,
            path = uri.path(),
            status_code = e.status_code().as_u16(),
            error = %e,
            "request_failed"
        );
    }

    result
}

/// Run the sync pipeline for a POST.
async fn handle_post(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, RelayError> {
    let source = source_key(headers);
    if state.limiter.is_limited(&source) {
        return Err(RelayError::RateLimited);
    }

    if is_auth_enabled(&state.config.auth_token) {
        let secret = state.config.auth_token.as_deref().unwrap_or_default();
        let token = query_param(uri, "token");
        if !verify_request(headers, token.as_deref(), body, secret) {
            warn!(source = %source, "request_unauthorized");
            return Err(RelayError::Unauthorized);
        }
    }

    let parsed: Value = serde_json::from_slice(body)
        .map_err(|_| RelayError::validation("Invalid JSON in request body"))?;

    let event = normalize(&parsed, headers)?;
    let sync_result = state.synchronizer.sync(&event).await?;

    info!(email = %event.email(), status = %event.status(), "subscriber_synced");

    // Both side effects run to completion; neither can fail the request.
    futures::join!(
        state.recorder.record(&event, &sync_result),
        state.notifier.notify(&event, &sync_result),
    );

    Ok(Json(json!({
        "success": true,
        "message": "Subscriber updated successfully",
        "email": event.email(),
        "status": event.status(),
        "sparkloop": sync_result,
        "timestamp": now_rfc3339(),
    }))
    .into_response())
}

/// Serve the read-only queries.
async fn handle_get(state: &AppState, uri: &Uri, headers: &HeaderMap) -> Result<Response, RelayError> {
    if is_auth_enabled(&state.config.auth_token) {
        let secret = state.config.auth_token.as_deref().unwrap_or_default();
        let token = query_param(uri, "token");
        if !verify_token(headers, token.as_deref(), secret) {
            return Err(RelayError::Unauthorized);
        }
    }

    let path = uri.path();
    if path.ends_with("/events") {
        get_events(state, uri).await
    } else if path.ends_with("/stats") {
        get_stats(state).await
    } else {
        Err(RelayError::NotFound("Not found".to_string()))
    }
}

async fn get_events(state: &AppState, uri: &Uri) -> Result<Response, RelayError> {
    let failed = |e: crate::audit::StoreError| {
        error!(error = %e, "events_query_failed");
        RelayError::Store("Failed to retrieve events".to_string())
    };

    // An empty `email=` means no lookup.
    if let Some(email) = query_param(uri, "email").filter(|e| !e.is_empty()) {
        let event = state
            .recorder
            .latest_for(&email)
            .await
            .map_err(failed)?
            .ok_or_else(|| RelayError::NotFound("No events found for this email".to_string()))?;

        return Ok(Json(json!({ "email": email, "event": event })).into_response());
    }

    let limit = query_param(uri, "limit")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_EVENTS_LIMIT)
        .clamp(1, MAX_EVENTS_LIMIT);

    let page = state.recorder.recent(limit).await.map_err(failed)?;
    Ok(Json(page).into_response())
}

async fn get_stats(state: &AppState) -> Result<Response, RelayError> {
    let stats = state.recorder.stats().await.map_err(|e| {
        error!(error = %e, "stats_query_failed");
        RelayError::Store("Failed to retrieve stats".to_string())
    })?;
    Ok(Json(stats).into_response())
}

/// First value of a query parameter.
fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
