//! HTTP handlers for the search API.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::Stream;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::json;

use crate::correlation::RequestContext;
use crate::errors::AppError;
use crate::models::search::SearchRequest;
use crate::rate_limit::{client_key, SseConnectionTracker};
use crate::search_state::get_search_status;
use crate::AppState;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: Option<u64>,
}

/// Resolve the bearer token into a user id. Signature is verified with
/// the shared HS256 secret; the OAuth flow that minted the token lives
/// outside this service.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, AppError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|_| AppError::Unauthorized)?;

    if decoded.claims.sub.is_empty() {
        return Err(AppError::Unauthorized);
    }
    Ok(decoded.claims.sub)
}

/// POST /v1/buscar: run the full search pipeline.
pub async fn buscar(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    ctx: Option<axum::Extension<RequestContext>>,
    headers: HeaderMap,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = ctx
        .map(|e| e.0)
        .unwrap_or_else(|| RequestContext::from_headers(&headers));
    let user_id = authenticate(&state, &headers)?;

    let (key, scope) = client_key(Some(&user_id), &addr.ip().to_string());
    let bypass = state.quota.is_admin(&user_id).await;
    if !bypass {
        let decision = state
            .rate_limiter
            .enforce(
                "/v1/buscar",
                &key,
                scope,
                state.config.search_rate_limit_per_minute,
                60,
                &ctx.correlation_id,
            )
            .await;
        if !decision.allowed {
            return Err(AppError::RateLimitExceeded {
                retry_after_seconds: decision.retry_after_seconds,
                correlation_id: ctx.correlation_id.clone(),
            });
        }
    }

    let response = state.pipeline.run(&ctx, &user_id, request).await?;
    Ok(Json(response))
}

/// GET /v1/search/{id}/timeline: transitions in chronological order.
pub async fn timeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(search_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    authenticate(&state, &headers)?;
    let rows = state.store.get_timeline(&search_id).await?;
    if rows.is_empty() && state.store.get_session(&search_id).await?.is_none() {
        return Err(AppError::SearchNotFound);
    }
    Ok(Json(json!({"search_id": search_id, "timeline": rows})))
}

/// GET /v1/search/{id}/status: session row + latest transition.
pub async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(search_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    authenticate(&state, &headers)?;
    match get_search_status(&state.store, &search_id).await? {
        Some(blob) => Ok(Json(blob)),
        None => Err(AppError::SearchNotFound),
    }
}

/// Releases the per-user SSE slot when the stream is dropped.
struct SseSlot {
    user_id: String,
    tracker: Arc<SseConnectionTracker>,
}

impl Drop for SseSlot {
    fn drop(&mut self) {
        self.tracker.release(&self.user_id);
    }
}

/// GET /v1/search/{id}/events: real-time progress stream.
///
/// A reconnecting client whose tracker is gone gets the degraded
/// metadata from the pub/sub mirror when available, else a JSON `null`.
pub async fn events(
    State(state): State<Arc<AppState>>,
    ctx: Option<axum::Extension<RequestContext>>,
    headers: HeaderMap,
    Path(search_id): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let ctx = ctx
        .map(|e| e.0)
        .unwrap_or_else(|| RequestContext::from_headers(&headers));
    let user_id = authenticate(&state, &headers)?;

    let Some(tracker) = state.progress.get_tracker(&search_id) else {
        let degraded = state.progress.degraded_tracker_info(&search_id).await;
        return Ok(Json(degraded.unwrap_or(serde_json::Value::Null)).into_response());
    };

    if !state.sse_connections.acquire(&user_id) {
        return Err(AppError::RateLimitExceeded {
            retry_after_seconds: 30,
            correlation_id: ctx.correlation_id,
        });
    }
    let slot = SseSlot {
        user_id,
        tracker: state.sse_connections.clone(),
    };

    let Some(rx) = tracker.take_receiver() else {
        // Queue already handed to another consumer; degraded response.
        drop(slot);
        let degraded = state.progress.degraded_tracker_info(&search_id).await;
        return Ok(Json(degraded.unwrap_or(serde_json::Value::Null)).into_response());
    };

    let stream = event_stream(rx, slot);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

fn event_stream(
    rx: tokio::sync::mpsc::Receiver<crate::progress::ProgressEvent>,
    slot: SseSlot,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold((rx, slot), |(mut rx, slot)| async move {
        let event = rx.recv().await?;
        let sse_event = Event::default()
            .event(event.stage.clone())
            .json_data(&event)
            .ok()?;
        Some((Ok(sse_event), (rx, slot)))
    })
}

const PNCP_STATS_CACHE_KEY: &str = "bidiq:pncp-stats";
const PNCP_STATS_TTL_SECS: u64 = 86_400;

/// GET /api/pncp-stats: 24h-cached source statistics snapshot,
/// recomputed under a single-flight lock on miss.
pub async fn pncp_stats(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    if let Some(snapshot) = state.cache.get::<serde_json::Value>(PNCP_STATS_CACHE_KEY).await {
        return Ok(Json(snapshot));
    }

    // Single-flight: one caller computes, the rest re-read the cache.
    let _guard = state.stats_lock.lock().await;
    if let Some(snapshot) = state.cache.get::<serde_json::Value>(PNCP_STATS_CACHE_KEY).await {
        return Ok(Json(snapshot));
    }

    let health = state.consolidation.health_check_all().await;
    let snapshot = json!({
        "sources": health,
        "generated_at": chrono::Utc::now(),
    });
    if let Err(e) = state
        .cache
        .set(PNCP_STATS_CACHE_KEY, &snapshot, PNCP_STATS_TTL_SECS)
        .await
    {
        tracing::warn!("failed to cache stats snapshot: {}", e);
    }
    Ok(Json(snapshot))
}

/// GET /v1/admin/search-trace/{id}: diagnostics for support.
pub async fn search_trace(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(search_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = authenticate(&state, &headers)?;
    if !state.quota.is_admin(&user_id).await {
        return Err(AppError::Unauthorized);
    }

    let session = state.store.get_session(&search_id).await?;
    let timeline = state.store.get_timeline(&search_id).await?;
    let tracker = state.progress.get_tracker(&search_id);
    let machine_state = state
        .machines
        .get(&search_id)
        .and_then(|m| m.current_state())
        .map(|s| s.as_str());

    Ok(Json(json!({
        "search_id": search_id,
        "session": session,
        "timeline": timeline,
        "tracker_active": tracker.is_some(),
        "tracker_complete": tracker.map(|t| t.is_complete()),
        "machine_state": machine_state,
        "llm_cache_size": state.llm.cache_size(),
    })))
}
