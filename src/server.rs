//! Server assembly: state construction, middleware, and the router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use dashmap::DashSet;
use once_cell::sync::Lazy;
use tower_http::cors::CorsLayer;

use crate::api;
use crate::cache::TieredCache;
use crate::config::{Config, FE_PROXY_TIMEOUT_SECS};
use crate::consolidation::ConsolidationService;
use crate::correlation::RequestContext;
use crate::llm::LlmArbiter;
use crate::metrics::encode_metrics;
use crate::pipeline::SearchPipeline;
use crate::progress::ProgressRegistry;
use crate::quota::QuotaService;
use crate::rate_limit::{RateLimiter, SseConnectionTracker};
use crate::resilience::{timeouts::validate_timeout_chain, AdaptiveTimeoutManager, ResilientClient};
use crate::sanctions::SanctionsChecker;
use crate::search_state::{recover_stale_searches, StateMachineRegistry};
use crate::sources::{build_adapters, SourceContext, SourceHealthRegistry};
use crate::store::PgStore;
use crate::vault::TokenCrypto;
use crate::AppState;

/// Build the full application state from configuration.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    // Refuse to start on a broken deadline chain.
    let violations = validate_timeout_chain(
        FE_PROXY_TIMEOUT_SECS,
        config.search_fetch_timeout_secs,
        config.consolidation.timeout_global_secs,
        config.consolidation.timeout_per_source_secs,
        config.pncp_timeout_per_uf_secs,
        config.pncp_timeout_per_uf_degraded_secs,
    );
    if !violations.is_empty() {
        anyhow::bail!("timeout chain inverted: {}", violations.join("; "));
    }

    tracing::info!("connecting to database");
    let store = PgStore::connect(&config.database_url).await?;
    tracing::info!("running migrations");
    store.migrate().await?;

    let redis = match &config.redis_url {
        Some(url) => match redis::Client::open(url.as_str()) {
            Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!("Redis unavailable, using in-process fallbacks: {}", e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("invalid REDIS_URL, using in-process fallbacks: {}", e);
                None
            }
        },
        None => {
            tracing::info!("REDIS_URL not set, using in-process fallbacks");
            None
        }
    };
    let cache = Arc::new(TieredCache::new(redis));

    let client = Arc::new(ResilientClient::new());
    let timeouts = Arc::new(AdaptiveTimeoutManager::new(Duration::from_secs(
        config.pncp_timeout_per_uf_secs,
    )));
    let source_ctx = SourceContext {
        client: client.clone(),
        timeouts: timeouts.clone(),
    };
    let (adapters, fallback) = build_adapters(&config, &source_ctx);
    tracing::info!(
        sources = ?adapters.keys().collect::<Vec<_>>(),
        fallback = fallback.as_ref().map(|f| f.metadata().code),
        "source adapters configured"
    );

    let health = Arc::new(SourceHealthRegistry::new());
    let consolidation = Arc::new(ConsolidationService::new(
        adapters,
        health,
        Duration::from_secs(config.consolidation.timeout_per_source_secs),
        Duration::from_secs(config.consolidation.timeout_global_secs),
        config.consolidation.fail_on_all_errors,
        fallback,
    ));

    let llm = Arc::new(LlmArbiter::from_config(&config));
    let sanctions = config
        .portal_transparencia_api_key
        .clone()
        .map(|key| Arc::new(SanctionsChecker::new(client.clone(), Some(key))));

    let progress = Arc::new(ProgressRegistry::new(Some(cache.clone())));
    let machines = Arc::new(StateMachineRegistry::new());
    let quota = Arc::new(QuotaService::new(
        Some(store.clone()),
        config.admin_user_ids.clone(),
    ));

    let pipeline = Arc::new(SearchPipeline {
        store: Some(store.clone()),
        quota: quota.clone(),
        consolidation: consolidation.clone(),
        llm: llm.clone(),
        sanctions,
        progress: progress.clone(),
        machines: machines.clone(),
        excel: None, // spreadsheet upload is wired by the deployment
        budget: Duration::from_secs(config.search_fetch_timeout_secs),
    });

    let rate_limiter = Arc::new(RateLimiter::new(
        Some(cache.clone()),
        config.rate_limiting_enabled,
    ));
    let sse_connections = Arc::new(SseConnectionTracker::new(config.sse_connection_cap));

    let vault = match &config.encryption_key {
        Some(key) => Some(TokenCrypto::new(key)?),
        None => None,
    };

    Ok(Arc::new(AppState {
        config,
        store,
        cache,
        pipeline,
        rate_limiter,
        sse_connections,
        progress,
        machines,
        quota,
        consolidation,
        llm,
        vault,
        stats_lock: tokio::sync::Mutex::new(()),
    }))
}

pub async fn run_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    // Finalize searches orphaned by the previous process.
    let recovered = recover_stale_searches(&state.store, 10).await;
    if recovered > 0 {
        tracing::info!(recovered = recovered, "stale searches finalized at startup");
    }

    crate::jobs::sweep::spawn(state.progress.clone());

    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("BidIQ backend listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // Legacy un-versioned aliases, kept alive behind deprecation
    // headers until the sunset date.
    let legacy = Router::new()
        .route("/buscar", post(api::handlers::buscar))
        .with_state(state.clone());

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", get(|| async { encode_metrics() }))
        .merge(api::api_router(state.clone()))
        .merge(legacy)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(deprecation_middleware))
        .layer(axum::middleware::from_fn(correlation_middleware))
}

/// Builds the per-request correlation context, exposes it to handlers
/// through request extensions, and echoes `X-Request-ID` on every
/// response.
pub async fn correlation_middleware(mut req: Request, next: Next) -> Response {
    let ctx = RequestContext::from_headers(req.headers());
    req.extensions_mut().insert(ctx.clone());

    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&ctx.request_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    if ctx.correlation_id != ctx.request_id {
        if let Ok(val) = axum::http::HeaderValue::from_str(&ctx.correlation_id) {
            resp.headers_mut().insert("x-correlation-id", val);
        }
    }
    resp
}

const SUNSET_DATE: &str = "2026-12-31";

static LEGACY_PATHS: &[(&str, &str)] = &[("/buscar", "/v1/buscar")];

static WARNED_PATHS: Lazy<DashSet<String>> = Lazy::new(DashSet::new);

/// Tags legacy un-versioned routes with `Deprecation`, `Sunset` and the
/// successor `Link` headers, warning once per unique path.
pub async fn deprecation_middleware(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let successor = LEGACY_PATHS
        .iter()
        .find(|(legacy, _)| *legacy == path)
        .map(|(_, successor)| *successor);

    let mut resp = next.run(req).await;
    if let Some(successor) = successor {
        let headers = resp.headers_mut();
        headers.insert("deprecation", axum::http::HeaderValue::from_static("true"));
        headers.insert(
            "sunset",
            axum::http::HeaderValue::from_static(SUNSET_DATE),
        );
        if let Ok(val) = axum::http::HeaderValue::from_str(&format!(
            "<{}>; rel=\"successor-version\"",
            successor
        )) {
            headers.insert("link", val);
        }

        if WARNED_PATHS.insert(path.clone()) {
            tracing::warn!(
                path = %path,
                successor = successor,
                "deprecated un-versioned route in use"
            );
        }
    }
    resp
}
