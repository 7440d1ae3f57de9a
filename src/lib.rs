//! BidIQ backend: multi-source procurement search for Brazilian public
//! tenders.
//!
//! Library crate so integration tests can exercise the pipeline, the
//! filter engine and the resilience core without the binary.

pub mod api;
pub mod cache;
pub mod config;
pub mod consolidation;
pub mod correlation;
pub mod errors;
pub mod filter;
pub mod jobs;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod quota;
pub mod rate_limit;
pub mod resilience;
pub mod sanctions;
pub mod search_state;
pub mod server;
pub mod sources;
pub mod store;
pub mod vault;

use std::sync::Arc;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: config::Config,
    pub store: store::PgStore,
    pub cache: Arc<cache::TieredCache>,
    pub pipeline: Arc<pipeline::SearchPipeline>,
    pub rate_limiter: Arc<rate_limit::RateLimiter>,
    pub sse_connections: Arc<rate_limit::SseConnectionTracker>,
    pub progress: Arc<progress::ProgressRegistry>,
    pub machines: Arc<search_state::StateMachineRegistry>,
    pub quota: Arc<quota::QuotaService>,
    pub consolidation: Arc<consolidation::ConsolidationService>,
    pub llm: Arc<llm::LlmArbiter>,
    pub vault: Option<vault::TokenCrypto>,
    pub stats_lock: tokio::sync::Mutex<()>,
}
