//! Source adapter framework.
//!
//! One adapter per upstream procurement API. Adapters speak their wire
//! protocol through the resilience core, normalize records into
//! `UnifiedProcurement`, and expose fetches as a lazy stream backed by a
//! bounded channel; dropping the stream cancels the page walk.

pub mod compras_gov;
pub mod licitar;
pub mod pncp;
pub mod portal_compras;

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use dashmap::DashMap;
use futures::{Future, Stream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Config;
use crate::models::procurement::{SourceMetadata, UnifiedProcurement};
use crate::resilience::{AdaptiveTimeoutManager, ResilientClient, SourceError};

/// Hard cap on pages walked per fetch; a safety net against upstreams
/// that keep reporting "more data".
pub const MAX_PAGES: u32 = 100;

/// Health probe deadline. `health_check` must resolve within this and
/// must not error.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a point-in-time health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Available,
    Degraded,
    Unavailable,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Available => "available",
            SourceStatus::Degraded => "degraded",
            SourceStatus::Unavailable => "unavailable",
        }
    }
}

/// Parameters of one fetch, shared by all adapters.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// YYYY-MM-DD
    pub data_inicial: String,
    /// YYYY-MM-DD
    pub data_final: String,
    pub ufs: Option<HashSet<String>>,
    pub modalidades: Vec<u8>,
    pub status: Option<String>,
}

pub type ProcurementStream =
    Pin<Box<dyn Stream<Item = Result<UnifiedProcurement, SourceError>> + Send>>;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn metadata(&self) -> &SourceMetadata;

    /// Probe the upstream. Resolves within `HEALTH_CHECK_TIMEOUT` and
    /// never errors; failures degrade to `Unavailable`.
    async fn health_check(&self) -> SourceStatus;

    /// Lazily yield normalized records. Pagination, server-side filters
    /// and duplicate-id suppression are the adapter's responsibility;
    /// UFs the upstream cannot filter server-side are filtered here.
    fn fetch(self: Arc<Self>, request: FetchRequest) -> ProcurementStream;

    /// Release pooled resources.
    async fn close(&self) {}
}

/// Build a fetch stream from a producer task. The channel is bounded so
/// a slow consumer applies backpressure to the page walk; dropping the
/// receiver cancels the producer on its next send.
pub(crate) fn spawn_fetch_stream<F, Fut>(producer: F) -> ProcurementStream
where
    F: FnOnce(mpsc::Sender<Result<UnifiedProcurement, SourceError>>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(producer(tx));
    Box::pin(ReceiverStream::new(rx))
}

// ── Process-wide health registry ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Down => "down",
        }
    }
}

#[derive(Debug, Clone)]
struct HealthEntry {
    state: HealthState,
    updated_at: Instant,
    consecutive_failures: u32,
}

const HEALTH_TTL: Duration = Duration::from_secs(300);

/// In-memory source availability tracker. Entries expire back to
/// `Healthy` after five minutes without updates.
#[derive(Default)]
pub struct SourceHealthRegistry {
    entries: DashMap<String, HealthEntry>,
}

impl SourceHealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_status(&self, source: &str) -> HealthState {
        match self.entries.get(source) {
            None => HealthState::Healthy,
            Some(entry) if entry.updated_at.elapsed() > HEALTH_TTL => {
                drop(entry);
                self.entries.remove(source);
                HealthState::Healthy
            }
            Some(entry) => entry.state,
        }
    }

    pub fn record_success(&self, source: &str) {
        self.entries.insert(
            source.to_string(),
            HealthEntry {
                state: HealthState::Healthy,
                updated_at: Instant::now(),
                consecutive_failures: 0,
            },
        );
    }

    /// 3 consecutive failures → degraded, 5 → down.
    pub fn record_failure(&self, source: &str) {
        let mut entry = self
            .entries
            .entry(source.to_string())
            .or_insert_with(|| HealthEntry {
                state: HealthState::Healthy,
                updated_at: Instant::now(),
                consecutive_failures: 0,
            });

        let previous = entry.state;
        entry.consecutive_failures += 1;
        entry.updated_at = Instant::now();
        entry.state = if entry.consecutive_failures >= 5 {
            HealthState::Down
        } else if entry.consecutive_failures >= 3 {
            HealthState::Degraded
        } else {
            previous
        };

        if entry.state != previous {
            tracing::warn!(
                source = source,
                failures = entry.consecutive_failures,
                "source transitioned to {}",
                entry.state.as_str()
            );
        }
    }

    /// A `down` source is still callable, but consolidation may skip it.
    pub fn is_available(&self, source: &str) -> bool {
        self.get_status(source) != HealthState::Down
    }

    /// Test isolation only.
    pub fn reset(&self) {
        self.entries.clear();
    }
}

// ── Adapter construction ─────────────────────────────────────

/// Shared handles every adapter needs.
#[derive(Clone)]
pub struct SourceContext {
    pub client: Arc<ResilientClient>,
    pub timeouts: Arc<AdaptiveTimeoutManager>,
}

/// Build the adapter set from configuration.
///
/// A source is available only when enabled *and* (open data or
/// credential present), so mis-configured sources never produce phantom
/// timeout attempts. The ComprasGov adapter is returned separately as
/// the last-resort fallback when it is not already a primary.
pub fn build_adapters(
    config: &Config,
    ctx: &SourceContext,
) -> (
    std::collections::HashMap<String, Arc<dyn SourceAdapter>>,
    Option<Arc<dyn SourceAdapter>>,
) {
    let mut adapters: std::collections::HashMap<String, Arc<dyn SourceAdapter>> =
        std::collections::HashMap::new();

    if config.pncp.enabled {
        let adapter = Arc::new(pncp::PncpAdapter::new(
            ctx.clone(),
            Duration::from_secs(config.pncp_timeout_per_uf_secs),
        ));
        ctx.client
            .set_rate_limit(adapter.metadata().code, adapter.metadata().rate_limit_rps);
        adapters.insert(adapter.metadata().code.to_string(), adapter);
    }

    if config.portal_compras.enabled {
        if config.portal_compras.has_api_key() {
            let adapter = Arc::new(portal_compras::PortalComprasAdapter::new(
                ctx.clone(),
                config.portal_compras.api_key.clone().unwrap_or_default(),
            ));
            ctx.client
                .set_rate_limit(adapter.metadata().code, adapter.metadata().rate_limit_rps);
            adapters.insert(adapter.metadata().code.to_string(), adapter);
        } else {
            tracing::warn!("Portal de Compras enabled but PORTAL_COMPRAS_API_KEY not set");
        }
    }

    if config.licitar.enabled {
        if config.licitar.has_api_key() {
            let adapter = Arc::new(licitar::LicitarAdapter::new(
                ctx.clone(),
                config.licitar.api_key.clone().unwrap_or_default(),
            ));
            ctx.client
                .set_rate_limit(adapter.metadata().code, adapter.metadata().rate_limit_rps);
            adapters.insert(adapter.metadata().code.to_string(), adapter);
        } else {
            tracing::warn!("Licitar Digital enabled but LICITAR_API_KEY not set");
        }
    }

    let compras_gov: Arc<dyn SourceAdapter> =
        Arc::new(compras_gov::ComprasGovAdapter::new(ctx.clone()));
    ctx.client.set_rate_limit(
        compras_gov.metadata().code,
        compras_gov.metadata().rate_limit_rps,
    );

    let fallback = if config.compras_gov.enabled {
        adapters.insert(compras_gov.metadata().code.to_string(), compras_gov);
        None
    } else {
        // Kept as the last-resort fallback even when disabled as a
        // primary source.
        Some(compras_gov)
    };

    (adapters, fallback)
}

// ── Shared field parsing ─────────────────────────────────────

/// Parse upstream timestamps: ISO 8601 with or without milliseconds and
/// timezone, plus `DD/MM/YYYY` with or without time.
pub fn parse_datetime(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
    ];
    let trimmed = raw.trim_end_matches('Z');
    for fmt in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }

    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, fmt) {
            return d.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt));
        }
    }

    tracing::debug!("unparsable upstream datetime: {}", raw);
    None
}

/// Parse monetary values tolerating Brazilian decimal strings
/// ("1.234,56") as well as plain numbers.
pub fn parse_valor(value: Option<&serde_json::Value>) -> f64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return 0.0;
            }
            if s.contains(',') {
                let normalized = s.replace('.', "").replace(',', ".");
                normalized.parse().unwrap_or(0.0)
            } else {
                s.parse().unwrap_or(0.0)
            }
        }
        _ => 0.0,
    }
}

pub fn get_str(value: &serde_json::Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            if !s.is_empty() {
                return s.to_string();
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_health_registry_degrades_then_downs() {
        let reg = SourceHealthRegistry::new();
        assert_eq!(reg.get_status("PNCP"), HealthState::Healthy);

        reg.record_failure("PNCP");
        reg.record_failure("PNCP");
        assert_eq!(reg.get_status("PNCP"), HealthState::Healthy);

        reg.record_failure("PNCP");
        assert_eq!(reg.get_status("PNCP"), HealthState::Degraded);
        assert!(reg.is_available("PNCP"));

        reg.record_failure("PNCP");
        reg.record_failure("PNCP");
        assert_eq!(reg.get_status("PNCP"), HealthState::Down);
        assert!(!reg.is_available("PNCP"));
    }

    #[test]
    fn test_health_registry_success_resets() {
        let reg = SourceHealthRegistry::new();
        for _ in 0..5 {
            reg.record_failure("Portal");
        }
        assert_eq!(reg.get_status("Portal"), HealthState::Down);
        reg.record_success("Portal");
        assert_eq!(reg.get_status("Portal"), HealthState::Healthy);
    }

    #[test]
    fn test_parse_datetime_iso_variants() {
        for raw in [
            "2026-01-15T10:30:00Z",
            "2026-01-15T10:30:00.123Z",
            "2026-01-15T10:30:00-03:00",
            "2026-01-15T10:30:00",
            "2026-01-15",
        ] {
            let v = json!(raw);
            assert!(parse_datetime(Some(&v)).is_some(), "failed on {}", raw);
        }
    }

    #[test]
    fn test_parse_datetime_brazilian_format() {
        let v = json!("15/01/2026 10:30:00");
        let dt = parse_datetime(Some(&v)).unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2026-01-15");

        let d = json!("15/01/2026");
        assert!(parse_datetime(Some(&d)).is_some());
    }

    #[test]
    fn test_parse_datetime_garbage_is_none() {
        let v = json!("em breve");
        assert!(parse_datetime(Some(&v)).is_none());
        assert!(parse_datetime(None).is_none());
    }

    #[test]
    fn test_parse_valor_formats() {
        assert_eq!(parse_valor(Some(&json!(1234.56))), 1234.56);
        assert_eq!(parse_valor(Some(&json!("1.234,56"))), 1234.56);
        assert_eq!(parse_valor(Some(&json!("1234.56"))), 1234.56);
        assert_eq!(parse_valor(Some(&json!(""))), 0.0);
        assert_eq!(parse_valor(None), 0.0);
    }

    #[test]
    fn test_get_str_tries_keys_in_order() {
        let v = json!({"descricao": "obj", "objeto": ""});
        assert_eq!(get_str(&v, &["objeto", "descricao"]), "obj");
        assert_eq!(get_str(&v, &["missing"]), "");
    }
}
