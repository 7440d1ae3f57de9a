//! Multi-source consolidation engine.
//!
//! Fans out to every configured adapter in parallel under a per-source
//! and a global deadline, widens both when the dominant source (PNCP) is
//! degraded, falls back to ComprasGov as a last resort when everything
//! failed, and deduplicates the merged stream by dedup key keeping the
//! highest-priority source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::metrics;
use crate::models::procurement::UnifiedProcurement;
use crate::sources::{FetchRequest, SourceAdapter, SourceHealthRegistry};

/// Widened deadline for non-dominant sources while PNCP is degraded.
pub const FAILOVER_TIMEOUT_PER_SOURCE: Duration = Duration::from_secs(120);
/// Global deadline while PNCP is degraded.
pub const DEGRADED_GLOBAL_TIMEOUT: Duration = Duration::from_secs(360);
/// Deadline for the last-resort fallback fetch.
pub const FALLBACK_TIMEOUT: Duration = Duration::from_secs(40);
/// Health of this source decides degraded mode for the whole fan-out.
pub const DOMINANT_SOURCE: &str = "PNCP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Success,
    Timeout,
    Error,
    Skipped,
    Disabled,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Success => "success",
            FetchStatus::Timeout => "timeout",
            FetchStatus::Error => "error",
            FetchStatus::Skipped => "skipped",
            FetchStatus::Disabled => "disabled",
        }
    }
}

/// Per-source fetch metrics surfaced in the consolidation result.
#[derive(Debug, Clone)]
pub struct SourceResult {
    pub source_code: String,
    pub record_count: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub status: FetchStatus,
}

#[derive(Debug)]
pub struct ConsolidationResult {
    pub records: Vec<UnifiedProcurement>,
    pub total_before_dedup: usize,
    pub total_after_dedup: usize,
    pub duplicates_removed: usize,
    pub source_results: Vec<SourceResult>,
    pub elapsed_ms: u64,
    pub is_partial: bool,
    pub degradation_reason: Option<String>,
}

#[derive(Debug, Error)]
#[error("all sources failed: {}", summarize(.source_errors))]
pub struct AllSourcesFailed {
    pub source_errors: HashMap<String, String>,
}

fn summarize(errors: &HashMap<String, String>) -> String {
    let mut parts: Vec<String> = errors.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
    parts.sort();
    parts.join("; ")
}

pub type SourceCompleteCallback = Arc<dyn Fn(&str, usize, Option<&str>) + Send + Sync>;

struct FetchOutcome {
    code: String,
    status: FetchStatus,
    records: Vec<UnifiedProcurement>,
    duration_ms: u64,
    error: Option<String>,
}

pub struct ConsolidationService {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
    health: Arc<SourceHealthRegistry>,
    timeout_per_source: Duration,
    timeout_global: Duration,
    fail_on_all_errors: bool,
    fallback_adapter: Option<Arc<dyn SourceAdapter>>,
}

impl ConsolidationService {
    pub fn new(
        adapters: HashMap<String, Arc<dyn SourceAdapter>>,
        health: Arc<SourceHealthRegistry>,
        timeout_per_source: Duration,
        timeout_global: Duration,
        fail_on_all_errors: bool,
        fallback_adapter: Option<Arc<dyn SourceAdapter>>,
    ) -> Self {
        Self {
            adapters,
            health,
            timeout_per_source,
            timeout_global,
            fail_on_all_errors,
            fallback_adapter,
        }
    }

    pub fn source_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.adapters.keys().cloned().collect();
        codes.sort();
        codes
    }

    /// Fetch from all sources in parallel, deduplicate, and report
    /// per-source outcomes. Partial failure degrades; total failure is an
    /// error when `fail_on_all_errors` is set.
    pub async fn fetch_all(
        &self,
        request: &FetchRequest,
        on_source_complete: Option<SourceCompleteCallback>,
    ) -> Result<ConsolidationResult, AllSourcesFailed> {
        let start = Instant::now();

        if self.adapters.is_empty() {
            return Ok(ConsolidationResult {
                records: Vec::new(),
                total_before_dedup: 0,
                total_after_dedup: 0,
                duplicates_removed: 0,
                source_results: Vec::new(),
                elapsed_ms: 0,
                is_partial: false,
                degradation_reason: None,
            });
        }

        // Degraded mode: the dominant source decides the deadline budget.
        let dominant_status = self.health.get_status(DOMINANT_SOURCE);
        let dominant_degraded = dominant_status != crate::sources::HealthState::Healthy;

        let effective_global = if dominant_degraded {
            let widened = self.timeout_global.max(DEGRADED_GLOBAL_TIMEOUT);
            tracing::info!(
                status = dominant_status.as_str(),
                global_s = widened.as_secs(),
                "dominant source degraded, widening global deadline"
            );
            widened
        } else {
            self.timeout_global
        };

        let mut join_set: JoinSet<FetchOutcome> = JoinSet::new();
        for (code, adapter) in &self.adapters {
            let per_source = if dominant_degraded && code != DOMINANT_SOURCE {
                self.timeout_per_source.max(FAILOVER_TIMEOUT_PER_SOURCE)
            } else {
                self.timeout_per_source
            };
            join_set.spawn(wrap_source(
                code.clone(),
                adapter.clone(),
                request.clone(),
                per_source,
            ));
        }

        // One global deadline over all tasks; stragglers become timeouts.
        let mut outcomes: HashMap<String, FetchOutcome> = HashMap::new();
        let deadline = Instant::now() + effective_global;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, join_set.join_next()).await {
                Ok(Some(Ok(outcome))) => {
                    outcomes.insert(outcome.code.clone(), outcome);
                }
                Ok(Some(Err(e))) => {
                    tracing::error!("source fetch task panicked: {}", e);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        global_s = effective_global.as_secs(),
                        "consolidation global deadline reached, aborting stragglers"
                    );
                    join_set.abort_all();
                    break;
                }
            }
        }

        let mut all_records: Vec<UnifiedProcurement> = Vec::new();
        let mut source_results: Vec<SourceResult> = Vec::new();
        let mut source_errors: HashMap<String, String> = HashMap::new();
        let mut failed_sources: Vec<String> = Vec::new();

        let mut codes: Vec<&String> = self.adapters.keys().collect();
        codes.sort();
        for code in codes {
            let outcome = outcomes.remove(code.as_str());
            match outcome {
                Some(outcome) if outcome.status == FetchStatus::Success => {
                    self.health.record_success(code);
                    metrics::SOURCE_FETCH_TOTAL
                        .with_label_values(&[code, "success"])
                        .inc();
                    metrics::SOURCE_FETCH_DURATION
                        .with_label_values(&[code])
                        .observe(outcome.duration_ms as f64 / 1000.0);
                    if let Some(cb) = &on_source_complete {
                        cb(code, outcome.records.len(), None);
                    }
                    source_results.push(SourceResult {
                        source_code: code.clone(),
                        record_count: outcome.records.len(),
                        duration_ms: outcome.duration_ms,
                        error: None,
                        status: FetchStatus::Success,
                    });
                    all_records.extend(outcome.records);
                }
                other => {
                    let (status, duration_ms, error) = match other {
                        Some(o) => (
                            o.status,
                            o.duration_ms,
                            o.error.unwrap_or_else(|| "unknown error".into()),
                        ),
                        None => (FetchStatus::Timeout, 0, "global timeout".to_string()),
                    };
                    self.health.record_failure(code);
                    metrics::SOURCE_FETCH_TOTAL
                        .with_label_values(&[code, status.as_str()])
                        .inc();
                    if let Some(cb) = &on_source_complete {
                        cb(code, 0, Some(&error));
                    }
                    source_errors.insert(code.clone(), error.clone());
                    failed_sources.push(code.clone());
                    source_results.push(SourceResult {
                        source_code: code.clone(),
                        record_count: 0,
                        duration_ms,
                        error: Some(error),
                        status,
                    });
                }
            }
        }

        // Last-resort fallback, only when everything else failed and the
        // fallback was not already a primary source.
        if all_records.is_empty() && !source_errors.is_empty() {
            if let Some(fallback) = &self.fallback_adapter {
                let code = fallback.metadata().code.to_string();
                if !self.adapters.contains_key(&code) {
                    tracing::info!(
                        fallback = %code,
                        timeout_s = FALLBACK_TIMEOUT.as_secs(),
                        "all sources failed, invoking last-resort fallback"
                    );
                    let outcome = wrap_source(
                        code.clone(),
                        fallback.clone(),
                        request.clone(),
                        FALLBACK_TIMEOUT,
                    )
                    .await;

                    if outcome.status == FetchStatus::Success {
                        self.health.record_success(&code);
                        if let Some(cb) = &on_source_complete {
                            cb(&code, outcome.records.len(), None);
                        }
                        source_results.push(SourceResult {
                            source_code: code,
                            record_count: outcome.records.len(),
                            duration_ms: outcome.duration_ms,
                            error: None,
                            status: FetchStatus::Success,
                        });
                        all_records.extend(outcome.records);
                    } else {
                        let error = outcome.error.unwrap_or_else(|| "unknown error".into());
                        self.health.record_failure(&code);
                        tracing::warn!(fallback = %code, "last-resort fallback also failed: {}", error);
                        source_errors.insert(code.clone(), error.clone());
                        source_results.push(SourceResult {
                            source_code: code,
                            record_count: 0,
                            duration_ms: outcome.duration_ms,
                            error: Some(error),
                            status: outcome.status,
                        });
                    }
                }
            }
        }

        let has_data = !all_records.is_empty();
        let is_partial = has_data && !failed_sources.is_empty();
        let degradation_reason = is_partial.then(|| {
            format!("Partial results: sources failed: {}", failed_sources.join(", "))
        });
        if let Some(reason) = &degradation_reason {
            tracing::warn!("degraded consolidation: {}", reason);
        }

        if !has_data && !source_errors.is_empty() && self.fail_on_all_errors {
            return Err(AllSourcesFailed { source_errors });
        }

        let total_before = all_records.len();
        let priorities = self.priority_map();
        let deduped = deduplicate(all_records, &priorities);
        let total_after = deduped.len();

        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            raw = total_before,
            deduped = total_after,
            removed = total_before - total_after,
            elapsed_ms = elapsed_ms,
            partial = is_partial,
            "consolidation complete"
        );

        Ok(ConsolidationResult {
            records: deduped,
            total_before_dedup: total_before,
            total_after_dedup: total_after,
            duplicates_removed: total_before - total_after,
            source_results,
            elapsed_ms,
            is_partial,
            degradation_reason,
        })
    }

    fn priority_map(&self) -> HashMap<String, u32> {
        let mut map: HashMap<String, u32> = self
            .adapters
            .values()
            .map(|a| (a.metadata().code.to_string(), a.metadata().priority))
            .collect();
        if let Some(fb) = &self.fallback_adapter {
            map.entry(fb.metadata().code.to_string())
                .or_insert(fb.metadata().priority);
        }
        map
    }

    /// Probe every adapter in parallel under a 5 second cap.
    pub async fn health_check_all(&self) -> HashMap<String, serde_json::Value> {
        let mut join_set = JoinSet::new();
        for (code, adapter) in &self.adapters {
            let code = code.clone();
            let adapter = adapter.clone();
            join_set.spawn(async move {
                let start = Instant::now();
                let status = tokio::time::timeout(
                    crate::sources::HEALTH_CHECK_TIMEOUT,
                    adapter.health_check(),
                )
                .await
                .unwrap_or(crate::sources::SourceStatus::Unavailable);
                (
                    code,
                    serde_json::json!({
                        "status": status.as_str(),
                        "response_ms": start.elapsed().as_millis() as u64,
                        "priority": adapter.metadata().priority,
                    }),
                )
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((code, info)) = joined {
                results.insert(code, info);
            }
        }
        results
    }

    pub async fn close(&self) {
        for adapter in self.adapters.values() {
            adapter.close().await;
        }
        if let Some(fb) = &self.fallback_adapter {
            fb.close().await;
        }
    }
}

/// Run one source fetch under its deadline, folding every failure mode
/// into a status entry. Never returns an error.
async fn wrap_source(
    code: String,
    adapter: Arc<dyn SourceAdapter>,
    request: FetchRequest,
    timeout: Duration,
) -> FetchOutcome {
    let start = Instant::now();

    let collect = async {
        let mut stream = adapter.fetch(request);
        let mut records = Vec::new();
        let mut error: Option<crate::resilience::SourceError> = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => records.push(record),
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        (records, error)
    };

    match tokio::time::timeout(timeout, collect).await {
        Ok((records, None)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::info!(source = %code, count = records.len(), duration_ms, "source fetch done");
            FetchOutcome {
                code,
                status: FetchStatus::Success,
                records,
                duration_ms,
                error: None,
            }
        }
        Ok((records, Some(e))) if !records.is_empty() => {
            // Partial page-walk failure after some data: degrade to success.
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::warn!(source = %code, partial = records.len(), "partial source fetch: {}", e);
            FetchOutcome {
                code,
                status: FetchStatus::Success,
                records,
                duration_ms,
                error: None,
            }
        }
        Ok((_, Some(e))) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::error!(source = %code, duration_ms, "source fetch failed: {}", e);
            FetchOutcome {
                code,
                status: FetchStatus::Error,
                records: Vec::new(),
                duration_ms,
                error: Some(e.to_string()),
            }
        }
        Err(_) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::warn!(source = %code, timeout_s = timeout.as_secs(), "source fetch timed out");
            FetchOutcome {
                code,
                status: FetchStatus::Timeout,
                records: Vec::new(),
                duration_ms,
                error: Some(format!("timeout after {}s", timeout.as_secs())),
            }
        }
    }
}

/// Group by dedup key, keeping the record from the source with the
/// lowest priority number. Records without a key never deduplicate.
/// Idempotent on already-deduplicated input.
pub fn deduplicate(
    records: Vec<UnifiedProcurement>,
    priorities: &HashMap<String, u32>,
) -> Vec<UnifiedProcurement> {
    let mut order: Vec<String> = Vec::with_capacity(records.len());
    let mut by_key: HashMap<String, UnifiedProcurement> = HashMap::with_capacity(records.len());

    for (idx, record) in records.into_iter().enumerate() {
        let key = if record.has_dedup_key() {
            record.dedup_key.clone()
        } else {
            format!("_nokey_{}", idx)
        };

        match by_key.get(&key) {
            None => {
                order.push(key.clone());
                by_key.insert(key, record);
            }
            Some(existing) => {
                let existing_priority =
                    priorities.get(&existing.source_name).copied().unwrap_or(999);
                let new_priority = priorities.get(&record.source_name).copied().unwrap_or(999);
                if new_priority < existing_priority {
                    by_key.insert(key, record);
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────
