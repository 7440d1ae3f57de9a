//! Adaptive per-UF timeout management and the startup timeout-chain check.
//!
//! Each `(upstream, UF)` pair keeps a rolling window of recent request
//! durations and outcomes. The effective timeout tracks the observed P95
//! with headroom, clamped to a fixed band, so chronically slow states get
//! more time and fast states fail fast.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;

pub const T_MIN: Duration = Duration::from_secs(30);
pub const T_MAX: Duration = Duration::from_secs(180);
const WINDOW_SIZE: usize = 50;
const HEADROOM: f64 = 1.5;
const HEALTHY_SUCCESS_RATE: f64 = 0.70;

#[derive(Debug, Default, Clone)]
struct UfWindow {
    durations_ms: VecDeque<f64>,
    successes: u32,
    failures: u32,
    timeouts: u32,
}

#[derive(Debug, Clone)]
pub struct UfStats {
    pub samples: usize,
    pub success_rate: f64,
    pub timeouts: u32,
    pub effective_timeout: Duration,
    pub is_healthy: bool,
}

pub struct AdaptiveTimeoutManager {
    windows: DashMap<(String, String), UfWindow>,
    default_timeout: Duration,
}

impl AdaptiveTimeoutManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            default_timeout: default_timeout.clamp(T_MIN, T_MAX),
        }
    }

    pub fn record_request(
        &self,
        upstream: &str,
        uf: &str,
        duration: Duration,
        success: bool,
        is_timeout: bool,
    ) {
        let mut window = self
            .windows
            .entry((upstream.to_string(), uf.to_string()))
            .or_default();

        window.durations_ms.push_back(duration.as_secs_f64() * 1000.0);
        if window.durations_ms.len() > WINDOW_SIZE {
            window.durations_ms.pop_front();
        }
        if success {
            window.successes += 1;
        } else {
            window.failures += 1;
            if is_timeout {
                window.timeouts += 1;
            }
        }
    }

    /// `clamp(P95(durations) × 1.5, T_min, T_max)`. Falls back to the
    /// configured default until enough samples exist.
    pub fn effective_timeout(&self, upstream: &str, uf: &str) -> Duration {
        let key = (upstream.to_string(), uf.to_string());
        let Some(window) = self.windows.get(&key) else {
            return self.default_timeout;
        };
        if window.durations_ms.len() < 5 {
            return self.default_timeout;
        }

        let p95 = percentile(&window.durations_ms, 0.95);
        let widened = Duration::from_millis((p95 * HEADROOM) as u64);
        widened.clamp(T_MIN, T_MAX)
    }

    /// Advisory only; surfaced in logs, never blocks a fetch.
    pub fn is_healthy(&self, upstream: &str, uf: &str) -> bool {
        self.stats(upstream, uf)
            .map(|s| s.is_healthy)
            .unwrap_or(true)
    }

    pub fn stats(&self, upstream: &str, uf: &str) -> Option<UfStats> {
        let key = (upstream.to_string(), uf.to_string());
        let window = self.windows.get(&key)?;
        let total = window.successes + window.failures;
        let success_rate = if total == 0 {
            1.0
        } else {
            window.successes as f64 / total as f64
        };
        Some(UfStats {
            samples: window.durations_ms.len(),
            success_rate,
            timeouts: window.timeouts,
            effective_timeout: self.effective_timeout(upstream, uf),
            is_healthy: success_rate >= HEALTHY_SUCCESS_RATE,
        })
    }

    pub fn unhealthy_ufs(&self, upstream: &str) -> Vec<String> {
        self.windows
            .iter()
            .filter(|e| e.key().0 == upstream)
            .filter_map(|e| {
                let uf = e.key().1.clone();
                drop(e);
                match self.stats(upstream, &uf) {
                    Some(s) if !s.is_healthy => Some(uf),
                    _ => None,
                }
            })
            .collect()
    }
}

fn percentile(samples: &VecDeque<f64>, pct: f64) -> f64 {
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * pct).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

// ── Timeout chain invariant ──────────────────────────────────

/// Validate the startup timeout chain:
/// FE proxy > pipeline fetch > consolidation global > per-source > per-UF.
/// Returns human-readable violations; callers log and refuse to start on
/// hard inversions.
pub fn validate_timeout_chain(
    fe_proxy_secs: u64,
    pipeline_fetch_secs: u64,
    consolidation_global_secs: u64,
    consolidation_per_source_secs: u64,
    per_uf_secs: u64,
    per_uf_degraded_secs: u64,
) -> Vec<String> {
    let mut violations = Vec::new();

    if fe_proxy_secs <= pipeline_fetch_secs {
        violations.push(format!(
            "FE proxy ({}s) must exceed pipeline fetch ({}s)",
            fe_proxy_secs, pipeline_fetch_secs
        ));
    }
    if pipeline_fetch_secs <= consolidation_global_secs {
        violations.push(format!(
            "pipeline fetch ({}s) must exceed consolidation global ({}s)",
            pipeline_fetch_secs, consolidation_global_secs
        ));
    }
    if consolidation_global_secs <= consolidation_per_source_secs {
        violations.push(format!(
            "consolidation global ({}s) must exceed per-source ({}s)",
            consolidation_global_secs, consolidation_per_source_secs
        ));
    }
    if consolidation_per_source_secs <= per_uf_secs {
        violations.push(format!(
            "per-source ({}s) must exceed per-UF ({}s)",
            consolidation_per_source_secs, per_uf_secs
        ));
    }
    if per_uf_degraded_secs < per_uf_secs {
        violations.push(format!(
            "degraded per-UF ({}s) must be >= normal per-UF ({}s)",
            per_uf_degraded_secs, per_uf_secs
        ));
    }

    // Soft warning: per-source too close to global squeezes the margin
    // the consolidation layer needs to collect partial results.
    if consolidation_per_source_secs as f64 > consolidation_global_secs as f64 * 0.8 {
        tracing::warn!(
            per_source = consolidation_per_source_secs,
            global = consolidation_global_secs,
            "near-inversion: per-source timeout exceeds 80% of global"
        );
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_until_enough_samples() {
        let mgr = AdaptiveTimeoutManager::new(Duration::from_secs(90));
        assert_eq!(mgr.effective_timeout("PNCP", "SP"), Duration::from_secs(90));
        mgr.record_request("PNCP", "SP", Duration::from_secs(2), true, false);
        assert_eq!(mgr.effective_timeout("PNCP", "SP"), Duration::from_secs(90));
    }

    #[test]
    fn test_fast_uf_narrows_to_floor() {
        let mgr = AdaptiveTimeoutManager::new(Duration::from_secs(90));
        for _ in 0..20 {
            mgr.record_request("PNCP", "SP", Duration::from_secs(2), true, false);
        }
        // P95 ≈ 2s × 1.5 = 3s, clamped up to T_MIN.
        assert_eq!(mgr.effective_timeout("PNCP", "SP"), T_MIN);
    }

    #[test]
    fn test_slow_uf_widens_to_cap() {
        let mgr = AdaptiveTimeoutManager::new(Duration::from_secs(90));
        for _ in 0..20 {
            mgr.record_request("PNCP", "AM", Duration::from_secs(150), false, true);
        }
        assert_eq!(mgr.effective_timeout("PNCP", "AM"), T_MAX);
    }

    #[test]
    fn test_unhealthy_below_70_pct() {
        let mgr = AdaptiveTimeoutManager::new(Duration::from_secs(90));
        for i in 0..10 {
            let success = i < 6; // 60% success
            mgr.record_request("PNCP", "RR", Duration::from_secs(5), success, !success);
        }
        assert!(!mgr.is_healthy("PNCP", "RR"));
        assert_eq!(mgr.unhealthy_ufs("PNCP"), vec!["RR".to_string()]);
    }

    #[test]
    fn test_per_uf_isolation() {
        let mgr = AdaptiveTimeoutManager::new(Duration::from_secs(90));
        for _ in 0..10 {
            mgr.record_request("PNCP", "SP", Duration::from_secs(1), true, false);
        }
        assert_eq!(mgr.effective_timeout("PNCP", "SP"), T_MIN);
        assert_eq!(mgr.effective_timeout("PNCP", "RJ"), Duration::from_secs(90));
    }

    #[test]
    fn test_chain_defaults_hold() {
        let violations = validate_timeout_chain(480, 360, 300, 180, 90, 120);
        assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn test_chain_detects_inversion() {
        let violations = validate_timeout_chain(480, 360, 400, 180, 90, 120);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("pipeline fetch"));
    }

    #[test]
    fn test_chain_detects_degraded_below_normal() {
        let violations = validate_timeout_chain(480, 360, 300, 180, 90, 60);
        assert!(violations.iter().any(|v| v.contains("degraded")));
    }
}
