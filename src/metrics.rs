//! Prometheus metrics for the search pipeline.
//!
//! All metrics live in the global default registry and are exposed on
//! the `/metrics` endpoint in Prometheus text format.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec,
    TextEncoder,
};

pub static RATE_LIMIT_EXCEEDED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "bidiq_rate_limit_exceeded_total",
            "Requests rejected with 429, by endpoint and key scope"
        ),
        &["endpoint", "scope"]
    )
    .expect("failed to register bidiq_rate_limit_exceeded_total")
});

pub static SOURCE_FETCH_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "bidiq_source_fetch_total",
            "Consolidation fetch outcomes per source"
        ),
        &["source", "status"]
    )
    .expect("failed to register bidiq_source_fetch_total")
});

pub static SOURCE_FETCH_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        prometheus::histogram_opts!(
            "bidiq_source_fetch_duration_seconds",
            "Wall time of each source fetch",
            vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 180.0, 300.0]
        ),
        &["source"]
    )
    .expect("failed to register bidiq_source_fetch_duration_seconds")
});

pub static STATE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        prometheus::histogram_opts!(
            "bidiq_state_duration_seconds",
            "Time spent in each search state before transitioning out",
            vec![0.05, 0.25, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
        ),
        &["state"]
    )
    .expect("failed to register bidiq_state_duration_seconds")
});

pub static LLM_ARBITER_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "bidiq_llm_arbiter_total",
            "LLM arbiter decisions by mode and outcome"
        ),
        &["mode", "decision"]
    )
    .expect("failed to register bidiq_llm_arbiter_total")
});

/// Encode all registered metrics in Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_increment() {
        RATE_LIMIT_EXCEEDED
            .with_label_values(&["/v1/buscar", "user"])
            .inc();
        SOURCE_FETCH_TOTAL.with_label_values(&["PNCP", "success"]).inc();
        let out = encode_metrics();
        assert!(out.contains("bidiq_rate_limit_exceeded_total"));
    }
}
