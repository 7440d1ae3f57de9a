//! Search lifecycle state machine with persisted transitions.
//!
//! Every transition is appended to `search_state_transitions` and
//! mirrored onto the `search_sessions` row; both writes fire-and-forget
//! so persistence latency never slows the pipeline. Invalid transitions
//! are rejected and logged loudly. Startup recovery marks runs left
//! behind by a crash or deploy.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::json;

use crate::metrics;
use crate::models::search::{validate_transition, SearchState};
use crate::store::PgStore;

pub struct SearchStateMachine {
    search_id: String,
    /// Absent in unit tests; persistence becomes a no-op.
    store: Option<PgStore>,
    inner: Mutex<MachineInner>,
}

struct MachineInner {
    current: Option<SearchState>,
    last_transition_at: Instant,
}

impl SearchStateMachine {
    pub fn new(search_id: &str, store: Option<PgStore>) -> Self {
        Self {
            search_id: search_id.to_string(),
            store,
            inner: Mutex::new(MachineInner {
                current: None,
                last_transition_at: Instant::now(),
            }),
        }
    }

    pub fn current_state(&self) -> Option<SearchState> {
        self.inner.lock().unwrap().current
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state().map(|s| s.is_terminal()).unwrap_or(false)
    }

    /// Attempt a transition. Returns false (and logs at ERROR with a
    /// CRITICAL marker) when the move is not in the allowed graph.
    pub fn transition_to(
        &self,
        to: SearchState,
        stage: Option<&str>,
        details: serde_json::Value,
    ) -> bool {
        let (from, duration_ms) = {
            let mut inner = self.inner.lock().unwrap();
            if !validate_transition(inner.current, to) {
                tracing::error!(
                    search_id = %self.search_id,
                    from = inner.current.map(|s| s.as_str()).unwrap_or("none"),
                    to = to.as_str(),
                    "CRITICAL: invalid state transition rejected"
                );
                return false;
            }
            let from = inner.current;
            let duration_ms = from.map(|_| inner.last_transition_at.elapsed().as_millis() as i64);
            inner.current = Some(to);
            inner.last_transition_at = Instant::now();
            (from, duration_ms)
        };

        tracing::info!(
            search_id = %self.search_id,
            from_state = from.map(|s| s.as_str()).unwrap_or("none"),
            to_state = to.as_str(),
            stage = stage.unwrap_or("-"),
            duration_ms = duration_ms.unwrap_or(0),
            "state transition"
        );

        if let (Some(from), Some(duration_ms)) = (from, duration_ms) {
            metrics::STATE_DURATION
                .with_label_values(&[from.as_str()])
                .observe(duration_ms as f64 / 1000.0);
        }

        if let Some(store) = &self.store {
            let store = store.clone();
            let search_id = self.search_id.clone();
            let stage_owned = stage.map(str::to_string);
            tokio::spawn(async move {
                if let Err(e) = store
                    .insert_transition(
                        &search_id,
                        from.map(|s| s.as_str()),
                        to.as_str(),
                        stage_owned.as_deref(),
                        &details,
                        duration_ms,
                    )
                    .await
                {
                    tracing::warn!(search_id = %search_id, "failed to persist transition: {}", e);
                }
                if let Err(e) = store
                    .update_session_state(
                        &search_id,
                        to.as_str(),
                        stage_owned.as_deref(),
                        to.is_terminal(),
                    )
                    .await
                {
                    tracing::warn!(search_id = %search_id, "failed to update session state: {}", e);
                }
            });
        }

        true
    }

    pub fn fail(&self, error_code: &str, error_message: &str, stage: Option<&str>) -> bool {
        let ok = self.transition_to(
            SearchState::Failed,
            stage,
            json!({"error_code": error_code, "error_message": error_message}),
        );
        self.persist_error(error_code, error_message);
        ok
    }

    pub fn timeout(&self, stage: Option<&str>) -> bool {
        let ok = self.transition_to(
            SearchState::TimedOut,
            stage,
            json!({"reason": "pipeline deadline exceeded"}),
        );
        self.persist_error("timeout", "Tempo limite excedido");
        ok
    }

    pub fn rate_limited(&self, retry_after: u64) -> bool {
        self.transition_to(
            SearchState::RateLimited,
            Some("validate"),
            json!({"retry_after": retry_after}),
        )
    }

    fn persist_error(&self, code: &str, message: &str) {
        if let Some(store) = &self.store {
            let store = store.clone();
            let search_id = self.search_id.clone();
            let code = code.to_string();
            let message = message.to_string();
            tokio::spawn(async move {
                if let Err(e) = store.update_session_error(&search_id, &code, &message).await {
                    tracing::warn!(search_id = %search_id, "failed to persist error: {}", e);
                }
            });
        }
    }
}

// ── Active machine registry ──────────────────────────────────

#[derive(Default)]
pub struct StateMachineRegistry {
    machines: DashMap<String, Arc<SearchStateMachine>>,
}

impl StateMachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, search_id: &str, store: Option<PgStore>) -> Arc<SearchStateMachine> {
        let machine = Arc::new(SearchStateMachine::new(search_id, store));
        machine.transition_to(SearchState::Created, Some("init"), json!({}));
        self.machines.insert(search_id.to_string(), machine.clone());
        machine
    }

    pub fn get(&self, search_id: &str) -> Option<Arc<SearchStateMachine>> {
        self.machines.get(search_id).map(|m| m.clone())
    }

    pub fn remove(&self, search_id: &str) {
        self.machines.remove(search_id);
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

// ── Startup recovery ─────────────────────────────────────────

/// Finalize searches left non-terminal by a restart.
///
/// Older than the cutoff → `timed_out` with error `timeout`; newer →
/// `failed` with error `server_restart`. Already-terminal rows are never
/// selected, so running recovery twice is a no-op.
pub async fn recover_stale_searches(store: &PgStore, max_age_minutes: i64) -> usize {
    let now = Utc::now();
    let cutoff = now - ChronoDuration::minutes(max_age_minutes);

    let sessions = match store.list_stale_sessions(cutoff).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!("startup recovery query failed, skipping: {}", e);
            return 0;
        }
    };

    if sessions.is_empty() {
        tracing::info!("startup recovery: no stale searches found");
        return 0;
    }

    let mut timed_out = 0usize;
    let mut failed = 0usize;
    for session in sessions {
        let reference = session.started_at.unwrap_or(session.created_at);
        let (status, code, message) = if reference < cutoff {
            ("timed_out", "timeout", "Server restart during processing")
        } else {
            ("failed", "server_restart", "Server restart — retry recommended")
        };

        if let Err(e) = store
            .finalize_stale_session(session.id, status, code, message)
            .await
        {
            tracing::warn!("startup recovery: failed to finalize {}: {}", session.id, e);
            continue;
        }
        if status == "timed_out" {
            timed_out += 1;
        } else {
            failed += 1;
        }

        if let Some(search_id) = &session.search_id {
            let from = session.status.clone();
            let _ = store
                .insert_transition(
                    search_id,
                    from.as_deref(),
                    status,
                    Some("recovery"),
                    &json!({"reason": message}),
                    None,
                )
                .await;
        }
    }

    let total = timed_out + failed;
    tracing::info!(
        total = total,
        timed_out = timed_out,
        failed = failed,
        "startup recovery: stale sessions finalized"
    );
    total
}

// ── Status queries ───────────────────────────────────────────

/// Status blob for polling clients: session row + latest transition +
/// coarse progress percentage.
pub async fn get_search_status(
    store: &PgStore,
    search_id: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let Some(session) = store.get_session(search_id).await? else {
        return Ok(None);
    };
    let latest = store.latest_transition(search_id).await?;

    let status = latest
        .as_ref()
        .map(|t| t.to_state.clone())
        .unwrap_or_else(|| session.status.clone());
    let progress = progress_for(&status);
    let elapsed_ms = session
        .started_at
        .map(|s| (Utc::now() - s).num_milliseconds());

    Ok(Some(json!({
        "search_id": search_id,
        "status": status,
        "progress": progress,
        "stage": session.pipeline_stage,
        "started_at": session.started_at,
        "completed_at": session.completed_at,
        "elapsed_ms": elapsed_ms,
        "total_raw": session.total_raw,
        "total_filtered": session.total_filtered,
        "valor_total": session.valor_total,
        "error_code": session.error_code,
        "error_message": session.error_message,
    })))
}

fn progress_for(status: &str) -> i8 {
    match status {
        "created" => 0,
        "validating" => 5,
        "fetching" => 30,
        "filtering" => 60,
        "enriching" => 70,
        "generating" => 85,
        "persisting" => 95,
        "completed" => 100,
        "failed" | "rate_limited" | "timed_out" => -1,
        _ => 0,
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SearchStateMachine {
        SearchStateMachine::new("search-1", None)
    }

    #[tokio::test]
    async fn test_happy_path_walk() {
        let m = machine();
        for state in [
            SearchState::Created,
            SearchState::Validating,
            SearchState::Fetching,
            SearchState::Filtering,
            SearchState::Enriching,
            SearchState::Generating,
            SearchState::Persisting,
            SearchState::Completed,
        ] {
            assert!(m.transition_to(state, Some("stage"), json!({})), "{:?}", state);
        }
        assert!(m.is_terminal());
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let m = machine();
        assert!(m.transition_to(SearchState::Created, None, json!({})));
        assert!(!m.transition_to(SearchState::Fetching, None, json!({})));
        assert_eq!(m.current_state(), Some(SearchState::Created));
    }

    #[tokio::test]
    async fn test_fail_from_any_non_terminal() {
        let m = machine();
        m.transition_to(SearchState::Created, None, json!({}));
        m.transition_to(SearchState::Validating, None, json!({}));
        assert!(m.fail("boom", "erro interno", Some("validate")));
        assert!(m.is_terminal());
        // Terminal is final.
        assert!(!m.transition_to(SearchState::Fetching, None, json!({})));
    }

    #[tokio::test]
    async fn test_rate_limited_transition() {
        let m = machine();
        m.transition_to(SearchState::Created, None, json!({}));
        assert!(m.rate_limited(60));
        assert_eq!(m.current_state(), Some(SearchState::RateLimited));
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = StateMachineRegistry::new();
        let m = registry.create("s1", None);
        assert_eq!(m.current_state(), Some(SearchState::Created));
        assert!(registry.get("s1").is_some());
        registry.remove("s1");
        assert!(registry.get("s1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_progress_mapping_matches_states() {
        assert_eq!(progress_for("fetching"), 30);
        assert_eq!(progress_for("completed"), 100);
        assert_eq!(progress_for("timed_out"), -1);
        assert_eq!(progress_for("unknown"), 0);
    }
}
