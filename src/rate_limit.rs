//! Sliding-window rate limiting and the SSE connection cap.
//!
//! Two backends: Redis (atomic INCR + EXPIRE on a window-bucketed key,
//! shared across replicas) and an in-process map used whenever Redis is
//! absent or errors. Authenticated callers are keyed by user id,
//! anonymous ones by client IP.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::cache::TieredCache;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_seconds: u64,
}

/// Rate-limit key plus its scope label for metrics.
pub fn client_key(user_id: Option<&str>, client_ip: &str) -> (String, &'static str) {
    match user_id {
        Some(id) if !id.is_empty() => (id.to_string(), "user"),
        _ => (client_ip.to_string(), "ip"),
    }
}

struct LocalWindow {
    count: u32,
    window_start: Instant,
}

pub struct RateLimiter {
    cache: Option<Arc<TieredCache>>,
    local: DashMap<String, LocalWindow>,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(cache: Option<Arc<TieredCache>>, enabled: bool) -> Self {
        Self {
            cache,
            local: DashMap::new(),
            enabled,
        }
    }

    /// Check-and-count one request against `limit` per `window_secs`.
    pub async fn check(&self, key: &str, limit: u32, window_secs: u64) -> RateDecision {
        if !self.enabled || limit == 0 {
            return RateDecision {
                allowed: true,
                retry_after_seconds: 0,
            };
        }

        // Preferred: Redis window bucket shared across replicas.
        if let Some(cache) = &self.cache {
            let now_secs = chrono::Utc::now().timestamp() as u64;
            let bucket = now_secs / window_secs.max(1);
            let redis_key = format!("ratelimit:{}:{}", key, bucket);
            if let Some(count) = cache.increment(&redis_key, window_secs).await {
                let allowed = count <= limit as u64;
                let retry_after = window_secs - (now_secs % window_secs.max(1));
                return RateDecision {
                    allowed,
                    retry_after_seconds: if allowed { 0 } else { retry_after.max(1) },
                };
            }
            // Redis errored; fall through to the in-process window.
        }

        let window = std::time::Duration::from_secs(window_secs);
        let mut entry = self.local.entry(key.to_string()).or_insert(LocalWindow {
            count: 0,
            window_start: Instant::now(),
        });
        if entry.window_start.elapsed() >= window {
            entry.count = 0;
            entry.window_start = Instant::now();
        }
        entry.count += 1;
        let allowed = entry.count <= limit;
        let retry_after = window
            .saturating_sub(entry.window_start.elapsed())
            .as_secs()
            .max(1);

        RateDecision {
            allowed,
            retry_after_seconds: if allowed { 0 } else { retry_after },
        }
    }

    /// Enforcement wrapper: counts the 429 metric and emits the WARNING
    /// log when the limit is hit.
    pub async fn enforce(
        &self,
        endpoint: &str,
        key: &str,
        scope: &str,
        limit: u32,
        window_secs: u64,
        correlation_id: &str,
    ) -> RateDecision {
        let decision = self.check(key, limit, window_secs).await;
        if !decision.allowed {
            metrics::RATE_LIMIT_EXCEEDED
                .with_label_values(&[endpoint, scope])
                .inc();
            tracing::warn!(
                endpoint = endpoint,
                key = %crate::correlation::sanitize(key),
                limit = limit,
                correlation_id = correlation_id,
                "rate limit exceeded"
            );
        }
        decision
    }
}

// ── SSE connection cap ───────────────────────────────────────

/// Per-user counter of open SSE streams. `release` must be called on
/// every stream close, including error paths.
pub struct SseConnectionTracker {
    connections: DashMap<String, usize>,
    cap: usize,
}

impl SseConnectionTracker {
    pub fn new(cap: usize) -> Self {
        Self {
            connections: DashMap::new(),
            cap,
        }
    }

    pub fn acquire(&self, user_id: &str) -> bool {
        let mut entry = self.connections.entry(user_id.to_string()).or_insert(0);
        if *entry >= self.cap {
            return false;
        }
        *entry += 1;
        true
    }

    pub fn release(&self, user_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(user_id) {
            *entry = entry.saturating_sub(1);
        }
    }

    pub fn active(&self, user_id: &str) -> usize {
        self.connections.get(user_id).map(|e| *e).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(None, true)
    }

    #[tokio::test]
    async fn test_limit_enforced_in_process() {
        let rl = limiter();
        for i in 0..10 {
            let d = rl.check("user-a", 10, 60).await;
            assert!(d.allowed, "request {} should pass", i + 1);
        }
        let d = rl.check("user-a", 10, 60).await;
        assert!(!d.allowed);
        assert!(d.retry_after_seconds >= 1);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let rl = limiter();
        for _ in 0..5 {
            rl.check("user-a", 5, 60).await;
        }
        assert!(!rl.check("user-a", 5, 60).await.allowed);
        assert!(rl.check("user-b", 5, 60).await.allowed);
    }

    #[tokio::test]
    async fn test_window_expiry_unblocks() {
        let rl = limiter();
        assert!(rl.check("user-c", 1, 1).await.allowed);
        assert!(!rl.check("user-c", 1, 1).await.allowed);
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(rl.check("user-c", 1, 1).await.allowed);
    }

    #[tokio::test]
    async fn test_disabled_always_allows() {
        let rl = RateLimiter::new(None, false);
        for _ in 0..100 {
            assert!(rl.check("any", 1, 60).await.allowed);
        }
    }

    #[test]
    fn test_client_key_prefers_user() {
        assert_eq!(client_key(Some("u1"), "1.2.3.4"), ("u1".into(), "user"));
        assert_eq!(client_key(None, "1.2.3.4"), ("1.2.3.4".into(), "ip"));
        assert_eq!(client_key(Some(""), "1.2.3.4"), ("1.2.3.4".into(), "ip"));
    }

    #[test]
    fn test_sse_cap() {
        let tracker = SseConnectionTracker::new(3);
        assert!(tracker.acquire("u"));
        assert!(tracker.acquire("u"));
        assert!(tracker.acquire("u"));
        assert!(!tracker.acquire("u"));
        tracker.release("u");
        assert!(tracker.acquire("u"));
        assert_eq!(tracker.active("u"), 3);
    }

    #[test]
    fn test_sse_release_never_underflows() {
        let tracker = SseConnectionTracker::new(1);
        tracker.release("ghost");
        assert_eq!(tracker.active("ghost"), 0);
    }
}
