//! Retrying HTTP client shared by every source adapter.
//!
//! The retry loop, cooperative rate limiting, circuit breaking and the
//! transparent response cache all live here so adapters only describe
//! their wire protocol. Errors leave this module as typed `SourceError`
//! variants; adapters never see a raw transport error.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;

use super::breaker::BreakerRegistry;
use super::response_cache::ResponseCache;

pub const MAX_ATTEMPTS: u32 = 4;

/// Typed upstream failure, as seen by adapters and consolidation.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<u64> },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("upstream API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unparsable upstream response: {0}")]
    Parse(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("canceled")]
    Canceled,

    #[error("circuit breaker open")]
    CircuitOpen,
}

/// Retry/backoff knobs. Defaults follow the production profile; tests
/// shrink the backoff to keep the suite fast.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// One upstream request, fully described.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// Logical upstream label; keys the breaker, the rate limiter and
    /// the response cache.
    pub upstream: String,
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub cacheable: bool,
}

impl RequestSpec {
    pub fn get(upstream: &str, url: &str) -> Self {
        Self {
            upstream: upstream.to_string(),
            method: Method::GET,
            url: url.to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(30),
            cacheable: false,
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cached(mut self) -> Self {
        self.cacheable = true;
        self
    }
}

pub struct ResilientClient {
    http: Client,
    breakers: BreakerRegistry,
    cache: ResponseCache,
    policy: RetryPolicy,
    /// Cooperative rate limiting: minimum inter-request interval and the
    /// last send instant, per upstream.
    min_interval: DashMap<String, Duration>,
    last_send: DashMap<String, Instant>,
}

impl ResilientClient {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent("BidIQ/1.0 (procurement-aggregator)")
            .build()
            .unwrap_or_default();
        Self {
            http,
            breakers: BreakerRegistry::new(),
            cache: ResponseCache::with_defaults(),
            policy,
            min_interval: DashMap::new(),
            last_send: DashMap::new(),
        }
    }

    /// Derive the per-upstream minimum inter-request delay from the
    /// adapter's declared requests-per-second budget.
    pub fn set_rate_limit(&self, upstream: &str, rps: f64) {
        if rps > 0.0 {
            self.min_interval
                .insert(upstream.to_string(), Duration::from_secs_f64(1.0 / rps));
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Execute a request with retries. See module docs for the policy.
    pub async fn request(&self, spec: &RequestSpec) -> Result<Value, SourceError> {
        // Cache hits bypass rate limiting and the breaker entirely.
        let cache_key = if spec.cacheable {
            let key = ResponseCache::compute_key(
                &spec.upstream,
                spec.method.as_str(),
                &spec.url,
                &spec.query,
                spec.body.as_ref(),
            );
            if let Some(hit) = self.cache.get(&key) {
                tracing::debug!(upstream = %spec.upstream, "response cache hit");
                return Ok(hit);
            }
            Some(key)
        } else {
            None
        };

        let breaker = self.breakers.get(&spec.upstream);
        if breaker.is_open() {
            tracing::warn!(upstream = %spec.upstream, "short-circuit: breaker open");
            return Err(SourceError::CircuitOpen);
        }

        let mut attempt: u32 = 0;
        let mut retried_422 = false;

        loop {
            attempt += 1;
            self.cooperative_wait(&spec.upstream).await;

            let mut builder = self
                .http
                .request(spec.method.clone(), &spec.url)
                .timeout(spec.timeout)
                .query(&spec.query);
            for (name, value) in &spec.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &spec.body {
                builder = builder.json(body);
            }

            let outcome = match builder.send().await {
                Ok(resp) => self.classify_response(spec, resp).await,
                Err(e) if e.is_timeout() => Attempt::Retryable(SourceError::Timeout {
                    seconds: spec.timeout.as_secs(),
                }),
                Err(e) => Attempt::Retryable(SourceError::Network(e.to_string())),
            };

            match outcome {
                Attempt::Success(value) => {
                    breaker.record_success();
                    if let Some(key) = &cache_key {
                        self.cache.put(key.clone(), value.clone());
                    }
                    return Ok(value);
                }
                Attempt::Fatal(err) => {
                    breaker.record_failure();
                    return Err(err);
                }
                Attempt::Unprocessable(err) => {
                    // 422 is special-cased: the body was already logged by
                    // classify_response; one retry, breaker failure counted.
                    breaker.record_failure();
                    if retried_422 || attempt >= self.policy.max_attempts {
                        return Err(err);
                    }
                    retried_422 = true;
                    sleep(self.backoff(attempt)).await;
                }
                Attempt::Retryable(err) => {
                    breaker.record_failure();
                    if attempt >= self.policy.max_attempts {
                        tracing::warn!(
                            upstream = %spec.upstream,
                            attempts = attempt,
                            "retries exhausted: {}",
                            err
                        );
                        return Err(err);
                    }
                    let wait = match &err {
                        SourceError::RateLimited {
                            retry_after: Some(secs),
                        } => Duration::from_secs(*secs),
                        _ => self.backoff(attempt),
                    };
                    tracing::warn!(
                        upstream = %spec.upstream,
                        attempt = attempt,
                        wait_ms = wait.as_millis() as u64,
                        "attempt failed, retrying: {}",
                        err
                    );
                    sleep(wait).await;
                }
            }
        }
    }

    async fn classify_response(&self, spec: &RequestSpec, resp: reqwest::Response) -> Attempt {
        let status = resp.status();

        if status.is_success() {
            return match resp.json::<Value>().await {
                Ok(value) => Attempt::Success(value),
                Err(e) => Attempt::Fatal(SourceError::Parse(e.to_string())),
            };
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Attempt::Retryable(SourceError::RateLimited { retry_after });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = truncate_body(resp).await;
            return Attempt::Fatal(SourceError::Auth(body));
        }

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = truncate_body(resp).await;
            tracing::warn!(
                upstream = %spec.upstream,
                body = %body,
                "upstream returned 422"
            );
            return Attempt::Unprocessable(SourceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        if status.is_server_error() {
            let body = truncate_body(resp).await;
            return Attempt::Retryable(SourceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        // Remaining 4xx are fatal.
        let body = truncate_body(resp).await;
        Attempt::Fatal(SourceError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// `min(base × 2^attempt, max)` with uniform jitter in [0.5, 1.5].
    fn backoff(&self, attempt: u32) -> Duration {
        let raw = self.policy.base_backoff.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = raw.min(self.policy.max_backoff.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_secs_f64(capped * jitter)
    }

    async fn cooperative_wait(&self, upstream: &str) {
        let Some(interval) = self.min_interval.get(upstream).map(|i| *i) else {
            return;
        };
        let wait = self.last_send.get(upstream).and_then(|last| {
            let elapsed = last.elapsed();
            (elapsed < interval).then(|| interval - elapsed)
        });
        if let Some(wait) = wait {
            sleep(wait).await;
        }
        self.last_send.insert(upstream.to_string(), Instant::now());
    }
}

impl Default for ResilientClient {
    fn default() -> Self {
        Self::new()
    }
}

enum Attempt {
    Success(Value),
    Retryable(SourceError),
    Unprocessable(SourceError),
    Fatal(SourceError),
}

async fn truncate_body(resp: reqwest::Response) -> String {
    let body = resp.text().await.unwrap_or_default();
    body.chars().take(500).collect()
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_client() -> ResilientClient {
        ResilientClient::with_policy(RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        })
    }

    fn spec_for(server: &MockServer, upstream: &str) -> RequestSpec {
        RequestSpec::get(upstream, &format!("{}/data", server.uri()))
            .with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_retry_on_500_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let client = fast_client();
        let out = client.request(&spec_for(&server, "t1")).await.unwrap();
        assert_eq!(out["ok"], true);
    }

    #[tokio::test]
    async fn test_404_is_fatal_no_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client();
        let err = client.request(&spec_for(&server, "t2")).await.unwrap_err();
        assert!(matches!(err, SourceError::Api { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_401_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client();
        let err = client.request(&spec_for(&server, "t3")).await.unwrap_err();
        assert!(matches!(err, SourceError::Auth(_)));
    }

    #[tokio::test]
    async fn test_422_retried_exactly_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(422).set_body_string(r#"{"erro":"datas"}"#))
            .expect(2)
            .mount(&server)
            .await;

        let client = fast_client();
        let err = client.request(&spec_for(&server, "t4")).await.unwrap_err();
        assert!(matches!(err, SourceError::Api { status: 422, .. }));
    }

    #[tokio::test]
    async fn test_429_respects_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = fast_client();
        let start = Instant::now();
        client.request(&spec_for(&server, "t5")).await.unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(900),
            "Retry-After header must override backoff ({:?})",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn test_breaker_short_circuits_after_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = fast_client();
        let spec = spec_for(&server, "t6");

        // Two exhausted calls record 8 consecutive failures (threshold 5).
        let _ = client.request(&spec).await;
        let _ = client.request(&spec).await;

        let err = client.request(&spec).await.unwrap_err();
        assert!(matches!(err, SourceError::CircuitOpen));
        let received = server.received_requests().await.unwrap().len();
        assert_eq!(received, 8, "open breaker must not touch the network");
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"n": 1})))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client();
        let spec = spec_for(&server, "t7").cached();
        let first = client.request(&spec).await.unwrap();
        let second = client.request(&spec).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_error_responses_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(404))
            .expect(2)
            .mount(&server)
            .await;

        let client = fast_client();
        let spec = spec_for(&server, "t8").cached();
        assert!(client.request(&spec).await.is_err());
        assert!(client.request(&spec).await.is_err());
    }

    #[tokio::test]
    async fn test_cooperative_rate_limit_spaces_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = fast_client();
        client.set_rate_limit("t9", 10.0); // 100ms between requests
        let spec = spec_for(&server, "t9");

        let start = Instant::now();
        client.request(&spec).await.unwrap();
        client.request(&spec).await.unwrap();
        client.request(&spec).await.unwrap();
        assert!(
            start.elapsed() >= Duration::from_millis(180),
            "three requests at 10 rps must take ≥200ms-ish ({:?})",
            start.elapsed()
        );
    }
}
