//! Process-local response cache for upstream GET traffic.
//!
//! Keyed by `(upstream, method, path, sorted query, body hash)`. Only
//! successful 2xx JSON responses are stored. A hit is fully transparent:
//! it bypasses the rate limiter and the circuit breaker.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub const MAX_ENTRIES: usize = 1024;

struct Entry {
    stored_at: Instant,
    value: Value,
}

pub struct ResponseCache {
    entries: DashMap<String, Entry>,
    /// Insertion order for eviction when the cache is full.
    order: Mutex<VecDeque<String>>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            ttl,
            max_entries,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_TTL, MAX_ENTRIES)
    }

    /// Deterministic cache key. Query parameters are sorted so parameter
    /// order never splits the cache.
    pub fn compute_key(
        upstream: &str,
        method: &str,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> String {
        let mut sorted: Vec<_> = query.to_vec();
        sorted.sort();

        let mut hasher = Sha256::new();
        hasher.update(upstream.as_bytes());
        hasher.update(b":");
        hasher.update(method.as_bytes());
        hasher.update(b":");
        hasher.update(path.as_bytes());
        hasher.update(b":");
        for (k, v) in &sorted {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b"&");
        }
        if let Some(body) = body {
            hasher.update(body.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, key: String, value: Value) {
        let mut order = self.order.lock().unwrap();
        while self.entries.len() >= self.max_entries {
            match order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        order.push_back(key.clone());
        drop(order);

        self.entries.insert(
            key,
            Entry {
                stored_at: Instant::now(),
                value,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.order.lock().unwrap().clear();
    }
}
