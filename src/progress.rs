//! Real-time search progress for the SSE endpoint.
//!
//! One bounded event queue per active search, consumed by at most one
//! SSE stream. When Redis is configured every event is mirrored to the
//! `bidiq:progress:{search_id}:events` channel so a replica serving the
//! SSE connection can pick it up; mirror failures are logged and
//! ignored. Stale trackers are swept after a TTL.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cache::TieredCache;

pub const TRACKER_TTL: Duration = Duration::from_secs(600);
const QUEUE_CAPACITY: usize = 256;

/// Fetching occupies the [10, 55] band of the progress bar; per-UF
/// completions interpolate linearly inside it.
const FETCH_BAND_START: i8 = 10;
const FETCH_BAND_SPAN: i8 = 45;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: String,
    /// 0–100, or -1 to signal an error.
    pub progress: i8,
    pub message: String,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

pub struct ProgressTracker {
    pub search_id: String,
    pub uf_count: usize,
    created_at: Instant,
    tx: mpsc::Sender<ProgressEvent>,
    rx: Mutex<Option<mpsc::Receiver<ProgressEvent>>>,
    ufs_completed: AtomicUsize,
    is_complete: AtomicBool,
    cache: Option<Arc<TieredCache>>,
}

impl ProgressTracker {
    fn new(search_id: &str, uf_count: usize, cache: Option<Arc<TieredCache>>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            search_id: search_id.to_string(),
            uf_count,
            created_at: Instant::now(),
            tx,
            rx: Mutex::new(Some(rx)),
            ufs_completed: AtomicUsize::new(0),
            is_complete: AtomicBool::new(false),
            cache,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Hand the queue to the (single) SSE consumer. Subsequent calls
    /// return `None`; a reconnecting client gets the degraded path.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<ProgressEvent>> {
        self.rx.lock().unwrap().take()
    }

    /// Emit one event. Progress is clamped to [0, 100]; -1 passes
    /// through as the error marker.
    pub async fn emit(
        &self,
        stage: &str,
        progress: i8,
        message: &str,
        detail: serde_json::Value,
    ) {
        let progress = if progress < 0 { -1 } else { progress.min(100) };
        let event = ProgressEvent {
            stage: stage.to_string(),
            progress,
            message: message.to_string(),
            detail,
            timestamp: Utc::now(),
        };

        if let Err(e) = self.tx.try_send(event.clone()) {
            tracing::debug!(search_id = %self.search_id, "progress queue full or closed: {}", e);
        }

        if let Some(cache) = &self.cache {
            let channel = format!("bidiq:progress:{}:events", self.search_id);
            if let Ok(payload) = serde_json::to_string(&event) {
                cache.publish(&channel, &payload).await;
            }
        }
    }

    /// One UF finished fetching; progress moves linearly inside the
    /// fetching band.
    pub async fn emit_uf_complete(&self, uf: &str, items_count: usize) {
        let completed = self.ufs_completed.fetch_add(1, Ordering::Relaxed) + 1;
        let progress = if self.uf_count == 0 {
            FETCH_BAND_START
        } else {
            FETCH_BAND_START
                + ((completed.min(self.uf_count) * FETCH_BAND_SPAN as usize) / self.uf_count) as i8
        };
        self.emit(
            "fetching",
            progress,
            &format!("UF {} concluída", uf),
            serde_json::json!({"uf": uf, "items": items_count, "ufs_completed": completed}),
        )
        .await;
    }

    pub async fn emit_complete(&self) {
        self.is_complete.store(true, Ordering::Relaxed);
        self.emit("complete", 100, "Busca concluída", serde_json::json!({}))
            .await;
    }

    pub async fn emit_error(&self, message: &str) {
        self.is_complete.store(true, Ordering::Relaxed);
        self.emit("error", -1, message, serde_json::json!({})).await;
    }
}

// ── Registry ─────────────────────────────────────────────────

pub struct ProgressRegistry {
    trackers: DashMap<String, Arc<ProgressTracker>>,
    cache: Option<Arc<TieredCache>>,
    ttl: Duration,
}

impl ProgressRegistry {
    pub fn new(cache: Option<Arc<TieredCache>>) -> Self {
        Self {
            trackers: DashMap::new(),
            cache,
            ttl: TRACKER_TTL,
        }
    }

    #[cfg(test)]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            trackers: DashMap::new(),
            cache: None,
            ttl,
        }
    }

    pub async fn create_tracker(&self, search_id: &str, uf_count: usize) -> Arc<ProgressTracker> {
        let tracker = Arc::new(ProgressTracker::new(search_id, uf_count, self.cache.clone()));
        self.trackers.insert(search_id.to_string(), tracker.clone());

        // Metadata mirror lets another replica reconstruct a degraded
        // tracker after an SSE reconnect.
        if let Some(cache) = &self.cache {
            let key = format!("bidiq:progress:{}:meta", search_id);
            let meta = serde_json::json!({
                "search_id": search_id,
                "uf_count": uf_count,
                "created_at": Utc::now(),
            });
            if let Err(e) = cache.set(&key, &meta, self.ttl.as_secs()).await {
                tracing::warn!("failed to mirror tracker metadata: {}", e);
            }
        }

        tracker
    }

    pub fn get_tracker(&self, search_id: &str) -> Option<Arc<ProgressTracker>> {
        self.trackers.get(search_id).map(|t| t.clone())
    }

    pub fn remove_tracker(&self, search_id: &str) {
        self.trackers.remove(search_id);
    }

    pub fn active_count(&self) -> usize {
        self.trackers.len()
    }

    /// Reconnection fallback: tracker metadata from the pub/sub mirror,
    /// or `None` when Redis is absent or never saw this search.
    pub async fn degraded_tracker_info(&self, search_id: &str) -> Option<serde_json::Value> {
        let cache = self.cache.as_ref()?;
        cache
            .get::<serde_json::Value>(&format!("bidiq:progress:{}:meta", search_id))
            .await
    }

    /// Drop trackers older than the TTL. Returns how many were removed.
    pub fn sweep_stale(&self) -> usize {
        let before = self.trackers.len();
        self.trackers.retain(|_, tracker| tracker.age() < self.ttl);
        let removed = before - self.trackers.len();
        if removed > 0 {
            tracing::info!(removed = removed, "swept stale progress trackers");
        }
        removed
    }
}

// ── Tests ─────────────────────────────────────────────────────
