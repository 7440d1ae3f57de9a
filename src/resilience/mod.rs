//! HTTP resilience core: retrying client, circuit breaker, response
//! cache, and adaptive per-UF timeouts.

pub mod breaker;
pub mod client;
pub mod response_cache;
pub mod timeouts;

pub use client::{RequestSpec, ResilientClient, RetryPolicy, SourceError};
pub use timeouts::AdaptiveTimeoutManager;
