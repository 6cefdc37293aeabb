//! Store client: durable append-only streams, latest-state hashes and
//! pub/sub, fronted by a retry policy and a circuit breaker.

pub mod backoff;
pub mod breaker;
mod client;

use std::time::Duration;

use thiserror::Error;

pub use backoff::{Backoff, RetryPolicy};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use client::{RedisStore, StoreResult, StreamEntry, StreamReader, Subscription};

/// Failure modes surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The breaker is open; the store was not contacted.
    #[error("circuit breaker is open")]
    CircuitOpen,
    /// A single attempt exceeded its deadline.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}
