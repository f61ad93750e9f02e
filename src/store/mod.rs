//! Shared limiter store port.
//!
//! The store owns every budget: it creates limiters by name, configures
//! their rate and hands out permits. Flowguard only holds handles to them.
//! [`MemoryStore`] is the in-process implementation; network-backed stores
//! implement [`LimiterStore`] themselves.

mod memory;

pub use memory::{MemoryBackend, MemoryLimiter, MemoryStore, MemoryStoreConfig};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::RateConfig;

/// Errors reported by a limiter store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store did not answer in time. This is a transport deadline, not a
    /// business rejection.
    #[error("Store timed out: {0}")]
    Timeout(String),
    #[error("Limiter {0} has no rate configured")]
    NotConfigured(String),
    #[error("Requested {requested} permits but the budget only holds {capacity}")]
    InsufficientCapacity { requested: u64, capacity: u64 },
    #[error("Invalid rate: {0}")]
    InvalidRate(String),
    #[error("Store has been shut down")]
    Shutdown,
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this failure is a deadline exceeded while waiting on the store.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

/// Distributed limiter primitives consumed by the registry and the
/// acquisition engine.
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Opaque reference to one named limiter.
    type Handle: Clone + Send + Sync + 'static;

    /// Get a handle to the limiter called `name`, creating it if needed.
    async fn get_or_create_limiter(&self, name: &str) -> Result<Self::Handle, StoreError>;

    /// Configure the rate only if none is configured yet.
    ///
    /// Returns `false` when the limiter already carries a rate.
    async fn try_set_rate(&self, handle: &Self::Handle, rate: &RateConfig) -> Result<bool, StoreError>;

    /// Configure the rate unconditionally.
    async fn force_set_rate(&self, handle: &Self::Handle, rate: &RateConfig) -> Result<(), StoreError>;

    /// Read the configured rate, if any.
    async fn rate_config(&self, handle: &Self::Handle) -> Result<Option<RateConfig>, StoreError>;

    /// Take `permits` if they are available right now.
    async fn try_acquire(&self, handle: &Self::Handle, permits: u64) -> Result<bool, StoreError>;

    /// Take `permits`, waiting at most `timeout` for them.
    async fn try_acquire_within(
        &self,
        handle: &Self::Handle,
        permits: u64,
        timeout: Duration,
    ) -> Result<bool, StoreError>;

    /// Take `permits`, waiting as long as the store lets the caller wait.
    async fn acquire(&self, handle: &Self::Handle, permits: u64) -> Result<(), StoreError>;

    /// Release the store client.
    async fn shutdown(&self) -> Result<(), StoreError>;
}
