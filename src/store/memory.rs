//! In-process limiter store backed by `governor`.
//!
//! A [`MemoryBackend`] holds the budgets. Each [`MemoryStore`] is one client
//! of a backend with its own client id, so several stores sharing a backend
//! behave like several processes sharing one external store: `Shared`
//! budgets are common to all of them while `PerInstance` budgets are keyed
//! by client id.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{InsufficientCapacity, Quota, RateLimiter as GovernorRateLimiter};
use parking_lot::RwLock;
use tracing::{debug, info, trace};

use super::{LimiterStore, StoreError};
use crate::ratelimit::{RateConfig, Scope};

type DirectRateLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Configuration for one store client.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Unique client identifier; keys `PerInstance` budgets.
    pub client_id: String,
    /// Longest a blocking acquisition may wait before the store reports a
    /// timeout. `None` waits indefinitely.
    pub response_timeout: Option<Duration>,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            response_timeout: None,
        }
    }
}

/// Budgets shared by every client of this backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    buckets: DashMap<String, Arc<Bucket>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of named limiters created so far.
    pub fn limiter_count(&self) -> usize {
        self.buckets.len()
    }

    /// Whether a limiter called `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }
}

struct Bucket {
    name: String,
    state: RwLock<BucketState>,
}

#[derive(Default)]
struct BucketState {
    config: Option<RateConfig>,
    shared: Option<Arc<DirectRateLimiter>>,
    per_client: HashMap<String, Arc<DirectRateLimiter>>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("config", &self.state.read().config)
            .finish()
    }
}

impl Bucket {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(BucketState::default()),
        }
    }

    /// Replace the configuration and drop all accumulated permit state.
    fn configure(&self, config: &RateConfig) -> Result<(), StoreError> {
        let shared = build_limiter(config)?;
        let mut state = self.state.write();
        state.config = Some(*config);
        state.shared = Some(shared);
        state.per_client.clear();
        Ok(())
    }

    /// Get the limiter that serves `client_id`.
    fn limiter_for(&self, client_id: &str) -> Result<(Arc<DirectRateLimiter>, RateConfig), StoreError> {
        {
            let state = self.state.read();
            let config = state
                .config
                .ok_or_else(|| StoreError::NotConfigured(self.name.clone()))?;
            match config.scope {
                Scope::Shared => {
                    if let Some(limiter) = &state.shared {
                        return Ok((limiter.clone(), config));
                    }
                }
                Scope::PerInstance => {
                    if let Some(limiter) = state.per_client.get(client_id) {
                        return Ok((limiter.clone(), config));
                    }
                }
            }
        }

        let mut state = self.state.write();
        let config = state
            .config
            .ok_or_else(|| StoreError::NotConfigured(self.name.clone()))?;
        let limiter = match config.scope {
            Scope::Shared => match &state.shared {
                Some(limiter) => limiter.clone(),
                None => {
                    let limiter = build_limiter(&config)?;
                    state.shared = Some(limiter.clone());
                    limiter
                }
            },
            Scope::PerInstance => match state.per_client.get(client_id) {
                Some(limiter) => limiter.clone(),
                None => {
                    let limiter = build_limiter(&config)?;
                    state.per_client.insert(client_id.to_string(), limiter.clone());
                    limiter
                }
            },
        };
        Ok((limiter, config))
    }
}

/// Build a GCRA limiter that allows `rate` permits per `interval`, all of
/// which may be taken in one burst.
fn build_limiter(config: &RateConfig) -> Result<Arc<DirectRateLimiter>, StoreError> {
    let burst = u32::try_from(config.rate)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or_else(|| StoreError::InvalidRate(format!("rate {} is out of range", config.rate)))?;
    let quota = Quota::with_period(config.interval / burst.get())
        .ok_or_else(|| {
            StoreError::InvalidRate(format!(
                "interval {:?} is too short for rate {}",
                config.interval, config.rate
            ))
        })?
        .allow_burst(burst);
    Ok(Arc::new(DirectRateLimiter::direct(quota)))
}

fn permit_count(permits: u64) -> Result<NonZeroU32, StoreError> {
    if permits == 0 {
        return Err(StoreError::InvalidRate("permits must be at least 1".to_string()));
    }
    u32::try_from(permits)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or(StoreError::InsufficientCapacity {
            requested: permits,
            capacity: u64::from(u32::MAX),
        })
}

fn capacity_error(permits: u64, err: InsufficientCapacity) -> StoreError {
    StoreError::InsufficientCapacity {
        requested: permits,
        capacity: u64::from(err.0),
    }
}

/// Handle to one named limiter in a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryLimiter {
    name: Arc<str>,
    bucket: Arc<Bucket>,
}

impl MemoryLimiter {
    /// Name the limiter is addressed by.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One client of a [`MemoryBackend`].
pub struct MemoryStore {
    backend: Arc<MemoryBackend>,
    config: MemoryStoreConfig,
    closed: AtomicBool,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("config", &self.config)
            .field("limiters", &self.backend.limiter_count())
            .finish()
    }
}

impl MemoryStore {
    /// Create a store with its own private backend.
    pub fn new() -> Self {
        Self::connect(Arc::new(MemoryBackend::new()), MemoryStoreConfig::default())
    }

    /// Create a client of an existing backend.
    pub fn connect(backend: Arc<MemoryBackend>, config: MemoryStoreConfig) -> Self {
        info!(
            client_id = %config.client_id,
            response_timeout = ?config.response_timeout,
            "Connecting memory limiter store client"
        );
        Self {
            backend,
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Get our client ID.
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Get the backend this client talks to.
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Shutdown);
        }
        Ok(())
    }

    fn limiter(&self, handle: &MemoryLimiter) -> Result<Arc<DirectRateLimiter>, StoreError> {
        self.ensure_open()?;
        let (limiter, _) = handle.bucket.limiter_for(&self.config.client_id)?;
        Ok(limiter)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LimiterStore for MemoryStore {
    type Handle = MemoryLimiter;

    async fn get_or_create_limiter(&self, name: &str) -> Result<MemoryLimiter, StoreError> {
        self.ensure_open()?;
        let bucket = self
            .backend
            .buckets
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(limiter = %name, "Creating limiter");
                Arc::new(Bucket::new(name))
            })
            .clone();
        Ok(MemoryLimiter {
            name: Arc::from(name),
            bucket,
        })
    }

    async fn try_set_rate(&self, handle: &MemoryLimiter, rate: &RateConfig) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let shared = build_limiter(rate)?;
        let mut state = handle.bucket.state.write();
        if state.config.is_some() {
            return Ok(false);
        }
        state.config = Some(*rate);
        state.shared = Some(shared);
        state.per_client.clear();
        Ok(true)
    }

    async fn force_set_rate(&self, handle: &MemoryLimiter, rate: &RateConfig) -> Result<(), StoreError> {
        self.ensure_open()?;
        debug!(limiter = %handle.name, rate = rate.rate, interval = ?rate.interval, "Forcing limiter rate");
        handle.bucket.configure(rate)
    }

    async fn rate_config(&self, handle: &MemoryLimiter) -> Result<Option<RateConfig>, StoreError> {
        self.ensure_open()?;
        Ok(handle.bucket.state.read().config)
    }

    async fn try_acquire(&self, handle: &MemoryLimiter, permits: u64) -> Result<bool, StoreError> {
        let limiter = self.limiter(handle)?;
        let n = permit_count(permits)?;
        match limiter.check_n(n) {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Ok(false),
            Err(err) => Err(capacity_error(permits, err)),
        }
    }

    async fn try_acquire_within(
        &self,
        handle: &MemoryLimiter,
        permits: u64,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        let limiter = self.limiter(handle)?;
        let n = permit_count(permits)?;
        trace!(limiter = %handle.name, permits = permits, timeout = ?timeout, "Trying to acquire permits");
        match tokio::time::timeout(timeout, limiter.until_n_ready(n)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(err)) => Err(capacity_error(permits, err)),
            Err(_) => Ok(false),
        }
    }

    async fn acquire(&self, handle: &MemoryLimiter, permits: u64) -> Result<(), StoreError> {
        let limiter = self.limiter(handle)?;
        let n = permit_count(permits)?;
        trace!(limiter = %handle.name, permits = permits, "Waiting for permits");
        let ready = match self.config.response_timeout {
            Some(deadline) => tokio::time::timeout(deadline, limiter.until_n_ready(n))
                .await
                .map_err(|_| {
                    StoreError::Timeout(format!(
                        "no {} permits for {} within {:?}",
                        permits, handle.name, deadline
                    ))
                })?,
            None => limiter.until_n_ready(n).await,
        };
        ready.map(|_| ()).map_err(|err| capacity_error(permits, err))
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        info!(client_id = %self.config.client_id, "Shutting down memory limiter store client");
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
