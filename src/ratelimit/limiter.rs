//! Process-local registry of store-backed limiters.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use super::rules::RateSpec;
use crate::store::{LimiterStore, StoreError};

/// Maps resource identities to handles of limiters living in the shared store.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct LimiterRegistry<S: LimiterStore> {
    store: Arc<S>,
    /// Limiter handles indexed by resource identity
    limiters: DashMap<String, S::Handle>,
}

impl<S: LimiterStore> LimiterRegistry<S> {
    /// Create a registry in front of `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            limiters: DashMap::new(),
        }
    }

    /// Make sure a limiter for `identity` exists and carries the spec's rate.
    ///
    /// After the first call for an identity this is a local lookup. The first
    /// call tries to configure the budget only if it is unconfigured; when the
    /// store already has a rate for it (another process got there first, or a
    /// previous run left the key behind) the rate is overwritten with this
    /// spec's values.
    pub async fn ensure_limiter(&self, identity: &str, spec: &RateSpec) -> Result<(), StoreError> {
        if self.limiters.contains_key(identity) {
            return Ok(());
        }

        let handle = self.store.get_or_create_limiter(identity).await?;
        let rate = spec.rate_config();

        if self.store.try_set_rate(&handle, &rate).await? {
            debug!(
                resource = %identity,
                rate = rate.rate,
                interval = ?rate.interval,
                scope = ?rate.scope,
                "Initialized limiter rate"
            );
        } else if let Err(e) = self.store.force_set_rate(&handle, &rate).await {
            warn!(resource = %identity, error = %e, "Failed to reconcile existing limiter rate");
        } else {
            debug!(
                resource = %identity,
                rate = rate.rate,
                interval = ?rate.interval,
                "Reconciled existing limiter rate"
            );
        }

        self.limiters.entry(identity.to_string()).or_insert(handle);
        Ok(())
    }

    /// Get the handle registered for `identity`.
    pub fn get_limiter(&self, identity: &str) -> Option<S::Handle> {
        self.limiters.get(identity).map(|h| h.value().clone())
    }

    /// Take permits from a registered limiter without waiting.
    ///
    /// Returns `false` if no limiter is registered under `identity`.
    pub async fn try_acquire(&self, identity: &str, permits: u64) -> Result<bool, StoreError> {
        match self.get_limiter(identity) {
            Some(handle) => self.store.try_acquire(&handle, permits).await,
            None => {
                trace!(resource = %identity, "No limiter registered");
                Ok(false)
            }
        }
    }

    /// Wait for permits from a registered limiter.
    ///
    /// Does nothing if no limiter is registered under `identity`.
    pub async fn acquire(&self, identity: &str, permits: u64) -> Result<(), StoreError> {
        match self.get_limiter(identity) {
            Some(handle) => self.store.acquire(&handle, permits).await,
            None => {
                trace!(resource = %identity, "No limiter registered");
                Ok(())
            }
        }
    }

    /// Get the store this registry talks to.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Shut down the underlying store client.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        info!(limiters = self.limiters.len(), "Shutting down limiter registry");
        self.store.shutdown().await
    }
}
