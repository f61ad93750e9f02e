//! Permit acquisition against a store-backed limiter.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use super::rules::RateSpec;
use crate::store::{LimiterStore, StoreError};

/// Why a call did not get its permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The store timed out while the caller was waiting for permits.
    Blocked,
    /// No permits became available within the configured timeout.
    NonBlockingTimeout,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Blocked => "blocked",
            RejectReason::NonBlockingTimeout => "non-blocking timeout",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call was refused admission. Handed to fallbacks that accept the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("blocked: {reason}")]
pub struct Rejection {
    pub reason: RejectReason,
}

impl Rejection {
    pub fn new(reason: RejectReason) -> Self {
        Self { reason }
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Granted,
    Rejected(Rejection),
}

impl Outcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Outcome::Granted)
    }
}

/// How long a caller is prepared to wait for permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// Wait as long as the store allows.
    Blocking,
    /// Wait at most this long.
    Wait(Duration),
}

impl AcquirePolicy {
    pub fn from_spec(spec: &RateSpec) -> Self {
        if spec.blocking {
            AcquirePolicy::Blocking
        } else {
            AcquirePolicy::Wait(spec.timeout_duration())
        }
    }
}

/// Request `permits` from `handle`.
///
/// In blocking mode a store timeout is a rejection and any other store
/// failure lets the call through. In bounded mode store failures propagate.
pub async fn acquire<S: LimiterStore + ?Sized>(
    store: &S,
    handle: &S::Handle,
    permits: u64,
    policy: AcquirePolicy,
) -> Result<Outcome, StoreError> {
    match policy {
        AcquirePolicy::Blocking => match store.acquire(handle, permits).await {
            Ok(()) => Ok(Outcome::Granted),
            Err(e) if e.is_timeout() => {
                debug!(error = %e, permits = permits, "Blocking acquisition timed out");
                Ok(Outcome::Rejected(Rejection::new(RejectReason::Blocked)))
            }
            Err(e) => {
                debug!(error = %e, permits = permits, "Ignoring store failure during blocking acquisition");
                Ok(Outcome::Granted)
            }
        },
        AcquirePolicy::Wait(timeout) => {
            if store.try_acquire_within(handle, permits, timeout).await? {
                Ok(Outcome::Granted)
            } else {
                trace!(permits = permits, timeout = ?timeout, "No permits within timeout");
                Ok(Outcome::Rejected(Rejection::new(RejectReason::NonBlockingTimeout)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TimeUnit;
    use crate::store::{MemoryBackend, MemoryStore, MemoryStoreConfig};
    use std::sync::Arc;

    async fn configured(store: &MemoryStore, spec: &RateSpec) -> crate::store::MemoryLimiter {
        let handle = store.get_or_create_limiter("resource").await.unwrap();
        store.try_set_rate(&handle, &spec.rate_config()).await.unwrap();
        handle
    }

    #[test]
    fn test_policy_from_spec() {
        assert_eq!(
            AcquirePolicy::from_spec(&RateSpec::new(1).blocking()),
            AcquirePolicy::Blocking
        );
        assert_eq!(
            AcquirePolicy::from_spec(&RateSpec::new(1).timeout(250, TimeUnit::Milliseconds)),
            AcquirePolicy::Wait(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_rejection_message() {
        assert_eq!(Rejection::new(RejectReason::Blocked).to_string(), "blocked: blocked");
        assert_eq!(
            Rejection::new(RejectReason::NonBlockingTimeout).to_string(),
            "blocked: non-blocking timeout"
        );
    }

    #[tokio::test]
    async fn test_non_blocking_rejection() {
        let store = MemoryStore::new();
        let spec = RateSpec::new(1).per(1, TimeUnit::Hours);
        let handle = configured(&store, &spec).await;
        let policy = AcquirePolicy::Wait(Duration::ZERO);

        assert_eq!(acquire(&store, &handle, 1, policy).await.unwrap(), Outcome::Granted);
        assert_eq!(
            acquire(&store, &handle, 1, policy).await.unwrap(),
            Outcome::Rejected(Rejection::new(RejectReason::NonBlockingTimeout))
        );
    }

    #[tokio::test]
    async fn test_blocking_grant() {
        let store = MemoryStore::new();
        let handle = configured(&store, &RateSpec::new(2)).await;

        let outcome = acquire(&store, &handle, 2, AcquirePolicy::Blocking).await.unwrap();
        assert!(outcome.is_granted());
    }

    #[tokio::test]
    async fn test_blocking_timeout_is_rejection() {
        let config = MemoryStoreConfig {
            response_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let store = MemoryStore::connect(Arc::new(MemoryBackend::new()), config);
        let handle = configured(&store, &RateSpec::new(1).per(1, TimeUnit::Hours)).await;

        acquire(&store, &handle, 1, AcquirePolicy::Blocking).await.unwrap();
        assert_eq!(
            acquire(&store, &handle, 1, AcquirePolicy::Blocking).await.unwrap(),
            Outcome::Rejected(Rejection::new(RejectReason::Blocked))
        );
    }

    #[tokio::test]
    async fn test_blocking_fails_open_on_store_error() {
        let store = MemoryStore::new();
        // No rate configured: the store refuses every acquisition.
        let handle = store.get_or_create_limiter("resource").await.unwrap();

        let outcome = acquire(&store, &handle, 1, AcquirePolicy::Blocking).await.unwrap();
        assert_eq!(outcome, Outcome::Granted);
    }

    #[tokio::test]
    async fn test_bounded_store_error_propagates() {
        let store = MemoryStore::new();
        let handle = store.get_or_create_limiter("resource").await.unwrap();

        let err = acquire(&store, &handle, 1, AcquirePolicy::Wait(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotConfigured(_)));
    }
}
