//! Rate guard implementation.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use super::notice::LimitNotice;
use crate::config::{GuardConfig, RetryPolicy};
use crate::ratelimit::{
    acquire, AcquirePolicy, CallSignature, FallbackDescriptor, FallbackResolver, InstanceProvider, Instances,
    LimiterRegistry, Outcome, ParameterResolutionError, RateSpec, Rejection, ResourceNameResolver,
};
use crate::store::{LimiterStore, StoreError};

/// Errors surfaced by [`RateGuard::call`].
#[derive(Debug, Error)]
pub enum GuardError {
    /// An argument reference could not be evaluated. No fallback runs.
    #[error(transparent)]
    Parameter(#[from] ParameterResolutionError),

    #[error("Guarded operation failed: {0}")]
    Guarded(anyhow::Error),

    #[error("Fallback {method} failed: {error}")]
    Fallback { method: String, error: anyhow::Error },

    #[error("No instance of {0} is registered to run its fallback")]
    MissingInstance(String),
}

/// The object a guarded method is called on.
#[derive(Clone)]
pub struct Target {
    /// Type name fallbacks are registered under
    pub type_name: String,
    pub instance: Arc<dyn Any + Send + Sync>,
}

impl Target {
    pub fn new<T: Any + Send + Sync>(type_name: impl Into<String>, instance: Arc<T>) -> Self {
        Self {
            type_name: type_name.into(),
            instance,
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target").field("type_name", &self.type_name).finish()
    }
}

/// One intercepted invocation.
#[derive(Debug, Clone, Copy)]
pub struct GuardedCall<'a> {
    pub spec: &'a RateSpec,
    pub signature: &'a CallSignature,
    /// Argument values, in parameter order
    pub args: &'a [serde_json::Value],
    pub target: &'a Target,
}

impl<'a> GuardedCall<'a> {
    pub fn new(
        spec: &'a RateSpec,
        signature: &'a CallSignature,
        args: &'a [serde_json::Value],
        target: &'a Target,
    ) -> Self {
        Self {
            spec,
            signature,
            args,
            target,
        }
    }
}

/// Admission control in front of guarded operations.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateGuard<S: LimiterStore> {
    names: ResourceNameResolver,
    limiters: LimiterRegistry<S>,
    fallbacks: Arc<FallbackResolver>,
    /// Live instances of explicitly configured fallback owners
    instances: Arc<dyn InstanceProvider>,
    retry_policy: RetryPolicy,
}

impl<S: LimiterStore> RateGuard<S> {
    /// Create a guard with an empty fallback catalog.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            names: ResourceNameResolver::new(),
            limiters: LimiterRegistry::new(store),
            fallbacks: Arc::new(FallbackResolver::new()),
            instances: Arc::new(Instances::new()),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn from_config(store: Arc<S>, config: &GuardConfig) -> Self {
        Self::new(store).with_retry_policy(config.retry_policy)
    }

    pub fn with_fallbacks(mut self, fallbacks: Arc<FallbackResolver>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn with_instances(mut self, instances: Arc<dyn InstanceProvider>) -> Self {
        self.instances = instances;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn fallbacks(&self) -> &Arc<FallbackResolver> {
        &self.fallbacks
    }

    pub fn limiters(&self) -> &LimiterRegistry<S> {
        &self.limiters
    }

    pub fn names(&self) -> &ResourceNameResolver {
        &self.names
    }

    /// Run `proceed` if the call is admitted.
    ///
    /// A rejected call runs the configured fallback instead, or returns
    /// `R::default()` when there is none or it cannot be found. If the store
    /// cannot be consulted the call runs anyway.
    #[instrument(skip_all, fields(method = %guarded.signature))]
    pub async fn call<R, F, Fut>(&self, guarded: GuardedCall<'_>, proceed: F) -> Result<R, GuardError>
    where
        R: Default + Send + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let spec = guarded.spec;
        let identity = self
            .names
            .resolve(&spec.name, guarded.signature, guarded.args, &spec.args)?;
        let method = self.names.method_name(guarded.signature);

        match self.admit(&identity, spec).await {
            Ok(Outcome::Granted) => match proceed().await {
                Ok(value) => Ok(value),
                Err(err) => {
                    let fallback = fallback_name(self.resolve_fallback(&guarded).as_deref());
                    let notice = LimitNotice::new(&identity, &method, spec, &fallback);
                    self.retry(&notice, err, &proceed).await
                }
            },
            Ok(Outcome::Rejected(rejection)) => {
                let descriptor = self.resolve_fallback(&guarded);
                let fallback = fallback_name(descriptor.as_deref());
                LimitNotice::new(&identity, &method, spec, &fallback).log_rejected(&rejection);
                match descriptor {
                    Some(descriptor) => self.run_fallback(&guarded, &descriptor, rejection).await,
                    None => Ok(R::default()),
                }
            }
            Err(e) => {
                let fallback = fallback_name(self.resolve_fallback(&guarded).as_deref());
                LimitNotice::new(&identity, &method, spec, &fallback).log_store_failure(&e);
                proceed().await.map_err(GuardError::Guarded)
            }
        }
    }

    async fn admit(&self, identity: &str, spec: &RateSpec) -> Result<Outcome, StoreError> {
        self.limiters.ensure_limiter(identity, spec).await?;
        let handle = self
            .limiters
            .get_limiter(identity)
            .ok_or_else(|| StoreError::NotConfigured(identity.to_string()))?;

        acquire(
            self.limiters.store().as_ref(),
            &handle,
            spec.permits,
            AcquirePolicy::from_spec(spec),
        )
        .await
    }

    /// Handle the first failure of a granted call according to the retry policy.
    async fn retry<R, F, Fut>(&self, notice: &LimitNotice<'_>, err: anyhow::Error, proceed: &F) -> Result<R, GuardError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        match self.retry_policy {
            RetryPolicy::RetryOnce => {
                notice.log_guarded_failure(&err, true);
                proceed().await.map_err(GuardError::Guarded)
            }
            RetryPolicy::Propagate => {
                notice.log_guarded_failure(&err, false);
                Err(GuardError::Guarded(err))
            }
        }
    }

    /// Explicitly configured fallback owner, if any.
    fn fallback_owner<'a>(spec: &'a RateSpec) -> Option<&'a str> {
        spec.fallback_owner
            .as_deref()
            .filter(|owner| !owner.trim().is_empty())
    }

    fn resolve_fallback(&self, guarded: &GuardedCall<'_>) -> Option<Arc<FallbackDescriptor>> {
        let spec = guarded.spec;
        if !spec.has_fallback() {
            return None;
        }
        self.fallbacks.resolve(
            &guarded.target.type_name,
            &spec.fallback,
            Self::fallback_owner(spec),
            guarded.signature,
        )
    }

    async fn run_fallback<R>(
        &self,
        guarded: &GuardedCall<'_>,
        descriptor: &FallbackDescriptor,
        rejection: Rejection,
    ) -> Result<R, GuardError>
    where
        R: Default + Send + 'static,
    {
        let instance = match Self::fallback_owner(guarded.spec) {
            Some(owner) => self
                .instances
                .instance(owner)
                .ok_or_else(|| GuardError::MissingInstance(owner.to_string()))?,
            None => guarded.target.instance.clone(),
        };

        let method = descriptor.method_name();
        let Some(pending) = descriptor.invoke::<R>(instance, guarded.args, rejection) else {
            return Err(GuardError::Fallback {
                error: anyhow::anyhow!("handler does not return {}", std::any::type_name::<R>()),
                method,
            });
        };

        debug!(fallback = %method, reason = %rejection.reason, "Invoking fallback");
        pending.await.map_err(|error| GuardError::Fallback { method, error })
    }

    /// Shut down the underlying store client.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.limiters.shutdown().await
    }
}

/// Signature of a resolved fallback, or empty when none resolved.
fn fallback_name(descriptor: Option<&FallbackDescriptor>) -> String {
    descriptor.map(FallbackDescriptor::method_name).unwrap_or_default()
}
