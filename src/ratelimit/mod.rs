//! Admission control building blocks: rate declarations, resource
//! identities, the limiter registry, permit acquisition and fallbacks.

mod acquire;
mod descriptor;
mod fallback;
mod limiter;
mod rules;

pub use acquire::{acquire, AcquirePolicy, Outcome, RejectReason, Rejection};
pub use descriptor::{ArgRef, CallSignature, ParameterResolutionError, ResourceNameResolver};
pub use fallback::{
    FallbackArity, FallbackCall, FallbackDescriptor, FallbackResolver, InstanceProvider, Instances,
    FAILURE_PARAM,
};
pub use limiter::LimiterRegistry;
pub use rules::{RateConfig, RateSpec, Scope, TimeUnit};
