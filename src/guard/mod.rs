//! Interception of guarded calls.
//!
//! [`RateGuard`] sits between a caller and an operation: it derives the
//! resource identity, makes sure the limiter exists, acquires permits and
//! then runs the operation, a fallback, or nothing.

mod notice;
mod service;

pub use notice::LimitNotice;
pub use service::{GuardError, GuardedCall, RateGuard, Target};
