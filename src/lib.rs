//! Flowguard - Distributed Admission Control
//!
//! This crate guards individual operations with named rate budgets that
//! live in a shared limiter store. Each call derives a resource identity
//! from its declaration and arguments, takes permits from the matching
//! budget and either runs, runs a fallback, or returns a default.

pub mod config;
pub mod error;
pub mod guard;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
