//! Resilience primitives
//!
//! Bounded retry with per-call timeouts, and [`GuardedInfra`], which wraps
//! every infrastructure call in both.

pub mod guarded;
pub mod retry;

pub use guarded::GuardedInfra;
pub use retry::{retry_if, retry_with_timeout, CallTimeout, RetryPolicy};
