/// Reliability middleware around backend adapters and the failover cascade.
pub mod cascade;
pub mod circuit;
pub mod cost;
pub mod guarded;
pub mod rate_limit;
pub mod retry;

pub use cascade::{BackendAttempt, BackendCascade, BackendStats, CascadeFailure, CascadeOutcome};
pub use circuit::{CircuitBreaker, CircuitState};
pub use cost::{CostSnapshot, CostTracker};
pub use guarded::{GuardSettings, GuardedBackend, GuardedOutcome};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
