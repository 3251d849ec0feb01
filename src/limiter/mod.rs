pub mod sliding_window;

use async_trait::async_trait;
use std::time::Duration;

pub use sliding_window::SlidingWindowLimiter;

/// Response from a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    /// Whether the request is allowed
    pub allowed: bool,

    /// Requests left in the window after this one
    pub remaining: u32,

    pub limit: u32,

    pub window: Duration,

    /// Set when the decision was made without consulting a store
    pub fail_open: bool,
}

impl LimitDecision {
    pub fn allowed(limit: u32, remaining: u32, window: Duration) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            window,
            fail_open: false,
        }
    }

    pub fn denied(limit: u32, window: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            window,
            fail_open: false,
        }
    }

    /// Admit with the full limit remaining
    pub fn fail_open(limit: u32, window: Duration) -> Self {
        Self {
            allowed: true,
            remaining: limit,
            limit,
            window,
            fail_open: true,
        }
    }
}

/// Trait for rate limiting algorithms
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Admit or deny one request against `key`. Never fails: backend
    /// problems resolve to an admitting decision.
    async fn check(&self, key: &str, limit: u32, window: Duration) -> LimitDecision;

    /// Requests currently counted in the window, without consuming one
    async fn occupancy(&self, key: &str, window: Duration) -> u64;
}
