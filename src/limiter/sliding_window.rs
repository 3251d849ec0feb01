use crate::limiter::{LimitDecision, RateLimiter};
use crate::store::ConnectionManager;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Sliding-window log limiter over the managed store
pub struct SlidingWindowLimiter {
    manager: ConnectionManager,
}

impl SlidingWindowLimiter {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Construct the store key for a class and identity
    pub fn construct_key(segment: &str, identity: &str) -> String {
        format!("rate_limit:{}:{}", segment, identity)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> LimitDecision {
        let start = Instant::now();

        let Some(store) = self.manager.counter_store() else {
            debug!("Store disconnected; admitting '{}' without counting", key);
            crate::metrics::record_fail_open("disconnected");
            return LimitDecision::fail_open(limit, window);
        };

        let decision = match store.admit_sliding_window(key, limit, window).await {
            Ok(admission) if admission.allowed => {
                LimitDecision::allowed(limit, admission.remaining, window)
            }
            Ok(_) => LimitDecision::denied(limit, window),
            Err(e) => {
                if e.is_degradation() {
                    warn!("Store degraded, failing open for key '{}': {}", key, e);
                    crate::metrics::record_fail_open(e.kind());
                } else {
                    error!("Unexpected error during rate limit check for '{}': {}", key, e);
                    crate::metrics::record_fail_open("unexpected");
                }
                self.manager.report_error(&e).await;
                LimitDecision::fail_open(limit, window)
            }
        };

        debug!(
            "Rate limit decision: key={}, backend={}, allowed={}, remaining={}",
            key,
            store.kind(),
            decision.allowed,
            decision.remaining
        );
        crate::metrics::record_limiter_duration(start.elapsed().as_secs_f64());

        decision
    }

    async fn occupancy(&self, key: &str, window: Duration) -> u64 {
        let Some(store) = self.manager.counter_store() else {
            return 0;
        };

        match store.window_occupancy(key, window).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to read window occupancy for '{}': {}", key, e);
                self.manager.report_error(&e).await;
                0
            }
        }
    }
}
