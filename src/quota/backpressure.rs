use crate::config::{FeatureQuota, ThrottleStep};
use std::time::Duration;

/// What to do with a request given the caller's current usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    /// Go ahead after waiting `delay` (zero below the first step)
    Proceed { delay: Duration },
    Reject,
}

/// Usage-based delay steps for one feature, highest threshold first
#[derive(Debug, Clone)]
pub struct ThrottlePolicy {
    steps: Vec<ThrottleStep>,
}

impl ThrottlePolicy {
    pub fn new(mut steps: Vec<ThrottleStep>) -> Self {
        steps.sort_by(|a, b| b.min_percent.total_cmp(&a.min_percent));
        Self { steps }
    }

    pub fn from_quota(quota: &FeatureQuota) -> Self {
        Self::new(quota.throttle.clone())
    }

    /// Evaluate usage before consuming one unit. A zero limit always rejects.
    pub fn evaluate(&self, current: u64, limit: u64) -> Pressure {
        if current >= limit {
            return Pressure::Reject;
        }

        let usage_percent = current as f64 / limit as f64 * 100.0;
        let delay = self
            .steps
            .iter()
            .find(|step| usage_percent >= step.min_percent)
            .map(|step| Duration::from_millis(step.delay_ms))
            .unwrap_or(Duration::ZERO);

        Pressure::Proceed { delay }
    }
}
