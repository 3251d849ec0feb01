//! Daily per-user feature quotas with progressive backpressure.

pub mod backpressure;

use crate::config::PolicyCache;
use crate::errors::Result;
use crate::store::ConnectionManager;
use arc_swap::ArcSwap;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backpressure::{Pressure, ThrottlePolicy};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counters keyed `quota:<feature>:<user>:<yyyy-mm-dd>`
#[derive(Clone)]
pub struct QuotaTracker {
    manager: ConnectionManager,
}

impl QuotaTracker {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub fn quota_key(feature: &str, user_id: &str, day: NaiveDate) -> String {
        format!("quota:{}:{}:{}", feature, user_id, day.format("%Y-%m-%d"))
    }

    /// Key for the current UTC day
    pub fn today_key(feature: &str, user_id: &str) -> String {
        Self::quota_key(feature, user_id, Utc::now().date_naive())
    }

    /// Whether uses are being counted right now. False while disconnected
    /// in open mode.
    pub fn is_counting(&self) -> bool {
        self.manager.counter_store().is_some()
    }

    /// Atomically add one use. The TTL is attached only on the first use of
    /// the period. Skipped (returns 0) while disconnected in open mode.
    pub async fn increment_quota(&self, key: &str, ttl: Duration) -> Result<i64> {
        let Some(store) = self.manager.counter_store() else {
            debug!("Store disconnected; not counting '{}'", key);
            return Ok(0);
        };

        match store.incr_with_initial_ttl(key, ttl).await {
            Ok(count) => Ok(count),
            Err(e) => {
                warn!("Quota increment failed for '{}': {}", key, e);
                self.manager.report_error(&e).await;
                Err(e)
            }
        }
    }

    /// Current count, 0 when absent or disconnected in open mode
    pub async fn get_quota(&self, key: &str) -> Result<i64> {
        let Some(store) = self.manager.counter_store() else {
            return Ok(0);
        };

        match store.get_counter(key).await {
            Ok(count) => Ok(count),
            Err(e) => {
                warn!("Quota read failed for '{}': {}", key, e);
                self.manager.report_error(&e).await;
                Err(e)
            }
        }
    }

    pub async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
        match self.manager.counter_store() {
            Some(store) => store.ttl(key).await,
            None => Ok(None),
        }
    }
}

/// A quota unit granted to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaGrant {
    pub feature: String,

    /// Count after this use
    pub used: u64,

    pub limit: u64,

    /// Backpressure delay already served
    pub delay: Duration,

    /// Set when this use was not recorded by the tracker
    pub fail_open: bool,
}

/// Why the gate refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaRejection {
    Exceeded {
        feature: String,
        limit: u64,
        status: StatusCode,
        message: String,
    },
    UnknownFeature(String),
}

impl IntoResponse for QuotaRejection {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            QuotaRejection::Exceeded {
                status, message, ..
            } => (status, message),
            QuotaRejection::UnknownFeature(feature) => (
                StatusCode::NOT_FOUND,
                format!("Unknown metered feature: {}", feature),
            ),
        };

        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

/// Today's usage of one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub feature: String,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
}

/// Read, evaluate, wait, then count: the admission path for metered features
#[derive(Clone)]
pub struct QuotaGate {
    tracker: QuotaTracker,
    policy: Arc<ArcSwap<PolicyCache>>,
}

impl QuotaGate {
    pub fn new(tracker: QuotaTracker, policy: Arc<ArcSwap<PolicyCache>>) -> Self {
        Self { tracker, policy }
    }

    pub fn tracker(&self) -> &QuotaTracker {
        &self.tracker
    }

    /// Consume one unit of `feature` for `user_id`. Usage near the limit is
    /// delayed in the calling task; usage at the limit is refused without
    /// counting. Tracker failures admit without counting.
    pub async fn acquire(
        &self,
        feature: &str,
        user_id: &str,
        tier: Option<&str>,
    ) -> std::result::Result<QuotaGrant, QuotaRejection> {
        let quota = self
            .policy
            .load()
            .quota(feature)
            .cloned()
            .ok_or_else(|| QuotaRejection::UnknownFeature(feature.to_string()))?;

        let limit = quota.limit_for(tier);
        let ttl = Duration::from_secs(quota.ttl_secs);
        let key = QuotaTracker::today_key(feature, user_id);

        let uncounted = || QuotaGrant {
            feature: feature.to_string(),
            used: 0,
            limit,
            delay: Duration::ZERO,
            fail_open: true,
        };

        if !self.tracker.is_counting() {
            debug!("Quota tracking offline; admitting {} for {}", feature, user_id);
            crate::metrics::record_quota_decision(feature, "fail_open");
            return Ok(uncounted());
        }

        let current = match self.tracker.get_quota(&key).await {
            Ok(count) => count.max(0) as u64,
            Err(e) if e.is_degradation() => {
                warn!("Quota check failed for {}, allowing request: {}", key, e);
                crate::metrics::record_quota_decision(feature, "fail_open");
                return Ok(uncounted());
            }
            Err(e) => {
                error!("Unexpected quota tracker error for {}, allowing request: {}", key, e);
                crate::metrics::record_quota_decision(feature, "unexpected");
                return Ok(uncounted());
            }
        };

        let delay = match ThrottlePolicy::from_quota(&quota).evaluate(current, limit) {
            Pressure::Reject => {
                info!(
                    "Quota exhausted: feature={}, user={}, used={}, limit={}",
                    feature, user_id, current, limit
                );
                crate::metrics::record_quota_decision(feature, "rejected");
                return Err(QuotaRejection::Exceeded {
                    feature: feature.to_string(),
                    limit,
                    status: StatusCode::from_u16(quota.denial_status)
                        .unwrap_or(StatusCode::TOO_MANY_REQUESTS),
                    message: quota.denial_message.replace("{limit}", &limit.to_string()),
                });
            }
            Pressure::Proceed { delay } => delay,
        };

        if delay.is_zero() {
            crate::metrics::record_quota_decision(feature, "proceed");
        } else {
            debug!(
                "Throttling {} for {}: {}/{} used, waiting {:?}",
                feature, user_id, current, limit, delay
            );
            crate::metrics::record_quota_decision(feature, "throttled");
            tokio::time::sleep(delay).await;
        }

        let (used, fail_open) = match self.tracker.increment_quota(&key, ttl).await {
            Ok(count) if count > 0 => (count as u64, false),
            Ok(_) => (current, true),
            Err(e) => {
                warn!("Quota increment failed for {}, allowing request: {}", key, e);
                (current + 1, true)
            }
        };

        Ok(QuotaGrant {
            feature: feature.to_string(),
            used,
            limit,
            delay,
            fail_open,
        })
    }

    /// Usage without consuming anything
    pub async fn status(
        &self,
        feature: &str,
        user_id: &str,
        tier: Option<&str>,
    ) -> std::result::Result<QuotaStatus, QuotaRejection> {
        let limit = self
            .policy
            .load()
            .quota(feature)
            .map(|quota| quota.limit_for(tier))
            .ok_or_else(|| QuotaRejection::UnknownFeature(feature.to_string()))?;

        let key = QuotaTracker::today_key(feature, user_id);
        let used = self.tracker.get_quota(&key).await.unwrap_or(0).max(0) as u64;

        Ok(QuotaStatus {
            feature: feature.to_string(),
            used,
            limit,
            remaining: limit.saturating_sub(used),
        })
    }
}
