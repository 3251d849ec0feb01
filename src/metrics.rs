use crate::config::PolicyStats;
use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, Encoder, Gauge, Histogram, HistogramVec, IntCounter,
    IntCounterVec, TextEncoder,
};

lazy_static! {
    // Admission metrics
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shapr_requests_total",
        "Requests seen by the rate limit middleware",
        &["class", "allowed"]
    ).unwrap();

    pub static ref BYPASSED_TOTAL: IntCounter = register_int_counter!(
        "shapr_requests_bypassed_total",
        "Requests that skipped rate limiting"
    ).unwrap();

    pub static ref FAIL_OPEN_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shapr_fail_open_total",
        "Decisions admitted without consulting a store",
        &["reason"]
    ).unwrap();

    pub static ref LIMITER_DURATION: Histogram = register_histogram!(
        "shapr_limiter_duration_seconds",
        "Rate limit check duration in seconds",
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    ).unwrap();

    // Store metrics
    pub static ref REDIS_DURATION: HistogramVec = register_histogram_vec!(
        "shapr_redis_duration_seconds",
        "Redis command duration in seconds",
        &["command"],
        vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]
    ).unwrap();

    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shapr_store_errors_total",
        "Store errors by kind",
        &["error_type"]
    ).unwrap();

    pub static ref REDIS_CONNECTED: Gauge = register_gauge!(
        "shapr_redis_connected",
        "1 while the shared store is reachable"
    ).unwrap();

    pub static ref RECONNECT_ATTEMPTS_TOTAL: IntCounter = register_int_counter!(
        "shapr_reconnect_attempts_total",
        "Background reconnection attempts"
    ).unwrap();

    pub static ref FALLBACK_USES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shapr_fallback_uses_total",
        "Operations served by the in-process store",
        &["operation"]
    ).unwrap();

    // Cache metrics
    pub static ref CACHE_LOOKUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shapr_cache_lookups_total",
        "Cache lookups by result",
        &["result"]
    ).unwrap();

    // Quota metrics
    pub static ref QUOTA_DECISIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shapr_quota_decisions_total",
        "Quota gate outcomes",
        &["feature", "outcome"]
    ).unwrap();

    // Config metrics
    pub static ref CONFIG_RELOADS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "shapr_config_reloads_total",
        "Total number of configuration reloads",
        &["result"]
    ).unwrap();

    pub static ref ACTIVE_CLASSES: Gauge = register_gauge!(
        "shapr_active_classes",
        "Number of configured limit classes"
    ).unwrap();

    pub static ref ACTIVE_QUOTA_FEATURES: Gauge = register_gauge!(
        "shapr_active_quota_features",
        "Number of configured quota features"
    ).unwrap();
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Record a middleware decision
pub fn record_request(class: &str, allowed: bool) {
    REQUESTS_TOTAL
        .with_label_values(&[class, bool_label(allowed)])
        .inc();
}

pub fn record_bypass() {
    BYPASSED_TOTAL.inc();
}

pub fn record_fail_open(reason: &str) {
    FAIL_OPEN_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_limiter_duration(duration_secs: f64) {
    LIMITER_DURATION.observe(duration_secs);
}

/// Record Redis operation duration
pub fn record_redis_duration(command: &str, duration_secs: f64) {
    REDIS_DURATION
        .with_label_values(&[command])
        .observe(duration_secs);
}

pub fn record_store_error(error_type: &str) {
    STORE_ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

pub fn set_connected(connected: bool) {
    REDIS_CONNECTED.set(if connected { 1.0 } else { 0.0 });
}

pub fn record_reconnect_attempt() {
    RECONNECT_ATTEMPTS_TOTAL.inc();
}

pub fn record_fallback_use(operation: &str) {
    FALLBACK_USES_TOTAL.with_label_values(&[operation]).inc();
}

/// Record a cache lookup: "hit", "miss" or "error"
pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUPS_TOTAL.with_label_values(&[result]).inc();
}

/// Record a quota gate outcome: "proceed", "throttled", "rejected" or "fail_open"
pub fn record_quota_decision(feature: &str, outcome: &str) {
    QUOTA_DECISIONS_TOTAL
        .with_label_values(&[feature, outcome])
        .inc();
}

/// Update config metrics
pub fn update_policy_metrics(stats: &PolicyStats) {
    ACTIVE_CLASSES.set(stats.class_count as f64);
    ACTIVE_QUOTA_FEATURES.set(stats.quota_feature_count as f64);
}

/// Record config reload
pub fn record_config_reload(success: bool) {
    let result = if success { "success" } else { "error" };
    CONFIG_RELOADS_TOTAL.with_label_values(&[result]).inc();
}

/// Render every registered metric in the text exposition format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_recorded_series() {
        record_request("public", true);
        record_quota_decision("ai_assist", "throttled");
        set_connected(true);

        let text = gather();
        assert!(text.contains("shapr_requests_total"));
        assert!(text.contains("class=\"public\""));
        assert!(text.contains("shapr_quota_decisions_total"));
        assert!(text.contains("shapr_redis_connected"));
    }
}
