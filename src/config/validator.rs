use crate::config::{AppConfig, ClassLimit, FeatureQuota, LimitClass, RedisConfig, TrafficConfig};
use crate::errors::{Result, ShaprError};
use tracing::{debug, warn};

/// Validate the entire application configuration
pub fn validate_config(config: &AppConfig) -> Result<()> {
    debug!("Validating configuration...");

    validate_redis_config(&config.redis)?;
    validate_traffic_config(&config.traffic)?;

    debug!("Configuration validation successful");
    Ok(())
}

/// Validate Redis configuration
fn validate_redis_config(config: &RedisConfig) -> Result<()> {
    if config.url.is_empty() {
        return Err(ShaprError::ConfigurationError(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if !config.url.starts_with("redis://") && !config.url.starts_with("rediss://") {
        return Err(ShaprError::ConfigurationError(format!(
            "Invalid Redis URL format: {}. Must start with redis:// or rediss://",
            config.url
        )));
    }

    if config.max_connections == 0 {
        return Err(ShaprError::ConfigurationError(
            "max_connections must be greater than 0".to_string(),
        ));
    }

    if config.max_connections > 1000 {
        warn!(
            "max_connections is very high ({}). This may consume excessive resources.",
            config.max_connections
        );
    }

    if config.connection_timeout_secs == 0 || config.command_timeout_secs == 0 {
        return Err(ShaprError::ConfigurationError(
            "Redis timeouts must be greater than 0".to_string(),
        ));
    }

    if config.health_check_interval_secs == 0 {
        return Err(ShaprError::ConfigurationError(
            "health_check_interval_secs must be greater than 0".to_string(),
        ));
    }

    if config.reconnect.max_attempts == 0 {
        warn!("Reconnection disabled (max_attempts = 0); Redis will stay degraded after a failure");
    }

    if config.reconnect.base_delay > config.reconnect.max_delay {
        return Err(ShaprError::ConfigurationError(format!(
            "Reconnect base delay {:?} exceeds cap {:?}",
            config.reconnect.base_delay, config.reconnect.max_delay
        )));
    }

    debug!("Redis configuration valid");
    Ok(())
}

/// Validate the traffic policy
pub fn validate_traffic_config(config: &TrafficConfig) -> Result<()> {
    for (class, limit) in &config.classes {
        validate_class_limit(*class, limit)?;
    }

    for path in &config.bypass_paths {
        if !path.starts_with('/') {
            return Err(ShaprError::InvalidPolicy(format!(
                "Bypass path '{}' must start with '/'",
                path
            )));
        }
    }

    if config.cache_default_ttl_secs == 0 {
        return Err(ShaprError::InvalidPolicy(
            "cache_default_ttl_secs must be greater than 0".to_string(),
        ));
    }

    for (feature, quota) in &config.quotas {
        validate_feature_quota(feature, quota)?;
    }

    Ok(())
}

fn validate_class_limit(class: LimitClass, limit: &ClassLimit) -> Result<()> {
    if limit.limit == 0 {
        return Err(ShaprError::InvalidPolicy(format!(
            "limit must be positive for class '{}'",
            class
        )));
    }

    if limit.window_secs == 0 {
        return Err(ShaprError::InvalidPolicy(format!(
            "window_secs must be positive for class '{}'",
            class
        )));
    }

    if limit.window_secs > 86_400 {
        warn!(
            "Very long window ({}s) for class '{}'; sorted sets will grow large",
            limit.window_secs, class
        );
    }

    Ok(())
}

fn validate_feature_quota(feature: &str, quota: &FeatureQuota) -> Result<()> {
    if feature.is_empty() || feature.contains(':') {
        return Err(ShaprError::InvalidPolicy(format!(
            "Quota feature name '{}' must be non-empty and contain no ':'",
            feature
        )));
    }

    if quota.limits.is_empty() {
        return Err(ShaprError::InvalidPolicy(format!(
            "Quota '{}' must define at least one tier limit",
            feature
        )));
    }

    let mut tiers = std::collections::BTreeSet::new();
    for tier in quota.limits.keys() {
        if !tiers.insert(tier.to_lowercase()) {
            return Err(ShaprError::InvalidPolicy(format!(
                "Quota '{}' defines tier '{}' more than once (names ignore case)",
                feature, tier
            )));
        }
    }

    if !tiers.contains(&quota.default_tier.to_lowercase()) {
        return Err(ShaprError::InvalidPolicy(format!(
            "Quota '{}' default tier '{}' has no limit",
            feature, quota.default_tier
        )));
    }

    if quota.ttl_secs == 0 {
        return Err(ShaprError::InvalidPolicy(format!(
            "Quota '{}' ttl_secs must be positive",
            feature
        )));
    }

    if quota.denial_status != 429 && quota.denial_status != 403 {
        return Err(ShaprError::InvalidPolicy(format!(
            "Quota '{}' denial_status must be 429 or 403 (got {})",
            feature, quota.denial_status
        )));
    }

    for step in &quota.throttle {
        if !(0.0..100.0).contains(&step.min_percent) {
            return Err(ShaprError::InvalidPolicy(format!(
                "Quota '{}' throttle threshold {} must be in [0, 100)",
                feature, step.min_percent
            )));
        }

        if step.delay_ms > 30_000 {
            warn!(
                "Quota '{}' throttle delay of {}ms holds requests for a long time",
                feature, step.delay_ms
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThrottleStep;

    #[test]
    fn test_validate_valid_config() {
        let config = AppConfig {
            redis: RedisConfig::default(),
            traffic: TrafficConfig::default(),
        };

        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_invalid_redis_url() {
        let mut config = AppConfig {
            redis: RedisConfig::default(),
            traffic: TrafficConfig::default(),
        };

        config.redis.url = "invalid_url".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_window() {
        let limit = ClassLimit {
            limit: 10,
            window_secs: 0,
        };

        assert!(validate_class_limit(LimitClass::Public, &limit).is_err());
    }

    #[test]
    fn test_validate_throttle_threshold_out_of_range() {
        let mut config = TrafficConfig::default();
        if let Some(quota) = config.quotas.get_mut("ai_assist") {
            quota.throttle.push(ThrottleStep {
                min_percent: 100.0,
                delay_ms: 500,
            });
        }

        assert!(validate_traffic_config(&config).is_err());
    }

    #[test]
    fn test_validate_unknown_default_tier() {
        let mut config = TrafficConfig::default();
        if let Some(quota) = config.quotas.get_mut("ats_analysis") {
            quota.default_tier = "trial".to_string();
        }

        assert!(validate_traffic_config(&config).is_err());
    }

    #[test]
    fn test_validate_tier_names_ignore_case() {
        let mut config = TrafficConfig::default();
        if let Some(quota) = config.quotas.get_mut("ats_analysis") {
            quota.default_tier = "Free".to_string();
        }
        assert!(validate_traffic_config(&config).is_ok());

        if let Some(quota) = config.quotas.get_mut("ats_analysis") {
            quota.limits.insert("FREE".to_string(), 5);
        }
        assert!(validate_traffic_config(&config).is_err());
    }
}
