pub mod loader;
pub mod validator;
pub mod watcher;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Complete application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Redis configuration (loaded from environment variables only)
    pub redis: RedisConfig,

    /// Traffic policy (loaded from file, supports hot reload)
    pub traffic: TrafficConfig,
}

/// What the traffic layer does while the remote store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedMode {
    /// Admit everything, count nothing.
    #[default]
    Open,
    /// Keep enforcing against the in-process fallback store.
    Local,
}

impl DegradedMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "open" => Some(DegradedMode::Open),
            "local" => Some(DegradedMode::Local),
            _ => None,
        }
    }
}

/// Bounded backoff for background reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt: `min(base * attempt, cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Redis connection configuration (loaded from environment variables)
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., "redis://localhost:6379/0")
    pub url: String,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Command timeout in seconds
    pub command_timeout_secs: u64,

    /// Interval between background health probes
    pub health_check_interval_secs: u64,

    pub reconnect: ReconnectPolicy,

    pub degraded_mode: DegradedMode,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl RedisConfig {
    /// Load Redis configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = ReconnectPolicy::default();

        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),

            max_connections: env_or("REDIS_MAX_CONN", 50),

            connection_timeout_secs: env_or("REDIS_CONNECT_TIMEOUT_SECS", 5),

            command_timeout_secs: env_or("REDIS_COMMAND_TIMEOUT_SECS", 5),

            health_check_interval_secs: env_or("REDIS_HEALTH_CHECK_INTERVAL_SECS", 30),

            reconnect: ReconnectPolicy {
                max_attempts: env_or("REDIS_RECONNECT_MAX_ATTEMPTS", defaults.max_attempts),
                base_delay: Duration::from_secs(env_or(
                    "REDIS_RECONNECT_BASE_SECS",
                    defaults.base_delay.as_secs(),
                )),
                max_delay: Duration::from_secs(env_or(
                    "REDIS_RECONNECT_CAP_SECS",
                    defaults.max_delay.as_secs(),
                )),
            },

            degraded_mode: std::env::var("REDIS_DEGRADED_MODE")
                .ok()
                .and_then(|v| DegradedMode::parse(&v))
                .unwrap_or_default(),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            max_connections: 50,
            connection_timeout_secs: 5,
            command_timeout_secs: 5,
            health_check_interval_secs: 30,
            reconnect: ReconnectPolicy::default(),
            degraded_mode: DegradedMode::Open,
        }
    }
}

/// Rate-limit scope a request is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitClass {
    /// Authentication endpoints, keyed by client IP
    Auth,
    /// AI endpoints with an authenticated user
    Ai,
    /// AI endpoints reached without a user, keyed by client IP
    AiAnonymous,
    /// Any other endpoint with an authenticated user
    User,
    /// Any other endpoint, keyed by client IP
    Public,
}

impl LimitClass {
    pub const ALL: [LimitClass; 5] = [
        LimitClass::Auth,
        LimitClass::Ai,
        LimitClass::AiAnonymous,
        LimitClass::User,
        LimitClass::Public,
    ];

    /// Key segment between `rate_limit:` and the identity.
    pub fn key_segment(&self) -> &'static str {
        match self {
            LimitClass::Auth => "auth",
            LimitClass::Ai => "ai:user",
            LimitClass::AiAnonymous => "ai:ip",
            LimitClass::User => "user",
            LimitClass::Public => "public",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitClass::Auth => "auth",
            LimitClass::Ai => "ai",
            LimitClass::AiAnonymous => "ai_anonymous",
            LimitClass::User => "user",
            LimitClass::Public => "public",
        }
    }

    fn default_limit(&self) -> ClassLimit {
        let limit = match self {
            LimitClass::Auth => 5,
            LimitClass::Ai => 10,
            LimitClass::AiAnonymous => 5,
            LimitClass::User => 60,
            LimitClass::Public => 30,
        };
        ClassLimit {
            limit,
            window_secs: 60,
        }
    }
}

impl fmt::Display for LimitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limit and window for one class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLimit {
    pub limit: u32,
    pub window_secs: u64,
}

/// One backpressure step: at or above `min_percent` usage, wait `delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleStep {
    pub min_percent: f64,
    pub delay_ms: u64,
}

/// Quota settings for a metered feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureQuota {
    /// Limit per subscription tier (e.g. "free" -> 10)
    pub limits: BTreeMap<String, u64>,

    /// Tier used when the caller's tier is unknown
    #[serde(default = "default_tier")]
    pub default_tier: String,

    /// Counter lifetime, set once on the first use of a period
    #[serde(default = "default_quota_ttl")]
    pub ttl_secs: u64,

    /// Backpressure steps, any order
    #[serde(default)]
    pub throttle: Vec<ThrottleStep>,

    /// 429 for time-boxed limits, 403 otherwise
    #[serde(default = "default_denial_status")]
    pub denial_status: u16,

    /// `{limit}` is replaced with the caller's limit
    pub denial_message: String,
}

impl FeatureQuota {
    /// Tier names compare case-insensitively; stored lowercase.
    pub fn normalized(mut self) -> Self {
        self.limits = self
            .limits
            .into_iter()
            .map(|(tier, limit)| (tier.to_lowercase(), limit))
            .collect();
        self.default_tier = self.default_tier.to_lowercase();
        self
    }

    pub fn limit_for(&self, tier: Option<&str>) -> u64 {
        tier.map(|t| t.to_lowercase())
            .and_then(|t| self.limits.get(&t).copied())
            .or_else(|| self.limits.get(&self.default_tier).copied())
            .unwrap_or(0)
    }
}

/// Traffic shaping configuration (loaded from JSON file)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,

    /// Exact paths that are never rate limited
    #[serde(default = "default_bypass_paths")]
    pub bypass_paths: Vec<String>,

    #[serde(default = "default_auth_prefix")]
    pub auth_prefix: String,

    #[serde(default = "default_ai_prefix")]
    pub ai_prefix: String,

    /// Per-class limits; missing classes use built-in defaults
    #[serde(default)]
    pub classes: BTreeMap<LimitClass, ClassLimit>,

    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    #[serde(default = "default_cache_ttl")]
    pub cache_default_ttl_secs: u64,

    /// Metered features keyed by name (e.g. "ai_assist")
    #[serde(default = "default_quotas")]
    pub quotas: BTreeMap<String, FeatureQuota>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            bypass_paths: default_bypass_paths(),
            auth_prefix: default_auth_prefix(),
            ai_prefix: default_ai_prefix(),
            classes: BTreeMap::new(),
            cache_enabled: true,
            cache_default_ttl_secs: default_cache_ttl(),
            quotas: default_quotas(),
        }
    }
}

/// Runtime view of the traffic policy, swapped whole on reload
pub struct PolicyCache {
    classes: BTreeMap<LimitClass, ClassLimit>,

    /// Full configuration, quota tiers lowercased
    full_config: Arc<TrafficConfig>,
}

impl PolicyCache {
    /// Create a new policy cache from traffic configuration
    pub fn new(mut config: TrafficConfig) -> Self {
        config.quotas = std::mem::take(&mut config.quotas)
            .into_iter()
            .map(|(feature, quota)| (feature, quota.normalized()))
            .collect();

        let classes = LimitClass::ALL
            .iter()
            .map(|class| {
                let limit = config
                    .classes
                    .get(class)
                    .copied()
                    .unwrap_or_else(|| class.default_limit());
                (*class, limit)
            })
            .collect();

        Self {
            classes,
            full_config: Arc::new(config),
        }
    }

    /// Limit for a class; every class is always present
    pub fn class_limit(&self, class: LimitClass) -> ClassLimit {
        self.classes
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_limit())
    }

    pub fn rate_limit_enabled(&self) -> bool {
        self.full_config.rate_limit_enabled
    }

    pub fn is_bypassed(&self, path: &str) -> bool {
        self.full_config.bypass_paths.iter().any(|p| p == path)
    }

    pub fn auth_prefix(&self) -> &str {
        &self.full_config.auth_prefix
    }

    pub fn ai_prefix(&self) -> &str {
        &self.full_config.ai_prefix
    }

    pub fn quota(&self, feature: &str) -> Option<&FeatureQuota> {
        self.full_config.quotas.get(feature)
    }

    /// Get statistics about cached configuration
    pub fn stats(&self) -> PolicyStats {
        PolicyStats {
            class_count: self.classes.len(),
            quota_feature_count: self.full_config.quotas.len(),
        }
    }
}

/// Statistics about the policy cache
#[derive(Debug, Clone)]
pub struct PolicyStats {
    pub class_count: usize,
    pub quota_feature_count: usize,
}

fn default_true() -> bool {
    true
}

fn default_tier() -> String {
    "free".to_string()
}

fn default_quota_ttl() -> u64 {
    86_400
}

fn default_denial_status() -> u16 {
    429
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_auth_prefix() -> String {
    "/api/auth/".to_string()
}

fn default_ai_prefix() -> String {
    "/api/ai/".to_string()
}

fn default_bypass_paths() -> Vec<String> {
    ["/health", "/docs", "/openapi.json", "/redoc", "/metrics"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn tier_limits(free: u64, starter: u64, pro: u64) -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("free".to_string(), free),
        ("starter".to_string(), starter),
        ("pro".to_string(), pro),
    ])
}

fn default_quotas() -> BTreeMap<String, FeatureQuota> {
    let ai_assist = FeatureQuota {
        limits: tier_limits(10, 50, 999),
        default_tier: default_tier(),
        ttl_secs: default_quota_ttl(),
        throttle: vec![
            ThrottleStep { min_percent: 70.0, delay_ms: 1_000 },
            ThrottleStep { min_percent: 85.0, delay_ms: 2_000 },
            ThrottleStep { min_percent: 95.0, delay_ms: 3_000 },
        ],
        denial_status: 429,
        denial_message: "Daily AI assist limit reached ({limit}/day). \
                         Upgrade to PRO for unlimited access or wait 24 hours."
            .to_string(),
    };

    let ats_analysis = FeatureQuota {
        limits: tier_limits(3, 20, 999),
        default_tier: default_tier(),
        ttl_secs: default_quota_ttl(),
        throttle: vec![
            ThrottleStep { min_percent: 70.0, delay_ms: 2_000 },
            ThrottleStep { min_percent: 85.0, delay_ms: 4_000 },
        ],
        denial_status: 403,
        denial_message: "ATS analysis limit ({limit}) reached. Upgrade to get more analyses."
            .to_string(),
    };

    BTreeMap::from([
        ("ai_assist".to_string(), ai_assist),
        ("ats_analysis".to_string(), ats_analysis),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(4), Duration::from_secs(120));
        assert_eq!(policy.delay_for(10), Duration::from_secs(300));
    }

    #[test]
    fn test_policy_cache_fills_missing_classes() {
        let mut config = TrafficConfig::default();
        config.classes.insert(
            LimitClass::Public,
            ClassLimit { limit: 100, window_secs: 10 },
        );

        let cache = PolicyCache::new(config);
        assert_eq!(cache.class_limit(LimitClass::Public).limit, 100);
        assert_eq!(cache.class_limit(LimitClass::Auth).limit, 5);
        assert_eq!(cache.class_limit(LimitClass::AiAnonymous).limit, 5);
        assert_eq!(cache.stats().class_count, 5);
    }

    #[test]
    fn test_traffic_config_from_sparse_json() {
        let json = r#"{ "classes": { "ai_anonymous": { "limit": 2, "window_secs": 30 } } }"#;
        let config: TrafficConfig = serde_json::from_str(json).unwrap();

        assert!(config.rate_limit_enabled);
        assert_eq!(config.cache_default_ttl_secs, 300);
        assert_eq!(config.classes[&LimitClass::AiAnonymous].limit, 2);
        assert!(config.quotas.contains_key("ai_assist"));
    }

    #[test]
    fn test_feature_limit_by_tier() {
        let quotas = default_quotas();
        let ai = &quotas["ai_assist"];
        assert_eq!(ai.limit_for(Some("STARTER")), 50);
        assert_eq!(ai.limit_for(Some("enterprise")), 10);
        assert_eq!(ai.limit_for(None), 10);
    }

    #[test]
    fn test_tier_names_are_case_insensitive_in_policy() {
        let json = r#"{
            "quotas": {
                "pdf_export": {
                    "limits": { "Free": 2, "Pro": 999 },
                    "default_tier": "FREE",
                    "denial_message": "Export limit reached."
                }
            }
        }"#;
        let config: TrafficConfig = serde_json::from_str(json).unwrap();
        let cache = PolicyCache::new(config);
        let quota = cache.quota("pdf_export").unwrap();

        assert_eq!(quota.limit_for(Some("pro")), 999);
        assert_eq!(quota.limit_for(Some("PRO")), 999);
        assert_eq!(quota.limit_for(None), 2);
    }

    #[test]
    fn test_bypass_is_exact_match() {
        let cache = PolicyCache::new(TrafficConfig::default());
        assert!(cache.is_bypassed("/health"));
        assert!(!cache.is_bypassed("/health/deep"));
    }
}
