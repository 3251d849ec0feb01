use crate::config::RedisConfig;
use crate::errors::{Result, ShaprError};
use deadpool::managed::{PoolConfig as DeadpoolPoolConfig, Timeouts};
use deadpool_redis::{Config as DeadpoolRedisConfig, Pool, Runtime};
use tracing::{debug, info};

/// Create a Redis connection pool from configuration and verify it with PING
pub async fn create_redis_pool(config: &RedisConfig) -> Result<Pool> {
    info!("Creating Redis connection pool...");

    let mut cfg = DeadpoolRedisConfig::from_url(config.url.clone());

    let mut pool_config = DeadpoolPoolConfig::new(config.max_connections);
    pool_config.timeouts = Timeouts {
        wait: Some(config.connection_timeout()),
        create: Some(config.connection_timeout()),
        recycle: Some(config.connection_timeout()),
    };
    cfg.pool = Some(pool_config);

    let pool = cfg
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| ShaprError::StoreUnavailable(format!("Pool creation failed: {}", e)))?;

    info!(
        "Redis connection pool created (max_connections: {})",
        config.max_connections
    );

    debug!("Testing Redis connection...");
    let mut conn = pool
        .get()
        .await
        .map_err(|e| ShaprError::StoreUnavailable(format!("Failed to get connection: {}", e)))?;

    let _pong: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(ShaprError::RedisConnectionError)?;

    info!("Redis connection test successful");

    Ok(pool)
}

/// Get pool statistics
pub fn get_pool_stats(pool: &Pool) -> PoolStats {
    let status = pool.status();
    PoolStats {
        size: status.size,
        available: status.available,
        max_size: status.max_size,
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub max_size: usize,
}
