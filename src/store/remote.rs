use crate::config::RedisConfig;
use crate::errors::{Result, ShaprError};
use crate::store::pool::{create_redis_pool, get_pool_stats};
use crate::store::script::{load_scripts, Scripts};
use crate::store::{Connector, Store, WindowAdmission};
use async_trait::async_trait;
use deadpool::managed::TimeoutType;
use deadpool_redis::{Connection, Pool, PoolError};
use redis::AsyncCommands;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// A pool that is only busy is a timeout, not a lost connection. Only
/// backend failures and a closed pool count as the store being gone.
pub(crate) fn map_pool_error(err: PoolError, waited: Duration) -> ShaprError {
    match err {
        PoolError::Timeout(TimeoutType::Wait) => ShaprError::StoreTimeout(waited),
        PoolError::Timeout(other) => {
            ShaprError::StoreUnavailable(format!("Pool timed out ({:?})", other))
        }
        PoolError::Backend(e) => ShaprError::RedisConnectionError(e),
        PoolError::Closed => ShaprError::StoreUnavailable("Pool closed".to_string()),
        other => ShaprError::InternalError(format!("Pool error: {}", other)),
    }
}

/// Redis implementation of [`Store`]
pub struct RedisStore {
    pool: Arc<Pool>,
    scripts: Scripts,
    command_timeout: Duration,
}

impl RedisStore {
    /// Create a new Redis store and register its scripts
    pub async fn new(pool: Pool, command_timeout: Duration) -> Result<Self> {
        let scripts = Scripts::new();

        let mut conn = pool
            .get()
            .await
            .map_err(|e| map_pool_error(e, command_timeout))?;
        load_scripts(&mut *conn, &scripts).await?;

        Ok(Self {
            pool: Arc::new(pool),
            scripts,
            command_timeout,
        })
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            error!("Failed to get Redis connection: {}", e);
            crate::metrics::record_store_error("pool");
            map_pool_error(e, self.command_timeout)
        })
    }

    /// Run one command under the command timeout, recording its latency
    async fn timed<T, F>(&self, command: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ShaprError::StoreTimeout(self.command_timeout)),
        };
        crate::metrics::record_redis_duration(command, start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            crate::metrics::record_store_error(e.kind());
        }
        result
    }

    fn parse_int(value: &redis::Value, what: &str) -> Result<i64> {
        match value {
            redis::Value::Int(v) => Ok(*v),
            other => Err(ShaprError::ScriptExecutionError(format!(
                "Invalid {} value type: {:?}",
                what, other
            ))),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        self.timed("ping", async {
            let mut conn = self.conn().await?;
            let response: String = redis::cmd("PING").query_async(&mut *conn).await?;

            if response != "PONG" {
                return Err(ShaprError::InternalError(format!(
                    "Unexpected PING response: {}",
                    response
                )));
            }

            let stats = get_pool_stats(&self.pool);
            debug!(
                "Redis healthy (pool size {}, available {}, max {})",
                stats.size, stats.available, stats.max_size
            );
            Ok::<_, ShaprError>(())
        })
        .await
    }

    async fn admit_sliding_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowAdmission> {
        self.timed("sliding_window", async {
            let mut conn = self.conn().await?;
            let member = uuid::Uuid::new_v4().simple().to_string();

            let result: Vec<redis::Value> = self
                .scripts
                .sliding_window
                .key(key)
                .arg(limit)
                .arg(window.as_secs().max(1))
                .arg(&member)
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| {
                    error!("Sliding window script failed: {}", e);
                    ShaprError::from(e)
                })?;

            // [allowed, remaining]
            if result.len() != 2 {
                return Err(ShaprError::ScriptExecutionError(format!(
                    "Invalid script response length: {}",
                    result.len()
                )));
            }

            let allowed = Self::parse_int(&result[0], "allowed")? == 1;
            let remaining = Self::parse_int(&result[1], "remaining")?.max(0) as u32;

            debug!(
                "Sliding window result: key={}, allowed={}, remaining={}",
                key, allowed, remaining
            );

            Ok::<_, ShaprError>(WindowAdmission { allowed, remaining })
        })
        .await
    }

    async fn window_occupancy(&self, key: &str, window: Duration) -> Result<u64> {
        self.timed("window_occupancy", async {
            let mut conn = self.conn().await?;
            let count: i64 = self
                .scripts
                .window_occupancy
                .key(key)
                .arg(window.as_secs().max(1))
                .invoke_async(&mut *conn)
                .await?;
            Ok::<_, ShaprError>(count.max(0) as u64)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.timed("get", async {
            let mut conn = self.conn().await?;
            let value: Option<String> = conn.get(key).await?;
            Ok::<_, ShaprError>(value)
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.timed("setex", async {
            let mut conn = self.conn().await?;
            let () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            Ok::<_, ShaprError>(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.timed("del", async {
            let mut conn = self.conn().await?;
            let removed: i64 = conn.del(key).await?;
            Ok::<_, ShaprError>(removed > 0)
        })
        .await
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        self.timed("scan_del", async {
            let mut conn = self.conn().await?;
            let mut cursor: u64 = 0;
            let mut removed: u64 = 0;

            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(200)
                    .query_async(&mut *conn)
                    .await?;

                if !keys.is_empty() {
                    let deleted: i64 = conn.del(&keys).await?;
                    removed += deleted.max(0) as u64;
                }

                if next == 0 {
                    break;
                }
                cursor = next;
            }

            debug!("Deleted {} keys matching {}", removed, pattern);
            Ok::<_, ShaprError>(removed)
        })
        .await
    }

    async fn incr_with_initial_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.timed("quota_incr", async {
            let mut conn = self.conn().await?;
            let count: i64 = self
                .scripts
                .quota_incr
                .key(key)
                .arg(ttl.as_secs().max(1))
                .invoke_async(&mut *conn)
                .await?;
            Ok::<_, ShaprError>(count)
        })
        .await
    }

    async fn get_counter(&self, key: &str) -> Result<i64> {
        self.timed("get", async {
            let mut conn = self.conn().await?;
            let value: Option<i64> = conn.get(key).await?;
            Ok::<_, ShaprError>(value.unwrap_or(0))
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.timed("ttl", async {
            let mut conn = self.conn().await?;
            // -2 absent, -1 no expiry
            let secs: i64 = conn.ttl(key).await?;
            Ok::<_, ShaprError>((secs >= 0).then(|| Duration::from_secs(secs as u64)))
        })
        .await
    }
}

/// Connects to Redis using the pool settings in [`RedisConfig`]
pub struct RedisConnector {
    config: RedisConfig,
}

impl RedisConnector {
    pub fn new(config: RedisConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Store>> {
        let pool = tokio::time::timeout(
            self.config.connection_timeout(),
            create_redis_pool(&self.config),
        )
        .await
        .map_err(|_| ShaprError::StoreTimeout(self.config.connection_timeout()))??;

        let store = RedisStore::new(pool, self.config.command_timeout()).await?;
        Ok(Arc::new(store))
    }
}
