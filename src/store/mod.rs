pub mod local;
pub mod manager;
pub mod pool;
pub mod remote;
pub mod script;

use crate::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use local::LocalStore;
pub use manager::ConnectionManager;
pub use remote::{RedisConnector, RedisStore};

/// Outcome of one sliding-window admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    pub allowed: bool,

    /// Slots left in the window after this request (0 when denied)
    pub remaining: u32,
}

/// Counter, cache and sliding-window primitives shared by the traffic layer.
///
/// Implementations must run `admit_sliding_window` and
/// `incr_with_initial_ttl` atomically per key.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name for logs and metrics ("redis", "memory")
    fn kind(&self) -> &'static str;

    /// Lightweight liveness probe
    async fn ping(&self) -> Result<()>;

    /// Prune entries older than `window`, count, and record this request if
    /// fewer than `limit` remain. The key expires after `window`.
    async fn admit_sliding_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowAdmission>;

    /// Prune and count without recording a request
    async fn window_occupancy(&self, key: &str, window: Duration) -> Result<u64>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns whether a key was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every key matching a glob (`*`, `?`); returns the count
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;

    /// Increment and, only when the new value is 1, set the TTL
    async fn incr_with_initial_ttl(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Integer value of a counter, 0 when absent
    async fn get_counter(&self, key: &str) -> Result<i64>;

    /// Remaining lifetime of a key; `None` when absent or persistent
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}

/// Builds a connected remote store. The manager calls this on every
/// (re)connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Store>>;
}
