//! TTL cache over the managed store.
//!
//! Every write also lands in the in-process mirror, so reads survive a
//! lost Redis connection. Values are stored as JSON.

use crate::errors::{Result, ShaprError};
use crate::store::{ConnectionManager, Store};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Build a cache key as `cache:<domain>:<sha256 of the joined parts>`
pub fn cache_key(domain: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\x1f");
        }
        hasher.update(part.as_bytes());
    }
    format!("cache:{}:{}", domain, hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub connected: bool,
    pub fallback_entries: usize,
}

pub struct Cache {
    manager: ConnectionManager,
    enabled: bool,
    default_ttl: Duration,
}

impl Cache {
    pub fn new(manager: ConnectionManager, enabled: bool, default_ttl: Duration) -> Self {
        Self {
            manager,
            enabled,
            default_ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up and decode a value. Backend trouble and undecodable entries
    /// read as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }

        let raw = self.read_raw(key).await;
        let value = raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding undecodable cache entry '{}': {}", key, e);
                None
            }
        });

        crate::metrics::record_cache_lookup(if value.is_some() { "hit" } else { "miss" });
        value
    }

    async fn read_raw(&self, key: &str) -> Option<String> {
        let Some(remote) = self.manager.remote() else {
            crate::metrics::record_fallback_use("cache_get");
            return self.read_mirror(key).await;
        };

        match remote.get(key).await {
            Ok(value) => value,
            Err(ShaprError::StoreTimeout(after)) => {
                warn!("Cache read for '{}' timed out after {:?}; using mirror", key, after);
                crate::metrics::record_fallback_use("cache_get");
                self.read_mirror(key).await
            }
            Err(e) if e.is_connection_loss() => {
                self.manager.report_error(&e).await;
                crate::metrics::record_fallback_use("cache_get");
                self.read_mirror(key).await
            }
            Err(e) => {
                error!("Cache read for '{}' failed: {}", key, e);
                crate::metrics::record_cache_lookup("error");
                None
            }
        }
    }

    async fn read_mirror(&self, key: &str) -> Option<String> {
        // The local store does not fail
        self.manager.local().get(key).await.ok().flatten()
    }

    /// Store a value. Only a value that cannot be serialized is an error;
    /// backend failures are logged and absorbed.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let raw = serde_json::to_string(value)
            .map_err(|e| ShaprError::SerializationError(format!("{}: {}", key, e)))?;

        self.manager.local().set_ex(key, &raw, ttl).await?;

        if let Some(remote) = self.manager.remote() {
            if let Err(e) = remote.set_ex(key, &raw, ttl).await {
                warn!("Cache write for '{}' kept only in mirror: {}", key, e);
                self.manager.report_error(&e).await;
            }
        }

        debug!("Cached '{}' for {:?}", key, ttl);
        Ok(())
    }

    pub async fn set_default<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, value, self.default_ttl).await
    }

    /// Remove a key from the mirror and, when connected, from Redis.
    /// Returns whether either held it.
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = self.manager.local().delete(key).await.unwrap_or(false);

        if let Some(remote) = self.manager.remote() {
            match remote.delete(key).await {
                Ok(hit) => removed |= hit,
                Err(e) => {
                    warn!("Cache delete for '{}' failed on Redis: {}", key, e);
                    self.manager.report_error(&e).await;
                }
            }
        }

        removed
    }

    /// Remove every key matching a glob. Returns the larger of the two
    /// stores' removal counts.
    pub async fn delete_pattern(&self, pattern: &str) -> u64 {
        let local = match self.manager.local().delete_matching(pattern).await {
            Ok(count) => count,
            Err(e) => {
                error!("Invalid cache pattern '{}': {}", pattern, e);
                return 0;
            }
        };

        let remote = match self.manager.remote() {
            Some(remote) => match remote.delete_matching(pattern).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Pattern delete '{}' failed on Redis: {}", pattern, e);
                    self.manager.report_error(&e).await;
                    0
                }
            },
            None => 0,
        };

        debug!("Invalidated {} keys matching '{}'", local.max(remote), pattern);
        local.max(remote)
    }

    /// Drop every entry produced under `domain` by [`cache_key`]
    pub async fn invalidate_domain(&self, domain: &str) -> u64 {
        self.delete_pattern(&format!("cache:{}:*", domain)).await
    }

    /// Cache-aside: return the cached value or compute, store and return it.
    /// Errors from `compute` are passed through and nothing is stored.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(hit);
        }

        let value = compute().await?;
        if let Err(e) = self.set(key, &value, ttl).await {
            warn!("Computed value for '{}' not cached: {}", key, e);
        }
        Ok(value)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.enabled,
            connected: self.manager.is_connected(),
            fallback_entries: self.manager.local().len(),
        }
    }
}
