//! Process-local store used while Redis is unreachable and as the cache
//! mirror. Entries never outlive the process and are not shared between
//! instances.

use crate::errors::{Result, ShaprError};
use crate::store::{Store, WindowAdmission};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
enum LocalValue {
    Text(String),
    Counter(i64),
    /// Request timestamps in seconds, oldest first
    Window(VecDeque<f64>),
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: LocalValue,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory implementation of [`Store`]
pub struct LocalStore {
    entries: DashMap<String, LocalEntry>,
    /// Wall-clock seconds at `started`; window timestamps are derived from
    /// the monotonic clock so paused-time tests stay consistent.
    epoch_at_start: f64,
    started: Instant,
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            epoch_at_start: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            started: Instant::now(),
        }
    }

    fn now_secs(&self) -> f64 {
        self.epoch_at_start + self.started.elapsed().as_secs_f64()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Purged {} expired fallback entries", removed);
        }
        removed
    }

    fn prune(window: &mut VecDeque<f64>, window_start: f64) {
        while window.front().is_some_and(|ts| *ts < window_start) {
            window.pop_front();
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate a Redis-style glob into an anchored regex: `*` matches any run
/// of characters, `?` exactly one, everything else literally.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut literal = String::new();

    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                expr.push_str(if ch == '*' { ".*" } else { "." });
            }
            _ => literal.push(ch),
        }
    }
    expr.push_str(&regex::escape(&literal));
    expr.push('$');

    Regex::new(&expr)
        .map_err(|e| ShaprError::InternalError(format!("Invalid key pattern '{}': {}", pattern, e)))
}

#[async_trait]
impl Store for LocalStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn admit_sliding_window(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowAdmission> {
        let now = Instant::now();
        let now_secs = self.now_secs();
        let window_start = now_secs - window.as_secs_f64();

        // The entry guard holds the shard lock: prune, count and insert are
        // atomic for this key.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| LocalEntry {
                value: LocalValue::Window(VecDeque::new()),
                expires_at: None,
            });

        if entry.is_expired(now) {
            entry.value = LocalValue::Window(VecDeque::new());
            entry.expires_at = None;
        }

        let LocalValue::Window(timestamps) = &mut entry.value else {
            return Err(ShaprError::RedisCommandError(format!(
                "WRONGTYPE key '{}' does not hold a window",
                key
            )));
        };

        Self::prune(timestamps, window_start);
        let count = timestamps.len() as u64;

        if count < limit as u64 {
            timestamps.push_back(now_secs);
            entry.expires_at = Some(now + window);
            Ok(WindowAdmission {
                allowed: true,
                remaining: limit - count as u32 - 1,
            })
        } else {
            Ok(WindowAdmission {
                allowed: false,
                remaining: 0,
            })
        }
    }

    async fn window_occupancy(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let window_start = self.now_secs() - window.as_secs_f64();

        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => match &mut entry.value {
                LocalValue::Window(timestamps) => {
                    Self::prune(timestamps, window_start);
                    Ok(timestamps.len() as u64)
                }
                _ => Ok(0),
            },
            _ => Ok(0),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => match &entry.value {
                LocalValue::Text(text) => Ok(Some(text.clone())),
                LocalValue::Counter(n) => Ok(Some(n.to_string())),
                LocalValue::Window(_) => Ok(None),
            },
            _ => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value: LocalValue::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let matcher = glob_to_regex(pattern)?;
        let now = Instant::now();
        let mut removed = 0u64;
        self.entries.retain(|key, entry| {
            if !matcher.is_match(key) {
                return true;
            }
            if !entry.is_expired(now) {
                removed += 1;
            }
            false
        });
        Ok(removed)
    }

    async fn incr_with_initial_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = LocalEntry {
                        value: LocalValue::Counter(1),
                        expires_at: Some(now + ttl),
                    };
                    return Ok(1);
                }

                let next = match &entry.value {
                    LocalValue::Counter(n) => n + 1,
                    LocalValue::Text(text) => text.trim().parse::<i64>().map_err(|_| {
                        ShaprError::RedisCommandError(format!(
                            "value at '{}' is not an integer",
                            key
                        ))
                    })? + 1,
                    LocalValue::Window(_) => {
                        return Err(ShaprError::RedisCommandError(format!(
                            "WRONGTYPE key '{}' holds a window",
                            key
                        )))
                    }
                };
                entry.value = LocalValue::Counter(next);
                if next == 1 {
                    entry.expires_at = Some(now + ttl);
                }
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LocalEntry {
                    value: LocalValue::Counter(1),
                    expires_at: Some(now + ttl),
                });
                Ok(1)
            }
        }
    }

    async fn get_counter(&self, key: &str) -> Result<i64> {
        match self.get(key).await? {
            Some(text) => text.trim().parse::<i64>().map_err(|_| {
                ShaprError::RedisCommandError(format!("value at '{}' is not an integer", key))
            }),
            None => Ok(0),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self.entries.get(key).and_then(|entry| {
            entry
                .expires_at
                .filter(|at| *at > now)
                .map(|at| at.duration_since(now))
        }))
    }
}
