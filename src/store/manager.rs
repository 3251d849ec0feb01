//! Backend selection, health probing and bounded-backoff reconnection.
//!
//! The manager always owns a [`LocalStore`]; the remote store is present
//! only while connected. At most one reconnection task is in flight.

use crate::config::{DegradedMode, ReconnectPolicy};
use crate::errors::ShaprError;
use crate::store::{Connector, LocalStore, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Inner {
    connector: Arc<dyn Connector>,
    remote: RwLock<Option<Arc<dyn Store>>>,
    local: Arc<LocalStore>,
    connected: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    reconnect: ReconnectPolicy,
    degraded_mode: DegradedMode,
}

/// Cheap to clone; all clones share one connection state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        reconnect: ReconnectPolicy,
        degraded_mode: DegradedMode,
    ) -> Self {
        crate::metrics::set_connected(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                remote: RwLock::new(None),
                local: Arc::new(LocalStore::new()),
                connected: AtomicBool::new(false),
                reconnect_task: Mutex::new(None),
                reconnect,
                degraded_mode,
            }),
        }
    }

    /// Try to (re)establish the remote store. On failure dependents fall
    /// back to the local store.
    pub async fn connect(&self) -> bool {
        match self.inner.connector.connect().await {
            Ok(store) => {
                *self.inner.remote.write().unwrap_or_else(|e| e.into_inner()) = Some(store);
                self.set_connected(true);
                info!("Redis connected successfully");
                true
            }
            Err(e) => {
                error!("Redis connection failed: {}", e);
                warn!("Falling back to in-memory store");
                self.set_connected(false);
                false
            }
        }
    }

    /// Ping the remote store. A failed probe marks the manager disconnected
    /// and schedules one background reconnection.
    pub async fn health_check(&self) -> bool {
        let remote = self.remote();
        let Some(store) = remote else {
            self.schedule_reconnect();
            return false;
        };

        match store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Redis health check failed: {}", e);
                self.mark_disconnected();
                false
            }
        }
    }

    /// Drop the remote store and stop any reconnection in flight.
    pub async fn disconnect(&self) {
        if let Some(handle) = self
            .inner
            .reconnect_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let had_remote = self
            .inner
            .remote
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        self.set_connected(false);

        if had_remote {
            info!("Redis connection closed");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn degraded_mode(&self) -> DegradedMode {
        self.inner.degraded_mode
    }

    /// The remote store, only while connected
    pub fn remote(&self) -> Option<Arc<dyn Store>> {
        if !self.is_connected() {
            return None;
        }
        self.inner
            .remote
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The process-local store (fallback and cache mirror)
    pub fn local(&self) -> Arc<LocalStore> {
        Arc::clone(&self.inner.local)
    }

    /// Store that counters should use right now: the remote store when
    /// connected, the local store in `Local` degraded mode, otherwise none.
    pub fn counter_store(&self) -> Option<Arc<dyn Store>> {
        match self.remote() {
            Some(store) => Some(store),
            None => match self.inner.degraded_mode {
                DegradedMode::Local => {
                    crate::metrics::record_fallback_use("counter");
                    Some(self.inner.local.clone() as Arc<dyn Store>)
                }
                DegradedMode::Open => None,
            },
        }
    }

    /// Feed a backend error back into the connection state. A single
    /// failed command only triggers a ping; the manager flips to
    /// disconnected when that ping fails too.
    pub async fn report_error(&self, err: &ShaprError) {
        if !err.is_connection_loss() || !self.is_connected() {
            return;
        }

        warn!("Possible Redis connection loss, pinging: {}", err);
        if self.health_check().await {
            debug!("Redis still answers; treating '{}' as transient", err);
        }
    }

    /// Whether a reconnection task is currently running
    pub fn is_reconnecting(&self) -> bool {
        self.inner
            .reconnect_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn mark_disconnected(&self) {
        self.set_connected(false);
        self.schedule_reconnect();
    }

    fn set_connected(&self, connected: bool) {
        let previous = self.inner.connected.swap(connected, Ordering::AcqRel);
        if previous != connected {
            debug!("Redis connection state: {} -> {}", previous, connected);
        }
        crate::metrics::set_connected(connected);
    }

    /// Spawn the reconnection task unless one is already in flight.
    fn schedule_reconnect(&self) {
        let mut slot = self
            .inner
            .reconnect_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Reconnection already in progress");
            return;
        }

        if self.inner.reconnect.max_attempts == 0 {
            return;
        }

        let manager = self.clone();
        *slot = Some(tokio::spawn(async move {
            manager.reconnect_loop().await;
        }));
        info!("Scheduled background Redis reconnection");
    }

    async fn reconnect_loop(&self) {
        let policy = self.inner.reconnect;

        for attempt in 1..=policy.max_attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
            crate::metrics::record_reconnect_attempt();

            if self.connect().await {
                info!("Redis reconnected after {} attempts", attempt);
                return;
            }
            warn!("Reconnect attempt {} failed", attempt);
        }

        error!(
            "Failed to reconnect to Redis after {} attempts",
            policy.max_attempts
        );
    }

    /// Periodically probe the remote store and sweep expired fallback
    /// entries. Runs until the returned handle is aborted.
    pub fn spawn_health_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if manager.is_connected() {
                    manager.health_check().await;
                }
                manager.local().purge_expired();
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::Result;
    use crate::store::WindowAdmission;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Connector that fails a set number of times, then hands out a
    /// shared in-memory store as the "remote".
    pub(crate) struct TestConnector {
        pub failures_left: AtomicUsize,
        pub calls: AtomicUsize,
        pub store: Arc<dyn Store>,
    }

    impl TestConnector {
        pub(crate) fn healthy(store: Arc<dyn Store>) -> Arc<Self> {
            Self::failing_then(0, store)
        }

        pub(crate) fn failing_then(failures: usize, store: Arc<dyn Store>) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                store,
            })
        }
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn connect(&self) -> Result<Arc<dyn Store>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ShaprError::StoreUnavailable("connection refused".into()));
            }
            Ok(Arc::clone(&self.store))
        }
    }

    /// Store whose every operation fails.
    pub(crate) struct BrokenStore {
        pub connection_loss: bool,
    }

    impl BrokenStore {
        fn err(&self) -> ShaprError {
            if self.connection_loss {
                ShaprError::StoreUnavailable("socket closed".into())
            } else {
                ShaprError::RedisCommandError("ERR something odd".into())
            }
        }
    }

    #[async_trait]
    impl Store for BrokenStore {
        fn kind(&self) -> &'static str {
            "broken"
        }
        async fn ping(&self) -> Result<()> {
            Err(self.err())
        }
        async fn admit_sliding_window(&self, _: &str, _: u32, _: Duration) -> Result<WindowAdmission> {
            Err(self.err())
        }
        async fn window_occupancy(&self, _: &str, _: Duration) -> Result<u64> {
            Err(self.err())
        }
        async fn get(&self, _: &str) -> Result<Option<String>> {
            Err(self.err())
        }
        async fn set_ex(&self, _: &str, _: &str, _: Duration) -> Result<()> {
            Err(self.err())
        }
        async fn delete(&self, _: &str) -> Result<bool> {
            Err(self.err())
        }
        async fn delete_matching(&self, _: &str) -> Result<u64> {
            Err(self.err())
        }
        async fn incr_with_initial_ttl(&self, _: &str, _: Duration) -> Result<i64> {
            Err(self.err())
        }
        async fn get_counter(&self, _: &str) -> Result<i64> {
            Err(self.err())
        }
        async fn ttl(&self, _: &str) -> Result<Option<Duration>> {
            Err(self.err())
        }
    }

    /// Store that fails its first `failures` operations with the given
    /// error, then behaves like a healthy in-memory store. Pings always
    /// succeed.
    pub(crate) struct FlakyStore {
        pub failures_left: AtomicUsize,
        pub error: fn() -> ShaprError,
        pub inner: LocalStore,
    }

    impl FlakyStore {
        pub(crate) fn new(failures: usize, error: fn() -> ShaprError) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicUsize::new(failures),
                error,
                inner: LocalStore::new(),
            })
        }

        fn trip(&self) -> Result<()> {
            let tripped = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if tripped {
                Err((self.error)())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        fn kind(&self) -> &'static str {
            "flaky"
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn admit_sliding_window(&self, key: &str, limit: u32, window: Duration) -> Result<WindowAdmission> {
            self.trip()?;
            self.inner.admit_sliding_window(key, limit, window).await
        }
        async fn window_occupancy(&self, key: &str, window: Duration) -> Result<u64> {
            self.trip()?;
            self.inner.window_occupancy(key, window).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.trip()?;
            self.inner.get(key).await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.trip()?;
            self.inner.set_ex(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<bool> {
            self.trip()?;
            self.inner.delete(key).await
        }
        async fn delete_matching(&self, pattern: &str) -> Result<u64> {
            self.trip()?;
            self.inner.delete_matching(pattern).await
        }
        async fn incr_with_initial_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
            self.trip()?;
            self.inner.incr_with_initial_ttl(key, ttl).await
        }
        async fn get_counter(&self, key: &str) -> Result<i64> {
            self.trip()?;
            self.inner.get_counter(key).await
        }
        async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
            self.trip()?;
            self.inner.ttl(key).await
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn test_connect_success_and_failure() {
        let ok = ConnectionManager::new(
            TestConnector::healthy(Arc::new(LocalStore::new())),
            fast_policy(),
            DegradedMode::Open,
        );
        assert!(ok.connect().await);
        assert!(ok.is_connected());
        assert!(ok.remote().is_some());

        let bad = ConnectionManager::new(
            TestConnector::failing_then(usize::MAX, Arc::new(LocalStore::new())),
            fast_policy(),
            DegradedMode::Open,
        );
        assert!(!bad.connect().await);
        assert!(!bad.is_connected());
        assert!(bad.remote().is_none());
        assert!(bad.counter_store().is_none());
    }

    #[tokio::test]
    async fn test_local_mode_routes_counters_to_fallback() {
        let manager = ConnectionManager::new(
            TestConnector::failing_then(usize::MAX, Arc::new(LocalStore::new())),
            fast_policy(),
            DegradedMode::Local,
        );
        assert!(!manager.connect().await);
        assert_eq!(manager.counter_store().map(|s| s.kind()), Some("memory"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_failure_schedules_single_reconnect() {
        let connector = TestConnector::failing_then(1, Arc::new(LocalStore::new()));
        let manager = ConnectionManager::new(connector.clone(), fast_policy(), DegradedMode::Open);

        // Start connected to a broken remote
        *manager.inner.remote.write().unwrap() = Some(Arc::new(BrokenStore {
            connection_loss: true,
        }));
        manager.set_connected(true);

        assert!(!manager.health_check().await);
        assert!(!manager.is_connected());
        assert!(manager.is_reconnecting());

        // A second failure while in flight must not spawn another task
        assert!(!manager.health_check().await);
        assert!(manager.is_reconnecting());

        // Attempt 1 after 1s fails, attempt 2 after 2s more succeeds
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert!(manager.is_connected());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
        assert!(!manager.is_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let connector = TestConnector::failing_then(usize::MAX, Arc::new(LocalStore::new()));
        let manager = ConnectionManager::new(connector.clone(), fast_policy(), DegradedMode::Open);

        assert!(!manager.health_check().await);
        assert!(manager.is_reconnecting());

        // 1s + 2s + 2s
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!manager.is_reconnecting());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);

        // An explicit probe restarts the task
        assert!(!manager.health_check().await);
        assert!(manager.is_reconnecting());
    }

    #[tokio::test]
    async fn test_report_error_only_reacts_to_connection_loss() {
        let manager = ConnectionManager::new(
            TestConnector::healthy(Arc::new(LocalStore::new())),
            fast_policy(),
            DegradedMode::Open,
        );
        assert!(manager.connect().await);

        manager
            .report_error(&ShaprError::RedisCommandError("WRONGTYPE".into()))
            .await;
        assert!(manager.is_connected());

        // The remote still answers pings, so one lost command is transient
        manager
            .report_error(&ShaprError::StoreUnavailable("gone".into()))
            .await;
        assert!(manager.is_connected());
        assert!(!manager.is_reconnecting());

        manager.disconnect().await;
        assert!(!manager.is_reconnecting());
    }

    #[tokio::test]
    async fn test_report_error_disconnects_when_ping_fails() {
        let manager = ConnectionManager::new(
            TestConnector::healthy(Arc::new(BrokenStore {
                connection_loss: true,
            })),
            ReconnectPolicy {
                max_attempts: 0,
                ..fast_policy()
            },
            DegradedMode::Open,
        );
        assert!(manager.connect().await);

        manager
            .report_error(&ShaprError::StoreUnavailable("socket closed".into()))
            .await;
        assert!(!manager.is_connected());
    }
}
