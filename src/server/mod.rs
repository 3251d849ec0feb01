pub mod handler;
pub mod middleware;

use arc_swap::ArcSwap;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::TokenVerifier;
use crate::cache::Cache;
use crate::config::{PolicyCache, TrafficConfig};
use crate::errors::{Result, ShaprError};
use crate::limiter::{RateLimiter, SlidingWindowLimiter};
use crate::policy::PolicySelector;
use crate::quota::{QuotaGate, QuotaTracker};
use crate::store::ConnectionManager;

pub use middleware::rate_limit_middleware;

/// HTTP server configuration
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HTTP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("HTTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared handles for middleware and handlers
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<dyn RateLimiter>,
    pub selector: Arc<PolicySelector>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub policy: Arc<ArcSwap<PolicyCache>>,
    pub manager: ConnectionManager,
    pub cache: Arc<Cache>,
    pub quotas: QuotaGate,
}

impl AppState {
    /// Wire the traffic layer over one connection manager. Cache settings
    /// are read once from `traffic`; limits and quotas follow `policy`.
    pub fn new(
        manager: ConnectionManager,
        policy: Arc<ArcSwap<PolicyCache>>,
        verifier: Arc<dyn TokenVerifier>,
        traffic: &TrafficConfig,
    ) -> Self {
        let cache = Cache::new(
            manager.clone(),
            traffic.cache_enabled,
            Duration::from_secs(traffic.cache_default_ttl_secs),
        );

        Self {
            limiter: Arc::new(SlidingWindowLimiter::new(manager.clone())),
            selector: Arc::new(PolicySelector::new(Arc::clone(&verifier))),
            verifier,
            quotas: QuotaGate::new(QuotaTracker::new(manager.clone()), Arc::clone(&policy)),
            policy,
            manager,
            cache: Arc::new(cache),
        }
    }
}

/// Service routes plus `routes`, all behind the rate limit middleware
pub fn router_with(state: AppState, routes: Router<AppState>) -> Router {
    Router::new()
        .route("/health", get(handler::health))
        .route("/metrics", get(handler::metrics))
        .route("/api/quota/{feature}", get(handler::quota_status))
        .merge(routes)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn build_router(state: AppState) -> Router {
    router_with(state, Router::new())
}

/// Serve until ctrl-c
pub async fn start_server(config: ServerConfig, state: AppState) -> Result<()> {
    let addr: SocketAddr = config.addr().parse().map_err(|e| {
        ShaprError::ConfigurationError(format!("Invalid server address: {}", e))
    })?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
