use arc_swap::ArcSwap;
use shapr::auth::{JwtVerifier, NoAuth, TokenVerifier};
use shapr::config::loader::{build_policy_cache, load_config, traffic_config_path};
use shapr::config::watcher::watch_config_file;
use shapr::store::RedisConnector;
use shapr::{start_server, AppState, ConnectionManager, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shapr=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Traffic shaping service starting...");

    let app_config = load_config().await?;

    let policy = Arc::new(ArcSwap::from_pointee(build_policy_cache(&app_config)));
    shapr::metrics::update_policy_metrics(&policy.load().stats());

    let redis = &app_config.redis;
    let manager = ConnectionManager::new(
        Arc::new(RedisConnector::new(redis.clone())),
        redis.reconnect,
        redis.degraded_mode,
    );
    if !manager.connect().await {
        tracing::warn!("Starting without Redis; traffic layer is degraded");
    }
    let monitor =
        manager.spawn_health_monitor(Duration::from_secs(redis.health_check_interval_secs));

    let watch_path = PathBuf::from(traffic_config_path());
    let watched_policy = Arc::clone(&policy);
    tokio::spawn(async move {
        if let Err(e) = watch_config_file(watch_path, watched_policy).await {
            tracing::error!("Config watcher failed: {}", e);
        }
    });

    let verifier: Arc<dyn TokenVerifier> = match JwtVerifier::from_env() {
        Some(verifier) => Arc::new(verifier),
        None => {
            tracing::warn!("JWT_SECRET not set; every request is treated as anonymous");
            Arc::new(NoAuth)
        }
    };

    let state = AppState::new(manager.clone(), policy, verifier, &app_config.traffic);

    let config = ServerConfig::from_env();
    tracing::info!("Server will listen on: {}", config.addr());

    start_server(config, state).await?;

    monitor.abort();
    manager.disconnect().await;

    Ok(())
}
