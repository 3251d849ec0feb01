//! Notify-based traffic policy hot reload.
//!
//! Watches the JSON policy file; on create/modify events it reloads,
//! validates and atomically replaces the shared `PolicyCache`. A bad file
//! leaves the previous policy in place.

use crate::config::loader::load_traffic_config_from_file;
use crate::config::PolicyCache;
use crate::errors::ShaprError;
use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Watch the policy file and swap in each valid revision.
pub async fn watch_config_file(
    path: PathBuf,
    shared_policy: Arc<ArcSwap<PolicyCache>>,
) -> Result<(), notify::Error> {
    // Bridges the watcher's sync callback thread to this task.
    let (tx, mut rx) = mpsc::channel(1);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Err(e) = tx.blocking_send(res) {
                debug!("Failed to send config file event: {}", e);
            }
        },
        notify::Config::default(),
    )?;

    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    info!("Watching traffic config for changes: {}", path.display());

    while let Some(res) = rx.recv().await {
        match res {
            Ok(event) => {
                if should_reload(&event) {
                    info!(
                        "Traffic config change detected. Event: {:?}. Triggering reload.",
                        event.kind
                    );
                    reload_config(&path, &shared_policy).await;
                } else {
                    debug!("Ignoring irrelevant filesystem event: {:?}", event.kind);
                }
            }
            Err(e) => {
                crate::metrics::record_config_reload(false);
                error!("Error watching config file: {}", e);
            }
        }
    }

    warn!("Configuration watcher task is shutting down.");
    Ok(())
}

fn should_reload(event: &Event) -> bool {
    matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
    )
}

/// Reload, validate and swap. Returns whether the swap happened.
pub async fn reload_config(path: &Path, shared_policy: &Arc<ArcSwap<PolicyCache>>) -> bool {
    let config = match load_traffic_config_from_file(path).await {
        Ok(config) => config,
        Err(e) => {
            crate::metrics::record_config_reload(false);
            match e {
                ShaprError::FileSystemError(io_err) => error!(
                    "Failed to read config file '{}': {}. Keeping old config.",
                    path.display(),
                    io_err
                ),
                ShaprError::JsonError(json_err) => error!(
                    "Failed to parse JSON from '{}': {}. Keeping old config.",
                    path.display(),
                    json_err
                ),
                ShaprError::InvalidPolicy(msg) | ShaprError::ConfigurationError(msg) => error!(
                    "New configuration in '{}' is invalid: {}. Keeping old config.",
                    path.display(),
                    msg
                ),
                other => error!(
                    "Unexpected error while reloading config: {}. Keeping old config.",
                    other
                ),
            }
            return false;
        }
    };

    let policy = PolicyCache::new(config);
    crate::metrics::update_policy_metrics(&policy.stats());

    shared_policy.store(Arc::new(policy));
    crate::metrics::record_config_reload(true);
    info!("Traffic configuration hot-reloaded successfully.");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitClass, TrafficConfig};
    use std::io::Write;

    #[tokio::test]
    async fn test_reload_swaps_valid_config() {
        let shared = Arc::new(ArcSwap::from_pointee(PolicyCache::new(TrafficConfig::default())));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "classes": {{ "public": {{ "limit": 7, "window_secs": 60 }} }} }}"#
        )
        .unwrap();

        assert!(reload_config(file.path(), &shared).await);
        assert_eq!(shared.load().class_limit(LimitClass::Public).limit, 7);
    }

    #[tokio::test]
    async fn test_reload_keeps_old_config_on_bad_json() {
        let shared = Arc::new(ArcSwap::from_pointee(PolicyCache::new(TrafficConfig::default())));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        assert!(!reload_config(file.path(), &shared).await);
        assert_eq!(shared.load().class_limit(LimitClass::Public).limit, 30);
    }
}
