use crate::errors::{Result, ShaprError};
use redis::aio::ConnectionLike;
use redis::Script;
use tracing::{debug, info};

const SLIDING_WINDOW: &str = include_str!("../../scripts/sliding_window.lua");
const WINDOW_OCCUPANCY: &str = include_str!("../../scripts/window_occupancy.lua");
const QUOTA_INCR: &str = include_str!("../../scripts/quota_incr.lua");

/// Lua scripts executed server-side; each runs atomically in Redis.
pub struct Scripts {
    pub sliding_window: Script,
    pub window_occupancy: Script,
    pub quota_incr: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            sliding_window: Script::new(SLIDING_WINDOW),
            window_occupancy: Script::new(WINDOW_OCCUPANCY),
            quota_incr: Script::new(QUOTA_INCR),
        }
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

/// Register every script with Redis so the first EVALSHA does not miss.
pub async fn load_scripts<C: ConnectionLike>(conn: &mut C, scripts: &Scripts) -> Result<()> {
    debug!("Loading Lua scripts into Redis...");

    for (name, script) in [
        ("sliding_window", &scripts.sliding_window),
        ("window_occupancy", &scripts.window_occupancy),
        ("quota_incr", &scripts.quota_incr),
    ] {
        let sha = script
            .prepare_invoke()
            .load_async(conn)
            .await
            .map_err(|e| {
                ShaprError::ScriptExecutionError(format!(
                    "Failed to load Lua script {}: {}",
                    name, e
                ))
            })?;
        info!("Lua script {} loaded (SHA: {})", name, sha);
    }

    Ok(())
}
