pub mod auth;
pub mod cache;
pub mod config;
pub mod errors;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod quota;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use cache::{cache_key, Cache};
pub use config::{AppConfig, PolicyCache};
pub use errors::{Result, ShaprError};
pub use limiter::{LimitDecision, RateLimiter, SlidingWindowLimiter};
pub use quota::{QuotaGate, QuotaTracker};
pub use server::{build_router, router_with, start_server, AppState, ServerConfig};
pub use store::{ConnectionManager, Store};
