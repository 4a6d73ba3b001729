pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod notify;
pub mod ratelimit;
pub mod server;
pub mod store;

use std::sync::Arc;
use std::time::Instant;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<engine::SecretService>,
    pub limiter: ratelimit::RateLimiter,
    /// Optional API key guarding owner routes.
    pub api_key: Option<String>,
    pub started_at: Instant,
}

pub use config::{read_key_file, resolve_data_dir, ServerConfig};
pub use error::SecretError;
pub use server::{router, run};
