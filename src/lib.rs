pub mod auth;
pub mod backend;
pub mod changefeed;
pub mod client;
pub mod comments;
pub mod config;
pub mod error;
pub mod interactions;
pub mod models;
pub mod posts;
pub mod profiles;
pub mod storage;

// Re-export commonly used items for tests / external users
pub use client::Foodie;
pub use config::Config;
pub use error::{AppError, AppResult};

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a default tracing subscriber honoring `RUST_LOG`. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .try_init();
}
