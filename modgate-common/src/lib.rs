//! ModGate Common Library
//!
//! Shared pieces for ModGate bridges:
//!
//! - [`config`] - Zenoh and logging configuration, JSON5 loading
//! - [`session`] - Zenoh session management
//! - [`keyexpr`] - Endpoint key expression helpers
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod keyexpr;
pub mod session;

pub use config::{LogFormat, LoggingConfig, ZenohConfig, load_config, parse_config};
pub use error::{Error, Result};
pub use keyexpr::{
    KEY_PREFIX, health_key, join, status_key, subtree_wildcard, suffix_under, validate_endpoint,
};
pub use session::connect;

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Output is either
/// human-readable text or one JSON object per line.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))
}
