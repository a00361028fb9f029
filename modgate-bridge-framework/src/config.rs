//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{BridgeError, Result};
use crate::{LoggingConfig, ZenohConfig};

/// Trait for bridge configuration types.
///
/// Implement this for a bridge's configuration struct to get JSON5 loading
/// with validation, and to hand the runner the sections it needs.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use modgate_bridge_framework::{BridgeConfig, LoggingConfig, ZenohConfig};
///
/// #[derive(Debug, Deserialize)]
/// pub struct MyBridgeConfig {
///     pub zenoh: ZenohConfig,
///     pub logging: LoggingConfig,
///     pub key_prefix: String,
/// }
///
/// impl BridgeConfig for MyBridgeConfig {
///     fn zenoh(&self) -> &ZenohConfig {
///         &self.zenoh
///     }
///
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
///
///     fn key_prefix(&self) -> &str {
///         &self.key_prefix
///     }
/// }
/// ```
pub trait BridgeConfig: Sized + DeserializeOwned {
    /// Get the Zenoh configuration.
    fn zenoh(&self) -> &ZenohConfig;

    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Get the key expression prefix for status and health reports.
    fn key_prefix(&self) -> &str;

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Parse and validate configuration from a JSON5 string.
    fn from_json5(content: &str) -> Result<Self> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BridgeError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_json5(&content)
    }
}
