//! ModGate Bridge Framework
//!
//! Common abstractions for bridges that sit on a Zenoh bus.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`Publisher`] for publishing raw and JSON payloads to Zenoh
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeStatus`] for standardized status reporting

mod args;
mod config;
mod error;
mod publisher;
mod runner;
mod status;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use publisher::Publisher;
pub use runner::BridgeRunner;
pub use status::{BridgeStatus, StatusPublisher};

// Re-export commonly used types from modgate-common
pub use modgate_common::{LogFormat, LoggingConfig, ZenohConfig};
