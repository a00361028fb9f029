//! Bridge runner for lifecycle management.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use modgate_common::{LoggingConfig, connect, init_tracing};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::publisher::Publisher;
use crate::status::StatusPublisher;

/// How long workers get to drain after the shutdown signal before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Bridge runner that manages the lifecycle of a protocol bridge.
///
/// Handles:
/// - Logging initialization
/// - Zenoh connection
/// - Task spawning and shutdown signalling
/// - Graceful shutdown on Ctrl+C
/// - Status publishing (optional)
///
/// # Example
///
/// ```ignore
/// use modgate_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args)).await?;
///
///     let shutdown = runner.shutdown_signal();
///     runner.spawn(async move {
///         // Worker logic here, exiting when `shutdown` flips to true
///     });
///
///     runner.run().await
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging and status.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Zenoh session.
    session: Arc<zenoh::Session>,
    /// Publisher rooted at the bridge key prefix.
    publisher: Publisher,
    /// Status publisher (optional).
    status_publisher: Option<StatusPublisher>,
    /// Flipped to `true` when shutdown starts.
    shutdown_tx: watch::Sender<bool>,
    /// Spawned tasks.
    tasks: Vec<JoinHandle<()>>,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a new bridge runner.
    ///
    /// This will:
    /// 1. Initialize logging based on config
    /// 2. Connect to Zenoh
    /// 3. Create the publisher
    pub async fn new(name: impl Into<String>, config: C) -> Result<Self> {
        Self::new_with_args(name, config, None).await
    }

    /// Create a new bridge runner with CLI args for log level override.
    pub async fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let name = name.into();
        let version = env!("CARGO_PKG_VERSION").to_string();

        let log_config = match args.and_then(|a| a.log_level.as_ref()) {
            Some(level) => LoggingConfig {
                level: level.clone(),
                format: config.logging().format,
            },
            None => config.logging().clone(),
        };

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        tracing::info!(bridge = %name, version = %version, "Starting bridge");

        let session = Arc::new(
            connect(config.zenoh())
                .await
                .map_err(|e| BridgeError::ZenohConnection(e.to_string()))?,
        );

        let publisher = Publisher::new(session.clone(), config.key_prefix());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            name,
            version,
            config,
            session,
            publisher,
            status_publisher: None,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Enable status publishing.
    ///
    /// When enabled, the runner will publish status messages on startup and shutdown.
    pub fn with_status_publishing(mut self) -> Self {
        self.status_publisher = Some(StatusPublisher::new(
            self.publisher.clone(),
            &self.name,
            &self.version,
        ));
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Get a reference to the Zenoh session.
    pub fn session(&self) -> &Arc<zenoh::Session> {
        &self.session
    }

    /// Get a clone of the publisher.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Receiver that turns `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn a worker task.
    ///
    /// The task is given [`SHUTDOWN_GRACE`] to finish after shutdown is
    /// signalled, then aborted.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Run the bridge until Ctrl+C is received.
    pub async fn run(self) -> Result<()> {
        self.run_with_metadata(None).await
    }

    /// Run the bridge with custom status metadata.
    ///
    /// This will:
    /// 1. Publish "running" status (if enabled)
    /// 2. Wait for Ctrl+C
    /// 3. Signal shutdown and give workers a grace period, then abort them
    /// 4. Publish "offline" status (if enabled)
    /// 5. Close the Zenoh session
    pub async fn run_with_metadata(self, metadata: Option<serde_json::Value>) -> Result<()> {
        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_running(metadata).await {
                tracing::warn!(error = %e, "Failed to publish running status");
            }
        }

        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }

        tracing::info!(bridge = %self.name, "Received shutdown signal");

        self.shutdown_tx.send_replace(true);

        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }

        if let Some(ref status_pub) = self.status_publisher {
            if let Err(e) = status_pub.publish_offline().await {
                tracing::warn!(error = %e, "Failed to publish offline status");
            }
        }

        if let Err(e) = self.session.close().await {
            tracing::warn!(error = %e, "Error closing Zenoh session");
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}
