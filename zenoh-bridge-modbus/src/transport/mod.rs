//! Transport capability invoked for each accepted request.
//!
//! The bridge hands the request's mode and opaque payload to a [`Transport`]
//! and forwards whatever comes back. Which physical link serves a mode is the
//! transport's business; [`ModeRouter`] picks one per mode.

mod downstream;
mod loopback;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;
use zenoh::Session;

use crate::bus::BusError;
use crate::config::{ModbusBridgeConfig, TransportConfig};
use crate::frame::{Mode, ModePolicy, Payload, Tid};

pub use downstream::DownstreamTransport;
pub use loopback::LoopbackTransport;

/// Transport failures. Both end the request with an error response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no response within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("handler failed: {0}")]
    HandlerFailure(String),
}

impl TransportError {
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::HandlerFailure(msg.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "timeout",
            TransportError::HandlerFailure(_) => "handler_failure",
        }
    }
}

/// Something that can answer a request for a given mode.
///
/// Implementations may take arbitrarily long; the bridge bounds every call
/// with its request timeout and drops the future when it fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn handle(
        &self,
        tid: Tid,
        mode: &Mode,
        data: Payload,
    ) -> Result<Payload, TransportError>;
}

/// Dispatches requests to a per-mode transport, with an optional fallback.
#[derive(Default)]
pub struct ModeRouter {
    routes: HashMap<Mode, Arc<dyn Transport>>,
    fallback: Option<Arc<dyn Transport>>,
}

impl ModeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `mode` with `transport`, replacing any earlier route.
    pub fn route(mut self, mode: Mode, transport: Arc<dyn Transport>) -> Self {
        self.routes.insert(mode, transport);
        self
    }

    /// Serve every mode without an explicit route.
    pub fn fallback(mut self, transport: Arc<dyn Transport>) -> Self {
        self.fallback = Some(transport);
        self
    }

    /// Modes with an explicit route.
    pub fn modes(&self) -> Vec<Mode> {
        let mut modes: Vec<Mode> = self.routes.keys().cloned().collect();
        modes.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        modes
    }
}

#[async_trait]
impl Transport for ModeRouter {
    async fn handle(
        &self,
        tid: Tid,
        mode: &Mode,
        data: Payload,
    ) -> Result<Payload, TransportError> {
        let transport = self
            .routes
            .get(mode)
            .or(self.fallback.as_ref())
            .ok_or_else(|| TransportError::handler(format!("no transport for mode '{}'", mode)))?;

        transport.handle(tid, mode, data).await
    }
}

/// Build the transport a configuration describes.
///
/// Without routes this is the `transport` section alone; with routes it is a
/// [`ModeRouter`] that falls back to the `transport` section.
pub async fn from_config(
    config: &ModbusBridgeConfig,
    session: &Arc<Session>,
) -> Result<Arc<dyn Transport>, BusError> {
    let policy = config.bridge.mode_policy;
    let fallback = build(&config.transport, session, policy).await?;

    let routes = config.parsed_routes()?;
    if routes.is_empty() {
        return Ok(fallback);
    }

    let mut router = ModeRouter::new().fallback(fallback);
    for (mode, transport) in routes {
        info!(%mode, transport = transport.kind(), "Routing mode");
        router = router.route(mode, build(transport, session, policy).await?);
    }
    Ok(Arc::new(router))
}

async fn build(
    config: &TransportConfig,
    session: &Arc<Session>,
    policy: ModePolicy,
) -> Result<Arc<dyn Transport>, BusError> {
    let transport: Arc<dyn Transport> = match config {
        TransportConfig::Loopback { reply: None } => Arc::new(LoopbackTransport::echo()),
        TransportConfig::Loopback { reply: Some(reply) } => {
            Arc::new(LoopbackTransport::fixed(reply.clone()))
        }
        TransportConfig::Downstream {
            request_endpoint,
            response_endpoint,
        } => Arc::new(
            DownstreamTransport::connect(
                session.clone(),
                request_endpoint,
                response_endpoint,
                policy,
            )
            .await?,
        ),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tagged(&'static str);

    #[async_trait]
    impl Transport for Tagged {
        async fn handle(
            &self,
            _tid: Tid,
            _mode: &Mode,
            _data: Payload,
        ) -> Result<Payload, TransportError> {
            Ok(Payload::Value(json!(self.0)))
        }
    }

    #[tokio::test]
    async fn test_router_dispatches_by_mode() {
        let router = ModeRouter::new()
            .route(Mode::Tcp, Arc::new(Tagged("tcp-link")))
            .route(Mode::Rtu, Arc::new(Tagged("serial-link")));

        let out = router.handle(Tid(1), &Mode::Rtu, Payload::default()).await.unwrap();
        assert_eq!(out, Payload::Value(json!("serial-link")));

        let out = router.handle(Tid(2), &Mode::Tcp, Payload::default()).await.unwrap();
        assert_eq!(out, Payload::Value(json!("tcp-link")));

        assert_eq!(router.modes(), vec![Mode::Rtu, Mode::Tcp]);
    }

    #[tokio::test]
    async fn test_router_without_route_fails() {
        let router = ModeRouter::new().route(Mode::Tcp, Arc::new(Tagged("tcp-link")));

        let err = router
            .handle(Tid(3), &Mode::Ascii, Payload::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "handler_failure");
        assert!(err.to_string().contains("ascii"));
    }

    #[tokio::test]
    async fn test_router_fallback() {
        let router = ModeRouter::new()
            .route(Mode::Tcp, Arc::new(Tagged("tcp-link")))
            .fallback(Arc::new(Tagged("default")));

        let out = router
            .handle(Tid(4), &Mode::Other("rtu-over-tcp".to_string()), Payload::default())
            .await
            .unwrap();
        assert_eq!(out, Payload::Value(json!("default")));
    }

    #[test]
    fn test_timeout_message() {
        let err = TransportError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "no response within 250ms");
        assert_eq!(err.kind(), "timeout");
    }
}
