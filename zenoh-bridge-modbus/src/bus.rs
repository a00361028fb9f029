//! Bus channel: where raw frames come from and go to.
//!
//! On Zenoh, the mode tag is the key chunk right below an endpoint and the
//! body is the sample payload:
//!
//! ```text
//! inbound:   subscribe <inbound_endpoint>/**     e.g. modgate/modbus/request/tcp
//! outbound:  put       <outbound_endpoint>/<mode> e.g. modgate/modbus/response/tcp
//! ```
//!
//! [`FrameSource`] and [`FrameSink`] are the seams the bridge core is written
//! against; tokio channels implement them too, for in-process wiring.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use zenoh::Session;
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::{Sample, SampleKind};

use modgate_bridge_framework::{BridgeError, Publisher};
use modgate_common::keyexpr;

use crate::frame::RawFrame;

/// Bus failures.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,

    #[error("zenoh error: {0}")]
    Zenoh(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl From<zenoh::Error> for BusError {
    fn from(err: zenoh::Error) -> Self {
        Self::Zenoh(err.to_string())
    }
}

/// Something raw frames arrive from, one at a time, in arrival order.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the source is closed for good.
    async fn recv(&mut self) -> Option<RawFrame>;
}

/// Something raw frames can be published to.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn publish(&self, frame: RawFrame) -> Result<(), BusError>;
}

#[async_trait]
impl FrameSource for mpsc::Receiver<RawFrame> {
    async fn recv(&mut self) -> Option<RawFrame> {
        mpsc::Receiver::recv(self).await
    }
}

#[async_trait]
impl FrameSource for mpsc::UnboundedReceiver<RawFrame> {
    async fn recv(&mut self) -> Option<RawFrame> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}

#[async_trait]
impl FrameSink for mpsc::Sender<RawFrame> {
    async fn publish(&self, frame: RawFrame) -> Result<(), BusError> {
        self.send(frame).await.map_err(|_| BusError::Closed)
    }
}

#[async_trait]
impl FrameSink for mpsc::UnboundedSender<RawFrame> {
    async fn publish(&self, frame: RawFrame) -> Result<(), BusError> {
        self.send(frame).map_err(|_| BusError::Closed)
    }
}

/// Inbound half: a subscriber on everything below an endpoint.
pub struct BusInbound {
    endpoint: String,
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
}

impl BusInbound {
    /// Subscribe to `<endpoint>/**`.
    pub async fn declare(session: &Session, endpoint: impl Into<String>) -> Result<Self, BusError> {
        let endpoint = endpoint.into();
        let key_expr = keyexpr::subtree_wildcard(&endpoint);

        let subscriber = session.declare_subscriber(&key_expr).await?;
        info!(key_expr = %key_expr, "Subscribed to inbound frames");

        Ok(Self {
            endpoint,
            subscriber,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Undeclare the subscriber.
    pub async fn close(self) -> Result<(), BusError> {
        self.subscriber.undeclare().await?;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for BusInbound {
    async fn recv(&mut self) -> Option<RawFrame> {
        loop {
            let sample = match self.subscriber.recv_async().await {
                Ok(sample) => sample,
                Err(e) => {
                    debug!(endpoint = %self.endpoint, error = %e, "Inbound subscriber closed");
                    return None;
                }
            };

            if sample.kind() == SampleKind::Delete {
                trace!(key = %sample.key_expr(), "Ignoring delete sample");
                continue;
            }

            let Some(mode) = keyexpr::suffix_under(&self.endpoint, sample.key_expr().as_str())
            else {
                trace!(key = %sample.key_expr(), "Ignoring sample outside endpoint");
                continue;
            };

            return Some(RawFrame {
                mode: mode.to_string(),
                body: sample.payload().to_bytes().into_owned(),
            });
        }
    }
}

/// Outbound half: puts each frame at `<endpoint>/<mode>`.
#[derive(Clone, Debug)]
pub struct BusOutbound {
    publisher: Publisher,
}

impl BusOutbound {
    pub fn new(session: Arc<Session>, endpoint: impl Into<String>) -> Self {
        Self {
            publisher: Publisher::new(session, endpoint),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.publisher.key_prefix()
    }
}

#[async_trait]
impl FrameSink for BusOutbound {
    async fn publish(&self, frame: RawFrame) -> Result<(), BusError> {
        self.publisher.publish(&frame.mode, frame.body).await?;
        Ok(())
    }
}

/// Both halves of the bridge's bus connection.
///
/// Opened explicitly from a session and closed explicitly; nothing here is
/// process-global.
pub struct BusChannel {
    inbound: BusInbound,
    outbound: Arc<BusOutbound>,
}

impl BusChannel {
    pub async fn open(
        session: Arc<Session>,
        inbound_endpoint: &str,
        outbound_endpoint: &str,
    ) -> Result<Self, BusError> {
        let inbound = BusInbound::declare(&session, inbound_endpoint).await?;
        let outbound = Arc::new(BusOutbound::new(session, outbound_endpoint));

        Ok(Self { inbound, outbound })
    }

    pub fn inbound(&self) -> &BusInbound {
        &self.inbound
    }

    pub fn outbound(&self) -> &Arc<BusOutbound> {
        &self.outbound
    }

    /// Hand the halves to a serve loop.
    pub fn split(self) -> (BusInbound, Arc<BusOutbound>) {
        (self.inbound, self.outbound)
    }

    pub async fn close(self) -> Result<(), BusError> {
        self.inbound.close().await
    }
}
