use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use super::{Transport, TransportError};
use crate::frame::{Mode, Payload, Tid};

/// Answers every request in-process, without touching a device.
///
/// With no fixed reply it echoes the request payload back; with one it
/// answers every request with that value, like a canned test device.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    reply: Option<Value>,
}

impl LoopbackTransport {
    /// Echo each request payload.
    pub fn echo() -> Self {
        Self { reply: None }
    }

    /// Answer every request with `reply`.
    pub fn fixed(reply: Value) -> Self {
        Self { reply: Some(reply) }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn handle(
        &self,
        tid: Tid,
        mode: &Mode,
        data: Payload,
    ) -> Result<Payload, TransportError> {
        trace!(%tid, %mode, "Loopback reply");
        Ok(match &self.reply {
            Some(reply) => Payload::Value(reply.clone()),
            None => data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo() {
        let transport = LoopbackTransport::echo();
        let out = transport
            .handle(Tid(1), &Mode::Tcp, Payload::Bytes(vec![1, 3, 0, 0, 0, 2]))
            .await
            .unwrap();
        assert_eq!(out, Payload::Bytes(vec![1, 3, 0, 0, 0, 2]));
    }

    #[tokio::test]
    async fn test_fixed_reply_ignores_request() {
        let transport = LoopbackTransport::fixed(json!({"data": [1, 2, 3, 4, 5]}));
        let out = transport
            .handle(Tid(2), &Mode::Rtu, Payload::Value(json!("anything")))
            .await
            .unwrap();
        assert_eq!(out, Payload::Value(json!({"data": [1, 2, 3, 4, 5]})));
    }
}
