use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use zenoh::Session;

use super::{Transport, TransportError};
use crate::bus::{BusError, BusInbound, BusOutbound, FrameSink, FrameSource};
use crate::frame::{Frame, FrameCodec, Mode, ModePolicy, Payload, RawFrame, Status, Tid};

/// Replies awaited from the downstream device daemon, by tid.
#[derive(Debug)]
struct Waiters {
    pending: DashMap<Tid, oneshot::Sender<Frame>>,
    codec: FrameCodec,
}

impl Waiters {
    fn deliver(&self, raw: &RawFrame) -> bool {
        let frame = match self.codec.decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(mode = %raw.mode, error = %e, "Undecodable downstream reply");
                return false;
            }
        };

        let Some((tid, waiter)) = self.pending.remove(&frame.tid) else {
            debug!(tid = %frame.tid, "Downstream reply with no waiter (late or unsolicited)");
            return false;
        };

        // Fails only if the waiting call was dropped between remove and send.
        if waiter.send(frame).is_err() {
            debug!(%tid, "Downstream waiter went away");
            return false;
        }
        true
    }
}

/// Removes a waiter when the awaiting call ends, however it ends.
struct WaiterGuard<'a> {
    waiters: &'a Waiters,
    tid: Tid,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.pending.remove(&self.tid);
    }
}

/// Forwards requests to a device daemon over the bus and waits for its
/// reply with the same tid.
///
/// Requests go out as frames on a request endpoint; replies are matched by
/// tid from a response endpoint. A reply with `status: "error"` becomes a
/// [`TransportError::HandlerFailure`].
pub struct DownstreamTransport {
    sink: Arc<dyn FrameSink>,
    waiters: Arc<Waiters>,
    listener: Option<AbortHandle>,
}

impl DownstreamTransport {
    /// Build a transport that publishes to `sink`. Replies must be fed in
    /// through [`deliver`](Self::deliver) or a source given to
    /// [`listen`](Self::listen).
    pub fn new(sink: Arc<dyn FrameSink>, policy: ModePolicy) -> Self {
        Self {
            sink,
            waiters: Arc::new(Waiters {
                pending: DashMap::new(),
                codec: FrameCodec::new(policy),
            }),
            listener: None,
        }
    }

    /// Wire the transport to Zenoh request/response endpoints.
    pub async fn connect(
        session: Arc<Session>,
        request_endpoint: &str,
        response_endpoint: &str,
        policy: ModePolicy,
    ) -> Result<Self, BusError> {
        let replies = BusInbound::declare(&session, response_endpoint).await?;
        let requests = Arc::new(BusOutbound::new(session, request_endpoint));

        info!(
            request = %request_endpoint,
            response = %response_endpoint,
            "Downstream transport connected"
        );

        Ok(Self::new(requests, policy).listen(replies))
    }

    /// Spawn a task feeding every frame from `source` into
    /// [`deliver`](Self::deliver). The task stops with the transport.
    pub fn listen<S: FrameSource + 'static>(mut self, mut source: S) -> Self {
        if let Some(previous) = self.listener.take() {
            previous.abort();
        }

        let waiters = self.waiters.clone();
        let handle = tokio::spawn(async move {
            while let Some(raw) = source.recv().await {
                waiters.deliver(&raw);
            }
            debug!("Downstream reply source closed");
        });

        self.listener = Some(handle.abort_handle());
        self
    }

    /// Route one downstream reply to its waiting request.
    ///
    /// Returns `false` if it matched nothing.
    pub fn deliver(&self, raw: &RawFrame) -> bool {
        self.waiters.deliver(raw)
    }

    /// Number of requests awaiting a downstream reply.
    pub fn waiting(&self) -> usize {
        self.waiters.pending.len()
    }
}

impl Drop for DownstreamTransport {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

#[async_trait]
impl Transport for DownstreamTransport {
    async fn handle(
        &self,
        tid: Tid,
        mode: &Mode,
        data: Payload,
    ) -> Result<Payload, TransportError> {
        let (tx, rx) = oneshot::channel();

        match self.waiters.pending.entry(tid) {
            Entry::Occupied(_) => {
                return Err(TransportError::handler(format!(
                    "transaction {} is already awaiting a downstream reply",
                    tid
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let _guard = WaiterGuard {
            waiters: self.waiters.as_ref(),
            tid,
        };

        let request = FrameCodec::encode(&Frame::ok(mode.clone(), tid, data));
        self.sink
            .publish(request)
            .await
            .map_err(|e| TransportError::handler(format!("downstream publish failed: {}", e)))?;

        let reply = rx
            .await
            .map_err(|_| TransportError::handler("downstream reply channel dropped"))?;

        match reply.status {
            Status::Ok => Ok(reply.data),
            Status::Error => Err(TransportError::HandlerFailure(describe_failure(&reply.data))),
        }
    }
}

/// Pull a readable message out of a downstream error payload.
fn describe_failure(data: &Payload) -> String {
    match data {
        Payload::Value(Value::String(message)) => message.clone(),
        Payload::Value(value) => value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        Payload::Bytes(bytes) => format!("downstream error ({} bytes)", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn transport() -> (Arc<DownstreamTransport>, mpsc::UnboundedReceiver<RawFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = DownstreamTransport::new(Arc::new(tx), ModePolicy::Strict);
        (Arc::new(transport), rx)
    }

    fn reply(frame: Frame) -> RawFrame {
        FrameCodec::encode(&frame)
    }

    #[tokio::test]
    async fn test_forwards_and_correlates_reply() {
        let (transport, mut requests) = transport();

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .handle(Tid(10), &Mode::Tcp, Payload::Value(json!({"fc": 3})))
                    .await
            })
        };

        let forwarded = requests.recv().await.unwrap();
        assert_eq!(forwarded.mode, "tcp");
        let forwarded = FrameCodec::default().decode(&forwarded).unwrap();
        assert_eq!(forwarded.tid, Tid(10));
        assert_eq!(forwarded.data, Payload::Value(json!({"fc": 3})));

        assert!(transport.deliver(&reply(Frame::ok(Mode::Tcp, Tid(10), json!([7, 8])))));

        let out = call.await.unwrap().unwrap();
        assert_eq!(out, Payload::Value(json!([7, 8])));
        assert_eq!(transport.waiting(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_is_handler_failure() {
        let (transport, mut requests) = transport();

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .handle(Tid(11), &Mode::Rtu, Payload::default())
                    .await
            })
        };

        requests.recv().await.unwrap();
        transport.deliver(&reply(Frame::error(
            Mode::Rtu,
            Tid(11),
            "device",
            "illegal data address",
        )));

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            TransportError::HandlerFailure("illegal data address".to_string())
        );
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_ignored() {
        let (transport, _requests) = transport();
        assert!(!transport.deliver(&reply(Frame::ok(Mode::Tcp, Tid(99), json!(null)))));
        assert!(!transport.deliver(&RawFrame::new("tcp", b"not json".to_vec())));
    }

    #[tokio::test]
    async fn test_dropped_call_releases_waiter() {
        let (transport, _requests) = transport();

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            transport.handle(Tid(12), &Mode::Tcp, Payload::default()),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(transport.waiting(), 0);

        // A late reply finds nobody.
        assert!(!transport.deliver(&reply(Frame::ok(Mode::Tcp, Tid(12), json!(1)))));
    }

    #[tokio::test]
    async fn test_closed_sink_fails_fast() {
        let (tx, rx) = mpsc::unbounded_channel::<RawFrame>();
        drop(rx);
        let transport = DownstreamTransport::new(Arc::new(tx), ModePolicy::Strict);

        let err = transport
            .handle(Tid(13), &Mode::Ascii, Payload::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "handler_failure");
        assert_eq!(transport.waiting(), 0);
    }

    #[tokio::test]
    async fn test_listen_feeds_replies() {
        let (requests_tx, mut requests) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(
            DownstreamTransport::new(Arc::new(requests_tx), ModePolicy::Strict).listen(replies_rx),
        );

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .handle(Tid(14), &Mode::Tcp, Payload::default())
                    .await
            })
        };

        let forwarded = requests.recv().await.unwrap();
        let mut answer = FrameCodec::default().decode(&forwarded).unwrap();
        answer.data = Payload::Bytes(vec![0x00, 0x2a]);
        replies_tx.send(FrameCodec::encode(&answer)).unwrap();

        let out = call.await.unwrap().unwrap();
        assert_eq!(out, Payload::Bytes(vec![0x00, 0x2a]));
    }

    #[test]
    fn test_describe_failure() {
        assert_eq!(describe_failure(&Payload::Value(json!("boom"))), "boom");
        assert_eq!(
            describe_failure(&Payload::Value(json!({"message": "bad crc"}))),
            "bad crc"
        );
        assert_eq!(describe_failure(&Payload::Value(json!({"code": 4}))), r#"{"code":4}"#);
    }
}
