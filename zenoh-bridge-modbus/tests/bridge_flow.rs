//! Serve-loop tests over in-process channels.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

use zenoh_bridge_modbus::transport::LoopbackTransport;
use zenoh_bridge_modbus::{
    Bridge, BridgeOptions, FrameCodec, Mode, Payload, RawFrame, Status, Tid, Transport,
    TransportError,
};

/// Answers after `delay`, with the request's tid in the reply.
struct Delayed(Duration);

#[async_trait]
impl Transport for Delayed {
    async fn handle(
        &self,
        tid: Tid,
        mode: &Mode,
        _data: Payload,
    ) -> Result<Payload, TransportError> {
        tokio::time::sleep(self.0).await;
        Ok(Payload::Value(json!({"tid": tid, "mode": mode.as_str()})))
    }
}

struct Harness {
    bridge: Arc<Bridge>,
    requests: mpsc::UnboundedSender<RawFrame>,
    responses: mpsc::UnboundedReceiver<RawFrame>,
    shutdown: watch::Sender<bool>,
    serving: tokio::task::JoinHandle<()>,
}

fn start(transport: impl Transport + 'static, request_timeout: Duration) -> Harness {
    let bridge = Arc::new(Bridge::new(
        Arc::new(transport),
        BridgeOptions {
            request_timeout,
            pending_ttl: request_timeout * 2,
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        },
    ));

    let (requests, inbound) = mpsc::unbounded_channel();
    let (outbound, responses) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = watch::channel(false);

    let serving = tokio::spawn(bridge.clone().serve(inbound, Arc::new(outbound), shutdown_rx));

    Harness {
        bridge,
        requests,
        responses,
        shutdown,
        serving,
    }
}

fn send(harness: &Harness, mode: &str, body: Value) {
    harness
        .requests
        .send(RawFrame::new(mode, body.to_string().into_bytes()))
        .unwrap();
}

async fn next_response(harness: &mut Harness) -> zenoh_bridge_modbus::Frame {
    let raw = tokio::time::timeout(Duration::from_secs(2), harness.responses.recv())
        .await
        .expect("timed out waiting for a response")
        .expect("response channel closed");
    FrameCodec::default().decode(&raw).unwrap()
}

#[tokio::test]
async fn test_request_answered_once() {
    let mut harness = start(
        LoopbackTransport::fixed(json!({"registers": [17]})),
        Duration::from_secs(1),
    );

    send(&harness, "tcp", json!({"tid": 1, "data": "X"}));

    let response = next_response(&mut harness).await;
    assert_eq!(response.tid, Tid(1));
    assert_eq!(response.mode, Mode::Tcp);
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.data, Payload::Value(json!({"registers": [17]})));

    drop(harness.requests);
    harness.serving.await.unwrap();
    assert!(harness.responses.recv().await.is_none());
}

#[tokio::test]
async fn test_malformed_frame_dropped_and_serving_continues() {
    let mut harness = start(LoopbackTransport::echo(), Duration::from_secs(1));

    send(&harness, "tcp", json!({"data": "no tid"}));
    send(&harness, "rtu", json!({"tid": 2, "data": [1, 2]}));

    // Only the second frame is answered.
    let response = next_response(&mut harness).await;
    assert_eq!(response.tid, Tid(2));
    assert_eq!(response.data, Payload::Value(json!([1, 2])));

    let stats = harness.bridge.stats().snapshot();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.received, 2);
}

#[tokio::test]
async fn test_duplicate_rejected_before_first_completes() {
    let mut harness = start(Delayed(Duration::from_millis(100)), Duration::from_secs(1));

    send(&harness, "tcp", json!({"tid": 3}));
    send(&harness, "tcp", json!({"tid": 3}));

    let first = next_response(&mut harness).await;
    assert_eq!(first.tid, Tid(3));
    assert_eq!(first.status, Status::Error);
    assert_eq!(first.data.to_json()["kind"], "duplicate_tid");

    let second = next_response(&mut harness).await;
    assert_eq!(second.tid, Tid(3));
    assert_eq!(second.status, Status::Ok);
    assert_eq!(second.data.to_json()["mode"], "tcp");
}

#[tokio::test]
async fn test_timeout_answers_once_and_frees_tid() {
    let mut harness = start(Delayed(Duration::from_secs(10)), Duration::from_millis(50));

    send(&harness, "ascii", json!({"tid": 4}));

    let response = next_response(&mut harness).await;
    assert_eq!(response.tid, Tid(4));
    assert_eq!(response.status, Status::Error);
    assert_eq!(response.data.to_json()["kind"], "timeout");
    assert!(!harness.bridge.table().is_pending(Tid(4)));

    // Reused tid is accepted, and times out on its own.
    send(&harness, "ascii", json!({"tid": 4}));
    let again = next_response(&mut harness).await;
    assert_eq!(again.data.to_json()["kind"], "timeout");

    // Nothing else was published for it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.responses.try_recv().is_err());
    assert_eq!(harness.bridge.stats().snapshot().timeouts, 2);
}

#[tokio::test]
async fn test_cancelled_request_gets_no_response() {
    let mut harness = start(Delayed(Duration::from_millis(50)), Duration::from_secs(1));

    send(&harness, "tcp", json!({"tid": 5}));
    send(&harness, "tcp", json!({"tid": 6}));

    // Wait until both are registered.
    while harness.bridge.table().len() < 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    harness.bridge.cancel(Tid(5)).unwrap();

    let response = next_response(&mut harness).await;
    assert_eq!(response.tid, Tid(6));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.responses.try_recv().is_err());
}

#[tokio::test]
async fn test_shutdown_aborts_in_flight() {
    let mut harness = start(Delayed(Duration::from_secs(10)), Duration::from_secs(30));

    send(&harness, "rtu", json!({"tid": 7}));
    while harness.bridge.table().is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    harness.shutdown.send_replace(true);
    tokio::time::timeout(Duration::from_secs(1), &mut harness.serving)
        .await
        .expect("serve did not stop")
        .unwrap();

    assert!(harness.responses.recv().await.is_none());
}

#[tokio::test]
async fn test_response_fed_back_under_nested_key_ends_there() {
    let mut harness = start(LoopbackTransport::echo(), Duration::from_secs(1));

    send(&harness, "tcp", json!({"tid": 50, "data": "X"}));
    let raw = tokio::time::timeout(Duration::from_secs(2), harness.responses.recv())
        .await
        .unwrap()
        .unwrap();

    // What a subscriber on a parent key would see: the mode chunk behind
    // the extra path segment.
    let looped = RawFrame::new(format!("resp/{}", raw.mode), raw.body);
    harness.requests.send(looped).unwrap();

    let quiet = tokio::time::timeout(Duration::from_millis(100), harness.responses.recv()).await;
    assert!(quiet.is_err(), "nothing may be published for a looped response");

    let stats = harness.bridge.stats().snapshot();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.rejected, 0);
}
