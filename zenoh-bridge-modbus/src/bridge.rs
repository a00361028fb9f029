//! Bridge core: turns each inbound request frame into at most one response.
//!
//! A request moves `RECEIVED -> REGISTERED -> RESPONDED`, or straight to
//! `REJECTED` when it cannot be decoded or its tid is already in flight.
//!
//! Admission (decode + register) is synchronous and runs in arrival order.
//! The transport call that follows may take up to the request timeout, so
//! [`Bridge::serve`] runs it in its own task; that keeps duplicate tids
//! rejected immediately instead of queued behind the first request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bus::{FrameSink, FrameSource};
use crate::correlation::{CorrelationError, CorrelationTable, PendingRequest};
use crate::frame::{Frame, FrameCodec, FrameError, Mode, ModePolicy, RawFrame, Tid, is_key_safe};
use crate::stats::BridgeStats;
use crate::transport::{Transport, TransportError};

/// Floor applied to timeouts changed at runtime.
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(200);

/// Tunables for a [`Bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Upper bound on a single transport call.
    pub request_timeout: Duration,
    /// Age after which a pending entry is evicted by the sweep.
    pub pending_ttl: Duration,
    /// How often [`Bridge::serve`] sweeps the table.
    pub sweep_interval: Duration,
    pub mode_policy: ModePolicy,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(3000),
            pending_ttl: Duration::from_millis(6000),
            sweep_interval: Duration::from_millis(1000),
            mode_policy: ModePolicy::Strict,
        }
    }
}

/// A registered request waiting for its transport call.
#[derive(Debug)]
pub struct Accepted {
    frame: Frame,
}

impl Accepted {
    pub fn tid(&self) -> Tid {
        self.frame.tid
    }

    pub fn mode(&self) -> &Mode {
        &self.frame.mode
    }
}

/// What admission made of an inbound frame.
#[derive(Debug)]
pub enum Admission {
    /// Registered; hand it to [`Bridge::execute`].
    Accepted(Accepted),
    /// Refused with this error response, to be published as is.
    Rejected(Frame),
    /// Refused with no tid or no usable mode to answer on.
    Dropped(FrameError),
}

/// Request/response bridge between the bus and a [`Transport`].
pub struct Bridge {
    codec: FrameCodec,
    table: CorrelationTable,
    transport: Arc<dyn Transport>,
    stats: BridgeStats,
    /// Millis; adjustable while serving.
    request_timeout_ms: AtomicU64,
    sweep_interval: Duration,
}

impl Bridge {
    pub fn new(transport: Arc<dyn Transport>, options: BridgeOptions) -> Self {
        Self {
            codec: FrameCodec::new(options.mode_policy),
            table: CorrelationTable::new(options.pending_ttl),
            transport,
            stats: BridgeStats::default(),
            request_timeout_ms: AtomicU64::new(millis(options.request_timeout)),
            sweep_interval: options.sweep_interval,
        }
    }

    pub fn table(&self) -> &CorrelationTable {
        &self.table
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn mode_policy(&self) -> ModePolicy {
        self.codec.policy()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the timeout for calls started from now on.
    ///
    /// The value is clamped to [`MIN_REQUEST_TIMEOUT`] and to the pending
    /// TTL, so the sweep never evicts a call that is still allowed to run.
    /// Returns the timeout actually applied.
    pub fn set_request_timeout(&self, timeout: Duration) -> Duration {
        let applied = timeout
            .max(MIN_REQUEST_TIMEOUT)
            .min(self.table.ttl().max(MIN_REQUEST_TIMEOUT));
        let previous = self.request_timeout_ms.swap(millis(applied), Ordering::Relaxed);
        info!(
            previous_ms = previous,
            timeout_ms = millis(applied),
            "Request timeout changed"
        );
        applied
    }

    /// Decode and register one inbound frame.
    pub fn admit(&self, raw: &RawFrame) -> Admission {
        BridgeStats::incr(&self.stats.received);

        let frame = match self.codec.decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                let Some(tid) = e.tid() else {
                    BridgeStats::incr(&self.stats.dropped);
                    warn!(mode = %raw.mode, error = %e, "Dropping frame without a usable tid");
                    return Admission::Dropped(e);
                };

                let Some(mode) = self.reply_mode(&raw.mode) else {
                    BridgeStats::incr(&self.stats.dropped);
                    warn!(
                        %tid,
                        mode = %raw.mode,
                        error = %e,
                        "Dropping frame with no key-safe mode to answer on"
                    );
                    return Admission::Dropped(e);
                };

                BridgeStats::incr(&self.stats.rejected);
                warn!(%tid, mode = %raw.mode, error = %e, "Rejecting undecodable frame");
                return Admission::Rejected(Frame::error(mode, tid, e.kind(), e.to_string()));
            }
        };

        self.register(frame)
    }

    /// Register a frame built in-process, such as a scheduled poll.
    pub fn admit_frame(&self, frame: Frame) -> Admission {
        BridgeStats::incr(&self.stats.received);
        self.register(frame)
    }

    fn register(&self, frame: Frame) -> Admission {
        if let Err(e) = self.table.register(frame.tid, frame.mode.clone()) {
            BridgeStats::incr(&self.stats.rejected);
            warn!(tid = %frame.tid, mode = %frame.mode, "Rejecting duplicate transaction");
            return Admission::Rejected(Frame::error(
                frame.mode,
                frame.tid,
                e.kind(),
                e.to_string(),
            ));
        }

        BridgeStats::incr(&self.stats.accepted);
        debug!(tid = %frame.tid, mode = %frame.mode, "Accepted request");
        Admission::Accepted(Accepted { frame })
    }

    /// Run the transport call for an accepted request and build its
    /// response.
    ///
    /// Returns `None` if the request was cancelled or swept while the call
    /// was running; nothing may be published for it then.
    pub async fn execute(&self, accepted: Accepted) -> Option<Frame> {
        let Frame { mode, tid, data, .. } = accepted.frame;
        let timeout = self.request_timeout();

        let outcome =
            match tokio::time::timeout(timeout, self.transport.handle(tid, &mode, data)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };

        if self.table.complete(tid).is_err() {
            debug!(%tid, "Request abandoned while in flight; suppressing response");
            return None;
        }

        match outcome {
            Ok(data) => Some(Frame::ok(mode, tid, data)),
            Err(e) => {
                match e {
                    TransportError::Timeout(_) => BridgeStats::incr(&self.stats.timeouts),
                    TransportError::HandlerFailure(_) => {
                        BridgeStats::incr(&self.stats.handler_failures)
                    }
                }
                warn!(%tid, %mode, error = %e, "Request failed");
                Some(Frame::error(mode, tid, e.kind(), e.to_string()))
            }
        }
    }

    /// Admit and execute one frame in a single step.
    pub async fn on_request(&self, raw: &RawFrame) -> Option<Frame> {
        match self.admit(raw) {
            Admission::Accepted(accepted) => self.execute(accepted).await,
            Admission::Rejected(response) => Some(response),
            Admission::Dropped(_) => None,
        }
    }

    /// Give up on a pending request. No response will be published for it.
    pub fn cancel(&self, tid: Tid) -> Result<PendingRequest, CorrelationError> {
        let pending = self.table.cancel(tid)?;
        BridgeStats::incr(&self.stats.cancelled);
        info!(%tid, "Cancelled request");
        Ok(pending)
    }

    /// Evict pending entries older than the TTL.
    pub fn sweep(&self) -> Vec<PendingRequest> {
        let expired = self.table.sweep_expired(Instant::now());
        self.stats
            .expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
    }

    /// Serve frames from `source` until it closes or `shutdown` turns true.
    ///
    /// When the source closes, in-flight requests are allowed to finish.
    /// On shutdown they are aborted.
    pub async fn serve<S, K>(
        self: Arc<Self>,
        mut source: S,
        sink: Arc<K>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: FrameSource + 'static,
        K: FrameSink + ?Sized + 'static,
    {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Bridge serving");

        loop {
            tokio::select! {
                biased;

                _ = stopped(&mut shutdown) => {
                    info!(in_flight = in_flight.len(), "Shutdown; aborting in-flight requests");
                    in_flight.abort_all();
                    return;
                }

                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(done);
                }

                _ = sweep.tick() => {
                    self.sweep();
                }

                next = source.recv() => {
                    let Some(raw) = next else {
                        info!(in_flight = in_flight.len(), "Inbound closed; draining");
                        break;
                    };

                    match self.admit(&raw) {
                        Admission::Accepted(accepted) => {
                            let bridge = self.clone();
                            let sink = sink.clone();
                            in_flight.spawn(async move {
                                if let Some(response) = bridge.execute(accepted).await {
                                    bridge.emit(sink.as_ref(), response).await;
                                }
                            });
                        }
                        Admission::Rejected(response) => self.emit(sink.as_ref(), response).await,
                        Admission::Dropped(_) => {}
                    }
                }
            }
        }

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => {
                    in_flight.abort_all();
                    break;
                }
                next = in_flight.join_next() => match next {
                    Some(done) => log_join(done),
                    None => break,
                },
            }
        }

        info!("Bridge stopped");
    }

    async fn emit<K: FrameSink + ?Sized>(&self, sink: &K, response: Frame) {
        let tid = response.tid;
        let ok = response.is_ok();

        match sink.publish(FrameCodec::encode(&response)).await {
            Ok(()) => {
                if ok {
                    BridgeStats::incr(&self.stats.responded_ok);
                } else {
                    BridgeStats::incr(&self.stats.responded_error);
                }
                debug!(%tid, ok, "Published response");
            }
            Err(e) => {
                BridgeStats::incr(&self.stats.publish_failures);
                error!(%tid, error = %e, "Failed to publish response");
            }
        }
    }

    /// Mode to answer an undecodable frame on. An unrecognised tag is
    /// echoed back so the caller sees the reply where it listens, but only
    /// if it is a single key-safe chunk.
    fn reply_mode(&self, tag: &str) -> Option<Mode> {
        Mode::parse(tag, self.codec.policy())
            .or_else(|| is_key_safe(tag).then(|| Mode::Other(tag.to_string())))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub(crate) fn log_join(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            error!(error = %e, "Request task panicked");
        }
    }
}
