//! Bridge counters and the periodic health report.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use modgate_bridge_framework::Publisher;
use modgate_common::keyexpr;

use crate::bridge::{Bridge, stopped};
use crate::correlation::CorrelationSnapshot;

/// Lifetime request counters.
///
/// `responded_*` count responses actually published, rejections included;
/// a response the sink refused counts as a `publish_failures` instead.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub received: AtomicU64,
    pub accepted: AtomicU64,
    pub responded_ok: AtomicU64,
    pub responded_error: AtomicU64,
    pub rejected: AtomicU64,
    pub dropped: AtomicU64,
    pub timeouts: AtomicU64,
    pub handler_failures: AtomicU64,
    pub cancelled: AtomicU64,
    pub expired: AtomicU64,
    pub publish_failures: AtomicU64,
}

impl BridgeStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            responded_ok: self.responded_ok.load(Ordering::Relaxed),
            responded_error: self.responded_error.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub accepted: u64,
    pub responded_ok: u64,
    pub responded_error: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub timeouts: u64,
    pub handler_failures: u64,
    pub cancelled: u64,
    pub expired: u64,
    pub publish_failures: u64,
}

impl StatsSnapshot {
    /// Failures of any kind: bad frames, failed calls, lost publishes.
    pub fn failures(&self) -> u64 {
        self.dropped
            + self.rejected
            + self.timeouts
            + self.handler_failures
            + self.expired
            + self.publish_failures
    }
}

/// Health document published under `<key_prefix>/@/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub bridge: String,
    /// `healthy`, or `degraded` if anything failed since the last report.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Millis since epoch.
    pub timestamp: i64,
    pub requests: StatsSnapshot,
    pub correlation: CorrelationSnapshot,
}

impl HealthReport {
    fn build(
        bridge: &str,
        uptime: Duration,
        requests: StatsSnapshot,
        correlation: CorrelationSnapshot,
        previous: Option<&StatsSnapshot>,
    ) -> Self {
        let failed_since = requests
            .failures()
            .saturating_sub(previous.map_or(0, StatsSnapshot::failures));
        Self {
            bridge: bridge.to_string(),
            status: if failed_since == 0 { "healthy" } else { "degraded" },
            uptime_secs: uptime.as_secs(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            requests,
            correlation,
        }
    }
}

/// Publishes a [`HealthReport`] on a fixed interval until shutdown.
pub struct HealthReporter {
    name: String,
    bridge: Arc<Bridge>,
    publisher: Publisher,
    interval: Duration,
}

impl HealthReporter {
    /// `publisher` must be rooted at the bridge key prefix.
    pub fn new(
        name: impl Into<String>,
        bridge: Arc<Bridge>,
        publisher: Publisher,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            bridge,
            publisher,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let key = keyexpr::health_key(self.publisher.key_prefix());
        let started = Instant::now();
        let mut previous: Option<StatsSnapshot> = None;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let requests = self.bridge.stats().snapshot();
                    let report = HealthReport::build(
                        &self.name,
                        started.elapsed(),
                        requests,
                        self.bridge.table().snapshot(),
                        previous.as_ref(),
                    );
                    previous = Some(requests);

                    match self.publisher.publish_json(&key, &report).await {
                        Ok(()) => debug!(key = %key, status = report.status, "Published health"),
                        Err(e) => warn!(key = %key, error = %e, "Failed to publish health"),
                    }
                }
                _ = stopped(&mut shutdown) => break,
            }
        }
    }
}
