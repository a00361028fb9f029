//! Named polls: requests the bridge issues to itself on a fixed interval.
//!
//! A poll owns one mode tag and one request payload. When it comes due the
//! scheduler builds a request frame with a fresh tid and sends it through
//! [`Bridge::admit_frame`] and [`Bridge::execute`], exactly like a request
//! that arrived on the bus. The outcome is kept in a bounded history and
//! published as a [`PollRecord`]:
//!
//! ```text
//! <poll_endpoint>/<name>    {"name", "tid", "timestamp", "status", "data"}
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bridge::{Admission, Bridge, log_join, stopped};
use crate::bus::FrameSink;
use crate::frame::{Frame, Mode, ModePolicy, RawFrame, Status, Tid, is_key_safe};

/// Shortest interval a poll may run at. Shorter ones are raised to it.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll tids count up from here, far from anything a caller picks.
const POLL_TID_BASE: i64 = i64::MIN;

const DEFAULT_RESOLUTION: Duration = Duration::from_millis(100);

/// Poll definition, as found in the config file and in exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollTask {
    /// Unique, key-safe name; also the key chunk results are published on
    pub name: String,

    /// Mode tag the request is sent with
    pub mode: String,

    /// Time between two requests (default: 1000, minimum: 1000)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Disabled polls keep their place but are not run
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Request payload
    #[serde(default)]
    pub data: Value,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_enabled() -> bool {
    true
}

impl PollTask {
    pub fn new(name: impl Into<String>, mode: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            mode: mode.into(),
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            enabled: true,
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms).max(MIN_POLL_INTERVAL)
    }

    /// Check the name and resolve the mode tag under `policy`.
    pub fn check(&self, policy: ModePolicy) -> Result<Mode, PollError> {
        if !is_key_safe(&self.name) {
            return Err(PollError::InvalidName(self.name.clone()));
        }
        Mode::parse(&self.mode, policy).ok_or_else(|| PollError::UnknownMode {
            name: self.name.clone(),
            mode: self.mode.clone(),
        })
    }
}

/// Poll management failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("invalid poll name '{0}'")]
    InvalidName(String),

    #[error("poll '{0}' already exists")]
    Duplicate(String),

    #[error("unknown poll '{0}'")]
    UnknownPoll(String),

    #[error("poll '{name}': mode '{mode}' is not accepted")]
    UnknownMode { name: String, mode: String },

    #[error("invalid poll list: {0}")]
    Codec(String),
}

/// Outcome of one poll run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRecord {
    pub name: String,
    pub tid: Tid,
    /// Millis since epoch.
    pub timestamp: i64,
    pub status: Status,
    pub data: Value,
}

/// Most recent records per poll, oldest dropped first.
#[derive(Debug)]
pub struct PollHistory {
    capacity: usize,
    records: DashMap<String, VecDeque<PollRecord>>,
}

impl PollHistory {
    /// A capacity of 0 keeps nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: DashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(&self, record: PollRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut kept = self.records.entry(record.name.clone()).or_default();
        while kept.len() >= self.capacity {
            kept.pop_front();
        }
        kept.push_back(record);
    }

    /// Up to `limit` records for `name`, newest first.
    pub fn get(&self, name: &str, limit: usize) -> Vec<PollRecord> {
        self.records
            .get(name)
            .map(|kept| kept.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn all(&self, name: &str) -> Vec<PollRecord> {
        self.get(name, usize::MAX)
    }

    pub fn latest(&self, name: &str) -> Option<PollRecord> {
        self.records.get(name).and_then(|kept| kept.back().cloned())
    }

    pub fn forget(&self, name: &str) {
        self.records.remove(name);
    }
}

#[derive(Debug)]
struct PollEntry {
    task: PollTask,
    mode: Mode,
    next_due: Instant,
    /// Handed out by [`PollScheduler::due`] and not finished yet.
    running: bool,
}

/// Keeps the poll table and runs due polls through the bridge.
pub struct PollScheduler {
    bridge: Arc<Bridge>,
    sink: Arc<dyn FrameSink>,
    polls: DashMap<String, PollEntry>,
    /// Poll name to the tid of its request in flight.
    in_flight: DashMap<String, Tid>,
    next_tid: AtomicI64,
    history: PollHistory,
    resolution: Duration,
}

impl PollScheduler {
    /// `sink` receives one frame per result, tagged with the poll name.
    pub fn new(bridge: Arc<Bridge>, sink: Arc<dyn FrameSink>, history_size: usize) -> Self {
        Self {
            bridge,
            sink,
            polls: DashMap::new(),
            in_flight: DashMap::new(),
            next_tid: AtomicI64::new(POLL_TID_BASE),
            history: PollHistory::new(history_size),
            resolution: DEFAULT_RESOLUTION,
        }
    }

    /// How often [`run`](Self::run) looks for due polls.
    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn history(&self) -> &PollHistory {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    /// Add a poll. An enabled poll first runs on the next check.
    pub fn create(&self, task: PollTask) -> Result<(), PollError> {
        let mode = task.check(self.bridge.mode_policy())?;

        match self.polls.entry(task.name.clone()) {
            Entry::Occupied(_) => Err(PollError::Duplicate(task.name)),
            Entry::Vacant(slot) => {
                if task.interval_ms < MIN_POLL_INTERVAL.as_millis() as u64 {
                    warn!(
                        poll = %task.name,
                        interval_ms = task.interval_ms,
                        "Poll interval raised to the minimum"
                    );
                }
                info!(poll = %task.name, %mode, interval = ?task.interval(), "Created poll");
                slot.insert(PollEntry {
                    task,
                    mode,
                    next_due: Instant::now(),
                    running: false,
                });
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<PollTask> {
        self.polls.get(name).map(|entry| entry.task.clone())
    }

    /// All polls, sorted by name.
    pub fn list(&self) -> Vec<PollTask> {
        let mut tasks: Vec<PollTask> = self.polls.iter().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    /// Change the interval and restart the countdown. Returns the interval
    /// actually applied.
    pub fn update_interval(&self, name: &str, interval: Duration) -> Result<Duration, PollError> {
        let mut entry = self
            .polls
            .get_mut(name)
            .ok_or_else(|| PollError::UnknownPoll(name.to_string()))?;

        entry.task.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        let applied = entry.task.interval();
        entry.next_due = Instant::now() + applied;
        debug!(poll = %name, interval = ?applied, "Updated poll interval");
        Ok(applied)
    }

    pub fn toggle(&self, name: &str, enabled: bool) -> Result<(), PollError> {
        let mut entry = self
            .polls
            .get_mut(name)
            .ok_or_else(|| PollError::UnknownPoll(name.to_string()))?;

        if enabled && !entry.task.enabled {
            entry.next_due = Instant::now();
        }
        entry.task.enabled = enabled;
        debug!(poll = %name, enabled, "Toggled poll");
        Ok(())
    }

    pub fn toggle_all(&self, enabled: bool) {
        let now = Instant::now();
        for mut entry in self.polls.iter_mut() {
            if enabled && !entry.task.enabled {
                entry.next_due = now;
            }
            entry.task.enabled = enabled;
        }
        info!(enabled, polls = self.polls.len(), "Toggled all polls");
    }

    /// Remove a poll. A request it has in flight is cancelled, so no result
    /// is recorded for it. History is kept.
    pub fn delete(&self, name: &str) -> Result<PollTask, PollError> {
        let (_, entry) = self
            .polls
            .remove(name)
            .ok_or_else(|| PollError::UnknownPoll(name.to_string()))?;

        if let Some((_, tid)) = self.in_flight.remove(name) {
            if let Err(e) = self.bridge.cancel(tid) {
                debug!(poll = %name, %tid, error = %e, "Poll request already finished");
            }
        }
        info!(poll = %name, "Deleted poll");
        Ok(entry.task)
    }

    /// Remove every poll. Returns how many there were.
    pub fn delete_all(&self) -> usize {
        let names: Vec<String> = self.polls.iter().map(|e| e.key().clone()).collect();
        names
            .iter()
            .filter(|name| self.delete(name).is_ok())
            .count()
    }

    /// Add a batch of polls. Nothing is added unless every one is valid and
    /// its name is free.
    pub fn import(&self, tasks: Vec<PollTask>) -> Result<usize, PollError> {
        let policy = self.bridge.mode_policy();
        let mut names = HashSet::with_capacity(tasks.len());
        for task in &tasks {
            task.check(policy)?;
            if !names.insert(task.name.as_str()) || self.polls.contains_key(&task.name) {
                return Err(PollError::Duplicate(task.name.clone()));
            }
        }

        let count = tasks.len();
        for task in tasks {
            self.create(task)?;
        }
        Ok(count)
    }

    pub fn import_json(&self, json: &str) -> Result<usize, PollError> {
        let tasks: Vec<PollTask> =
            serde_json::from_str(json).map_err(|e| PollError::Codec(e.to_string()))?;
        self.import(tasks)
    }

    pub fn export_json(&self) -> Result<String, PollError> {
        serde_json::to_string_pretty(&self.list()).map_err(|e| PollError::Codec(e.to_string()))
    }

    /// Tid of the request `name` has in flight, if any.
    pub fn in_flight(&self, name: &str) -> Option<Tid> {
        self.in_flight.get(name).map(|tid| *tid)
    }

    /// Names of enabled polls due at `now` that are not already running.
    /// Each one is marked running and rescheduled one interval later.
    pub fn due(&self, now: Instant) -> Vec<String> {
        let mut names = Vec::new();
        for mut entry in self.polls.iter_mut() {
            if entry.task.enabled && !entry.running && entry.next_due <= now {
                entry.running = true;
                entry.next_due = now + entry.task.interval();
                names.push(entry.key().clone());
            }
        }
        names.sort();
        names
    }

    /// Run `name` once and publish its result.
    ///
    /// Returns `None` for an unknown poll, or if the request was cancelled
    /// or swept before it finished.
    pub async fn poll_once(&self, name: &str) -> Option<PollRecord> {
        let record = self.request(name).await;

        if let Some(mut entry) = self.polls.get_mut(name) {
            entry.running = false;
        }

        let record = record?;
        self.history.record(record.clone());
        self.publish(&record).await;
        Some(record)
    }

    async fn request(&self, name: &str) -> Option<PollRecord> {
        let (mode, data) = {
            let entry = self.polls.get(name)?;
            (entry.mode.clone(), entry.task.data.clone())
        };
        let tid = Tid(self.next_tid.fetch_add(1, Ordering::Relaxed));

        let response = match self.bridge.admit_frame(Frame::ok(mode, tid, data)) {
            Admission::Accepted(accepted) => {
                self.in_flight.insert(name.to_string(), tid);
                let response = self.bridge.execute(accepted).await;
                self.in_flight.remove_if(name, |_, current| *current == tid);
                response?
            }
            Admission::Rejected(response) => response,
            Admission::Dropped(_) => return None,
        };

        if !response.is_ok() {
            warn!(poll = %name, %tid, "Poll request failed");
        }

        Some(PollRecord {
            name: name.to_string(),
            tid,
            timestamp: chrono::Utc::now().timestamp_millis(),
            status: response.status,
            data: response.data.to_json(),
        })
    }

    async fn publish(&self, record: &PollRecord) {
        let body = match serde_json::to_vec(record) {
            Ok(body) => body,
            Err(e) => {
                warn!(poll = %record.name, error = %e, "Failed to encode poll record");
                return;
            }
        };

        match self.sink.publish(RawFrame::new(record.name.as_str(), body)).await {
            Ok(()) => debug!(poll = %record.name, tid = %record.tid, "Published poll result"),
            Err(e) => warn!(poll = %record.name, error = %e, "Failed to publish poll result"),
        }
    }

    /// Fire due polls until `shutdown` turns true. Polls running at that
    /// point are aborted.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut running: JoinSet<()> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.resolution);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(polls = self.polls.len(), "Poll scheduler started");

        loop {
            tokio::select! {
                biased;

                _ = stopped(&mut shutdown) => {
                    running.abort_all();
                    break;
                }

                Some(done) = running.join_next(), if !running.is_empty() => {
                    log_join(done);
                }

                _ = ticker.tick() => {
                    for name in self.due(Instant::now()) {
                        let scheduler = self.clone();
                        running.spawn(async move {
                            scheduler.poll_once(&name).await;
                        });
                    }
                }
            }
        }

        info!("Poll scheduler stopped");
    }
}
