//! In-flight transaction table.
//!
//! Maps a transaction id to the request it belongs to, from the moment the
//! request is accepted until it is completed, cancelled or swept as expired.
//!
//! Lifecycle for a tid is strictly `register` then one of `complete`,
//! `cancel` or a sweep. Anything else fails loudly; an entry is never
//! overwritten. Whichever of `complete`/`cancel` reaches an entry first wins
//! and the other gets [`CorrelationError::UnknownTid`].
//!
//! Entries live in a sharded map, so registering or completing one tid only
//! locks the shard holding it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::frame::{Mode, Tid};

/// Correlation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("transaction {0} is already pending")]
    DuplicateTid(Tid),

    #[error("transaction {0} is not pending")]
    UnknownTid(Tid),
}

impl CorrelationError {
    pub fn kind(&self) -> &'static str {
        match self {
            CorrelationError::DuplicateTid(_) => "duplicate_tid",
            CorrelationError::UnknownTid(_) => "unknown_tid",
        }
    }
}

/// A request that has been accepted and not yet answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub tid: Tid,
    pub mode: Mode,
    pub submitted_at: Instant,
}

impl PendingRequest {
    /// Time spent pending as of `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.submitted_at)
    }
}

/// Lifetime counters for the table.
#[derive(Debug, Default)]
pub struct CorrelationStats {
    pub registered: AtomicU64,
    pub completed: AtomicU64,
    pub cancelled: AtomicU64,
    pub expired: AtomicU64,
    pub duplicates: AtomicU64,
}

/// Plain copy of [`CorrelationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationSnapshot {
    pub pending: u64,
    pub registered: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub expired: u64,
    pub duplicates: u64,
}

/// Table of pending requests keyed by transaction id.
#[derive(Debug)]
pub struct CorrelationTable {
    pending: DashMap<Tid, PendingRequest>,
    ttl: Duration,
    stats: CorrelationStats,
}

impl CorrelationTable {
    /// Create a table whose entries become evictable after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
            stats: CorrelationStats::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Accept a request. Fails if `tid` is already pending; the existing
    /// entry is left untouched.
    pub fn register(&self, tid: Tid, mode: Mode) -> Result<(), CorrelationError> {
        match self.pending.entry(tid) {
            Entry::Occupied(_) => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                Err(CorrelationError::DuplicateTid(tid))
            }
            Entry::Vacant(slot) => {
                debug!(%tid, %mode, "Registered pending request");
                slot.insert(PendingRequest {
                    tid,
                    mode,
                    submitted_at: Instant::now(),
                });
                self.stats.registered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Look up a pending request without removing it.
    pub fn resolve(&self, tid: Tid) -> Result<PendingRequest, CorrelationError> {
        self.pending
            .get(&tid)
            .map(|entry| entry.value().clone())
            .ok_or(CorrelationError::UnknownTid(tid))
    }

    /// Remove a request because its response is about to be emitted.
    pub fn complete(&self, tid: Tid) -> Result<PendingRequest, CorrelationError> {
        let (_, pending) = self
            .pending
            .remove(&tid)
            .ok_or(CorrelationError::UnknownTid(tid))?;

        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        debug!(
            %tid,
            elapsed_ms = pending.submitted_at.elapsed().as_millis() as u64,
            "Completed pending request"
        );
        Ok(pending)
    }

    /// Remove a request without a response; the caller has given up on it.
    pub fn cancel(&self, tid: Tid) -> Result<PendingRequest, CorrelationError> {
        let (_, pending) = self
            .pending
            .remove(&tid)
            .ok_or(CorrelationError::UnknownTid(tid))?;

        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        debug!(%tid, "Cancelled pending request");
        Ok(pending)
    }

    /// Evict every entry older than the TTL as of `now`.
    ///
    /// Never runs on its own; the owner picks the cadence.
    pub fn sweep_expired(&self, now: Instant) -> Vec<PendingRequest> {
        let candidates: Vec<Tid> = self
            .pending
            .iter()
            .filter(|entry| entry.value().age(now) >= self.ttl)
            .map(|entry| *entry.key())
            .collect();

        let mut expired = Vec::with_capacity(candidates.len());
        for tid in candidates {
            // Re-checked under the shard lock: the entry may have been
            // completed and re-registered since the scan.
            if let Some((_, pending)) = self
                .pending
                .remove_if(&tid, |_, pending| pending.age(now) >= self.ttl)
            {
                warn!(
                    %tid,
                    mode = %pending.mode,
                    age_ms = pending.age(now).as_millis() as u64,
                    "Evicting expired pending request"
                );
                expired.push(pending);
            }
        }

        self.stats
            .expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
    }

    pub fn is_pending(&self, tid: Tid) -> bool {
        self.pending.contains_key(&tid)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> &CorrelationStats {
        &self.stats
    }

    pub fn snapshot(&self) -> CorrelationSnapshot {
        CorrelationSnapshot {
            pending: self.pending.len() as u64,
            registered: self.stats.registered.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
        }
    }
}
