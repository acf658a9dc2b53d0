//! Passive cache statistics.
//!
//! Counters are plain atomics: recording never blocks, never fails, and has
//! no side effects beyond the increment. A JSON snapshot can be persisted to
//! the store's key-value table and hydrated on the next start.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use helpline_store::SharedDatabase;

use crate::error::Result;

/// Key of the snapshot row in `meta_kv`.
const STATS_KEY: &str = "cache_stats";

/// Shared counter block. Written by the message cache, media manager, and
/// sync engine; read by diagnostics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    syncs: AtomicU64,
    sync_errors: AtomicU64,
    message_bytes: AtomicU64,
}

/// Serializable point-in-time view of the counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub reads: u64,
    pub writes: u64,
    pub evictions: u64,
    pub syncs: u64,
    pub sync_errors: u64,
    pub message_bytes: u64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self, message_bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.message_bytes.fetch_add(message_bytes, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self, success: bool) {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.sync_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// hits / (hits + misses), or zero before any read.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            sync_errors: self.sync_errors.load(Ordering::Relaxed),
            message_bytes: self.message_bytes.load(Ordering::Relaxed),
        }
    }

    /// Explicit reset; never implied by any other operation.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.syncs.store(0, Ordering::Relaxed);
        self.sync_errors.store(0, Ordering::Relaxed);
        self.message_bytes.store(0, Ordering::Relaxed);
    }

    /// Overwrite the live counters from a snapshot (startup hydration).
    pub fn restore(&self, snapshot: &StatsSnapshot) {
        self.hits.store(snapshot.hits, Ordering::Relaxed);
        self.misses.store(snapshot.misses, Ordering::Relaxed);
        self.reads.store(snapshot.reads, Ordering::Relaxed);
        self.writes.store(snapshot.writes, Ordering::Relaxed);
        self.evictions.store(snapshot.evictions, Ordering::Relaxed);
        self.syncs.store(snapshot.syncs, Ordering::Relaxed);
        self.sync_errors.store(snapshot.sync_errors, Ordering::Relaxed);
        self.message_bytes
            .store(snapshot.message_bytes, Ordering::Relaxed);
    }

    /// Write the current snapshot to the store.
    pub async fn persist(&self, db: &SharedDatabase) -> Result<()> {
        let json = serde_json::to_string(&self.snapshot())
            .map_err(helpline_store::StoreError::Json)?;
        let db = db.lock().await;
        db.put_kv(STATS_KEY, &json)?;
        Ok(())
    }

    /// Load the last persisted snapshot, if any, into the live counters.
    pub async fn hydrate(&self, db: &SharedDatabase) -> Result<()> {
        let stored = {
            let db = db.lock().await;
            db.get_kv(STATS_KEY)?
        };
        if let Some(json) = stored {
            match serde_json::from_str::<StatsSnapshot>(&json) {
                Ok(snapshot) => self.restore(&snapshot),
                // A malformed snapshot is diagnostics-only data; start fresh.
                Err(e) => tracing::warn!(error = %e, "discarding unreadable stats snapshot"),
            }
        }
        Ok(())
    }
}
