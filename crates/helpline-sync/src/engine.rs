//! Per-conversation synchronization state machine.
//!
//! The state is derived, not stored: no [`ChatSyncState`] means
//! uninitialized (full resync), a stale or gap-saturated state forces full
//! resync, otherwise delta sync from the high-water mark. Recorded gaps are
//! filled independently of either path by [`SyncEngine::fill_gaps`].
//!
//! All sync entry points serialize per conversation on an internal mutex
//! map: sync-state merges are read-modify-write, and two concurrent syncs of
//! the same conversation would lose updates otherwise.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{Duration, Utc};

use helpline_cache::{CacheStats, MessageCache};
use helpline_store::{ChatSyncState, SequenceGap, SyncStateUpdate};

use crate::error::{Result, SyncError};
use crate::remote::{FetchWindow, MessageFetcher, OperationExecutor};

/// Tuning knobs for the sync state machine.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// A conversation not synced for this long is fully resynced.
    pub staleness_window: Duration,
    /// Past this many recorded gaps, one full reload beats many round trips.
    pub max_known_gaps: usize,
    /// Default fetch batch size for delta sync and full resync.
    pub default_batch_size: u32,
    /// Default retry budget for queued offline operations.
    pub default_max_retries: u32,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::days(7),
            max_known_gaps: 10,
            default_batch_size: 100,
            default_max_retries: 5,
        }
    }
}

/// Options for one `sync_chat` call.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub force_full_sync: bool,
    /// Cap on messages fetched in one delta batch; engine default if `None`.
    pub max_messages: Option<u32>,
}

/// Which path a sync took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Delta,
    Full,
    GapFill,
}

/// Structured outcome of a sync. Sync never throws: failures land here.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub request_id: String,
    pub success: bool,
    pub mode: SyncMode,
    pub synced_count: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Outcome of one gap-filling pass. Gaps are attempted independently; one
/// failure does not abort the rest.
#[derive(Debug, Clone, Default)]
pub struct GapFillReport {
    pub attempted: usize,
    pub filled: usize,
    pub remaining: usize,
    pub errors: Vec<String>,
}

/// The synchronization engine for one user's cache.
pub struct SyncEngine {
    pub(crate) cache: MessageCache,
    pub(crate) fetcher: Arc<dyn MessageFetcher>,
    pub(crate) executor: Arc<dyn OperationExecutor>,
    pub(crate) stats: Arc<CacheStats>,
    pub(crate) config: SyncEngineConfig,
    pub(crate) online: AtomicBool,
    pub(crate) queue_size: AtomicUsize,
    pub(crate) draining: AtomicBool,
    chat_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncEngine {
    /// Build an engine over an open cache. Recovers queue bookkeeping left
    /// by a previous crash: operations stuck in `syncing` go back to
    /// `pending` and the in-memory queue size is re-read from disk.
    pub async fn new(
        cache: MessageCache,
        fetcher: Arc<dyn MessageFetcher>,
        executor: Arc<dyn OperationExecutor>,
        config: SyncEngineConfig,
    ) -> Result<Self> {
        let stats = cache.stats().clone();

        let unconfirmed = {
            let db = cache.database().lock().await;
            for mut op in db.stuck_syncing_operations()? {
                tracing::info!(op = %op.id, "recovering operation interrupted mid-execution");
                op.status = helpline_store::OperationStatus::Pending;
                db.update_operation(&op)?;
            }
            db.count_unconfirmed_operations()?
        };

        Ok(Self {
            cache,
            fetcher,
            executor,
            stats,
            config,
            online: AtomicBool::new(true),
            queue_size: AtomicUsize::new(unconfirmed as usize),
            draining: AtomicBool::new(false),
            chat_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    /// Per-conversation mutual exclusion token. Sync paths hold this across
    /// their read-modify-write sequences.
    pub(crate) fn chat_lock(&self, request_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.chat_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // -- sync ---------------------------------------------------------------

    /// Synchronize one conversation: full resync when uninitialized, forced,
    /// stale, or gap-saturated; otherwise delta sync from the high-water
    /// mark.
    pub async fn sync_chat(&self, request_id: &str, options: SyncOptions) -> SyncReport {
        let lock = self.chat_lock(request_id);
        let _guard = lock.lock().await;

        let started = Instant::now();
        let outcome = self.sync_chat_locked(request_id, &options).await;
        self.finish_report(request_id, started, outcome)
    }

    /// Discard local state for the conversation and reload the newest batch
    /// from the authoritative source.
    pub async fn full_resync(&self, request_id: &str) -> SyncReport {
        let lock = self.chat_lock(request_id);
        let _guard = lock.lock().await;

        let started = Instant::now();
        let outcome = self
            .full_resync_locked(request_id)
            .await
            .map(|count| (SyncMode::Full, count));
        self.finish_report(request_id, started, outcome)
    }

    async fn sync_chat_locked(
        &self,
        request_id: &str,
        options: &SyncOptions,
    ) -> Result<(SyncMode, usize)> {
        let state = self.cache.sync_state(request_id).await?;

        if !options.force_full_sync {
            if let Some(state) = &state {
                let saturated = state.known_gaps.len() > self.config.max_known_gaps;
                if !self.is_stale(state) && !saturated {
                    let count = self.delta_sync_locked(state, options).await?;
                    return Ok((SyncMode::Delta, count));
                }
            }
        }

        let count = self.full_resync_locked(request_id).await?;
        Ok((SyncMode::Full, count))
    }

    fn is_stale(&self, state: &ChatSyncState) -> bool {
        match state.last_synced_at {
            Some(at) => Utc::now() - at > self.config.staleness_window,
            // A state that never completed a sync is treated as stale.
            None => true,
        }
    }

    async fn delta_sync_locked(
        &self,
        state: &ChatSyncState,
        options: &SyncOptions,
    ) -> Result<usize> {
        let request_id = state.request_id.as_str();
        let limit = options.max_messages.unwrap_or(self.config.default_batch_size);

        let fetched = self
            .fetcher
            .fetch_messages(
                request_id,
                &FetchWindow::since(state.last_synced_sequence, limit),
            )
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?;

        if fetched.is_empty() {
            // Nothing new upstream: a successful no-op.
            self.cache
                .update_sync_state(
                    request_id,
                    SyncStateUpdate {
                        last_synced_at: Some(Utc::now()),
                        last_accessed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(0);
        }

        let batch: Vec<_> = fetched.into_iter().map(|m| m.into_cached()).collect();
        // The fetch may legitimately skip sequence numbers absent upstream:
        // advance to the maximum observed, never by increment.
        let max_seq = batch
            .iter()
            .filter_map(|m| m.sequence_number)
            .max()
            .unwrap_or(state.last_synced_sequence);
        let count = batch.len();

        self.cache.add_messages_batch(&batch).await?;

        for gap in self.cache.detect_gaps(request_id).await? {
            self.cache.record_gap(request_id, gap).await?;
        }

        let message_count = self.cache.message_count(request_id).await?;
        self.cache
            .update_sync_state(
                request_id,
                SyncStateUpdate {
                    last_synced_sequence: Some(max_seq),
                    last_synced_at: Some(Utc::now()),
                    last_accessed_at: Some(Utc::now()),
                    message_count: Some(message_count),
                    total_message_count: Some(message_count.max(state.total_message_count)),
                    ..Default::default()
                },
            )
            .await?;

        tracing::debug!(request = request_id, count, max_seq, "delta sync applied");
        Ok(count)
    }

    async fn full_resync_locked(&self, request_id: &str) -> Result<usize> {
        // Fetch before discarding anything: a transport failure must leave
        // the stale cache visible, not an empty one.
        let fetched = self
            .fetcher
            .fetch_messages(request_id, &FetchWindow::newest(self.config.default_batch_size))
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?;

        self.cache.clear_chat(request_id).await?;

        if fetched.is_empty() {
            // A new, message-less conversation still gets a zeroed state so
            // the next access takes the delta path.
            self.cache
                .update_sync_state(
                    request_id,
                    SyncStateUpdate {
                        last_synced_at: Some(Utc::now()),
                        last_accessed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            tracing::debug!(request = request_id, "full resync of empty conversation");
            return Ok(0);
        }

        let batch: Vec<_> = fetched.into_iter().map(|m| m.into_cached()).collect();
        let sequences: Vec<i64> = batch.iter().filter_map(|m| m.sequence_number).collect();
        let min_seq = sequences.iter().copied().min().unwrap_or(0);
        let max_seq = sequences.iter().copied().max().unwrap_or(0);
        let count = batch.len();

        self.cache.add_messages_batch(&batch).await?;

        // Everything before the loaded window is known missing without
        // another round trip, plus any holes inside the window itself.
        let mut gaps = Vec::new();
        if min_seq > 1 {
            gaps.push(SequenceGap::new(1, min_seq - 1));
        }
        gaps.extend(self.cache.detect_gaps(request_id).await?);

        self.cache
            .update_sync_state(
                request_id,
                SyncStateUpdate {
                    last_synced_sequence: Some(max_seq),
                    last_synced_at: Some(Utc::now()),
                    last_accessed_at: Some(Utc::now()),
                    message_count: Some(count as i64),
                    total_message_count: Some(max_seq),
                    known_gaps: Some(gaps),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(request = request_id, count, min_seq, max_seq, "full resync complete");
        Ok(count)
    }

    /// Attempt every recorded gap independently. A fetch that only partially
    /// covers a gap clears it and records the uncovered remainder as
    /// narrower gaps; an empty fetch leaves the gap for a later attempt.
    pub async fn fill_gaps(&self, request_id: &str) -> GapFillReport {
        let lock = self.chat_lock(request_id);
        let _guard = lock.lock().await;

        let mut report = GapFillReport::default();

        let gaps = match self.cache.sync_state(request_id).await {
            Ok(Some(state)) => state.known_gaps,
            Ok(None) => return report,
            Err(e) => {
                report.errors.push(e.to_string());
                return report;
            }
        };

        report.attempted = gaps.len();

        for gap in gaps {
            match self.fill_one_gap(request_id, &gap).await {
                Ok(true) => report.filled += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        request = request_id,
                        start = gap.start_seq,
                        end = gap.end_seq,
                        error = %e,
                        "gap fill attempt failed"
                    );
                    report.errors.push(e.to_string());
                }
            }
        }

        report.remaining = match self.cache.sync_state(request_id).await {
            Ok(Some(state)) => state.known_gaps.len(),
            _ => 0,
        };
        report
    }

    /// Returns `true` when the gap was cleared (possibly replaced by
    /// narrower remainders).
    async fn fill_one_gap(&self, request_id: &str, gap: &SequenceGap) -> Result<bool> {
        let fetched = self
            .fetcher
            .fetch_messages(request_id, &FetchWindow::range(gap.start_seq, gap.end_seq))
            .await
            .map_err(|e| SyncError::Fetch(e.to_string()))?;

        if fetched.is_empty() {
            return Ok(false);
        }

        let batch: Vec<_> = fetched.into_iter().map(|m| m.into_cached()).collect();
        let mut covered: Vec<i64> = batch
            .iter()
            .filter_map(|m| m.sequence_number)
            .filter(|s| (gap.start_seq..=gap.end_seq).contains(s))
            .collect();
        covered.sort_unstable();
        covered.dedup();

        self.cache.add_messages_batch(&batch).await?;
        self.cache.clear_gap(request_id, gap).await?;

        for (start, end) in uncovered_ranges(gap.start_seq, gap.end_seq, &covered) {
            self.cache
                .record_gap(request_id, SequenceGap::new(start, end))
                .await?;
        }

        let message_count = self.cache.message_count(request_id).await?;
        self.cache
            .update_sync_state(
                request_id,
                SyncStateUpdate {
                    message_count: Some(message_count),
                    ..Default::default()
                },
            )
            .await?;

        tracing::debug!(
            request = request_id,
            start = gap.start_seq,
            end = gap.end_seq,
            ingested = covered.len(),
            "gap filled"
        );
        Ok(true)
    }

    fn finish_report(
        &self,
        request_id: &str,
        started: Instant,
        outcome: Result<(SyncMode, usize)>,
    ) -> SyncReport {
        let duration_ms = started.elapsed().as_millis() as u64;
        let report = match outcome {
            Ok((mode, synced_count)) => SyncReport {
                request_id: request_id.to_string(),
                success: true,
                mode,
                synced_count,
                duration_ms,
                error: None,
            },
            Err(e) => {
                tracing::warn!(request = request_id, error = %e, "sync failed");
                SyncReport {
                    request_id: request_id.to_string(),
                    success: false,
                    mode: SyncMode::Delta,
                    synced_count: 0,
                    duration_ms,
                    error: Some(e.to_string()),
                }
            }
        };
        self.stats.record_sync(report.success);
        report
    }
}

/// Sub-ranges of `[start, end]` not present in `covered` (sorted, deduped).
fn uncovered_ranges(start: i64, end: i64, covered: &[i64]) -> Vec<(i64, i64)> {
    let mut missing = Vec::new();
    let mut cursor = start;
    for &seq in covered {
        if seq > cursor {
            missing.push((cursor, seq - 1));
        }
        cursor = seq + 1;
    }
    if cursor <= end {
        missing.push((cursor, end));
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{harness, remotes, FlakyExecutor};

    #[test]
    fn uncovered_ranges_subtracts_intervals() {
        assert_eq!(uncovered_ranges(4, 6, &[]), vec![(4, 6)]);
        assert_eq!(uncovered_ranges(4, 6, &[4, 5, 6]), Vec::<(i64, i64)>::new());
        assert_eq!(uncovered_ranges(4, 8, &[5, 6]), vec![(4, 4), (7, 8)]);
        assert_eq!(uncovered_ranges(1, 10, &[1, 2, 9]), vec![(3, 8), (10, 10)]);
    }

    #[tokio::test]
    async fn first_sync_is_full_and_seeds_leading_gap() {
        let h = harness(
            vec![Ok(remotes("req-1", 50..=60))],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        let report = h.engine.sync_chat("req-1", SyncOptions::default()).await;
        assert!(report.success);
        assert_eq!(report.mode, SyncMode::Full);
        assert_eq!(report.synced_count, 11);

        let state = h.engine.cache().sync_state("req-1").await.unwrap().unwrap();
        assert_eq!(state.last_synced_sequence, 60);
        assert_eq!(state.known_gaps.len(), 1);
        assert_eq!(
            (state.known_gaps[0].start_seq, state.known_gaps[0].end_seq),
            (1, 49)
        );
    }

    #[tokio::test]
    async fn resync_from_sequence_one_records_no_gap() {
        let h = harness(
            vec![Ok(remotes("req-1", 1..=5))],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        let report = h.engine.full_resync("req-1").await;
        assert!(report.success);

        let state = h.engine.cache().sync_state("req-1").await.unwrap().unwrap();
        assert!(state.known_gaps.is_empty());
        assert_eq!(state.last_synced_sequence, 5);
        assert_eq!(state.message_count, 5);
    }

    #[tokio::test]
    async fn empty_conversation_still_initializes_state() {
        let h = harness(
            vec![Ok(Vec::new())],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        let report = h.engine.sync_chat("req-new", SyncOptions::default()).await;
        assert!(report.success);
        assert_eq!(report.synced_count, 0);

        let state = h.engine.cache().sync_state("req-new").await.unwrap().unwrap();
        assert_eq!(state.last_synced_sequence, 0);
        assert!(state.known_gaps.is_empty());
    }

    #[tokio::test]
    async fn second_sync_takes_delta_path_and_advances_mark() {
        let h = harness(
            vec![
                Ok(remotes("req-1", 1..=3)),
                Ok(remotes("req-1", 4..=5)),
                Ok(Vec::new()),
            ],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        h.engine.sync_chat("req-1", SyncOptions::default()).await;

        let report = h.engine.sync_chat("req-1", SyncOptions::default()).await;
        assert!(report.success);
        assert_eq!(report.mode, SyncMode::Delta);
        assert_eq!(report.synced_count, 2);

        let state = h.engine.cache().sync_state("req-1").await.unwrap().unwrap();
        assert_eq!(state.last_synced_sequence, 5);

        // The delta fetch asked for everything past the high-water mark.
        let windows = h.fetcher.windows.lock().unwrap();
        assert_eq!(windows[1].since_sequence, Some(3));
        drop(windows);

        // An empty delta is a successful no-op.
        let report = h.engine.sync_chat("req-1", SyncOptions::default()).await;
        assert!(report.success);
        assert_eq!(report.synced_count, 0);
    }

    #[tokio::test]
    async fn delta_skipping_sequences_records_the_hole() {
        let h = harness(
            vec![Ok(remotes("req-1", 1..=3)), Ok(remotes("req-1", vec![7, 8]))],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        h.engine.sync_chat("req-1", SyncOptions::default()).await;
        h.engine.sync_chat("req-1", SyncOptions::default()).await;

        let state = h.engine.cache().sync_state("req-1").await.unwrap().unwrap();
        assert_eq!(state.last_synced_sequence, 8);
        let ranges: Vec<_> = state
            .known_gaps
            .iter()
            .map(|g| (g.start_seq, g.end_seq))
            .collect();
        assert_eq!(ranges, vec![(4, 6)]);
    }

    #[tokio::test]
    async fn staleness_forces_full_resync() {
        let h = harness(
            vec![Ok(remotes("req-1", 1..=3)), Ok(remotes("req-1", 1..=4))],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        h.engine.sync_chat("req-1", SyncOptions::default()).await;

        // Age the sync timestamp past the 7-day window.
        {
            let db = h.db.lock().await;
            let mut state = db.get_sync_state("req-1").unwrap().unwrap();
            state.last_synced_at = Some(Utc::now() - Duration::days(8));
            db.put_sync_state(&state).unwrap();
        }

        let report = h.engine.sync_chat("req-1", SyncOptions::default()).await;
        assert!(report.success);
        assert_eq!(report.mode, SyncMode::Full);
    }

    #[tokio::test]
    async fn gap_saturation_forces_full_resync() {
        let mut config = SyncEngineConfig::default();
        config.max_known_gaps = 2;

        let h = harness(
            vec![Ok(remotes("req-1", 1..=3)), Ok(remotes("req-1", 1..=3))],
            FlakyExecutor::default(),
            config,
        )
        .await;

        h.engine.sync_chat("req-1", SyncOptions::default()).await;
        for start in [10i64, 20, 30] {
            h.engine
                .cache()
                .record_gap("req-1", SequenceGap::new(start, start + 1))
                .await
                .unwrap();
        }

        let report = h.engine.sync_chat("req-1", SyncOptions::default()).await;
        assert_eq!(report.mode, SyncMode::Full);

        // The resync replaced the saturated gap list.
        let state = h.engine.cache().sync_state("req-1").await.unwrap().unwrap();
        assert!(state.known_gaps.is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_is_reported_not_thrown() {
        let h = harness(
            vec![
                Ok(remotes("req-1", 1..=3)),
                Err(anyhow::anyhow!("server unreachable")),
            ],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        h.engine.sync_chat("req-1", SyncOptions::default()).await;
        let report = h.engine.sync_chat("req-1", SyncOptions::default()).await;

        assert!(!report.success);
        assert!(report.error.as_deref().unwrap().contains("server unreachable"));

        // Previously cached data stays intact and visible.
        let messages = h.engine.cache().messages("req-1").await.unwrap();
        assert_eq!(messages.len(), 3);

        let snap = h.engine.cache().stats().snapshot();
        assert_eq!(snap.syncs, 2);
        assert_eq!(snap.sync_errors, 1);
    }

    #[tokio::test]
    async fn failed_forced_resync_keeps_cached_data() {
        let h = harness(
            vec![
                Ok(remotes("req-1", 1..=3)),
                Err(anyhow::anyhow!("server unreachable")),
            ],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        h.engine.sync_chat("req-1", SyncOptions::default()).await;

        let report = h
            .engine
            .sync_chat(
                "req-1",
                SyncOptions {
                    force_full_sync: true,
                    ..Default::default()
                },
            )
            .await;
        assert!(!report.success);

        // Stale-but-present beats empty: nothing was discarded.
        let messages = h.engine.cache().messages("req-1").await.unwrap();
        assert_eq!(messages.len(), 3);
        assert!(h.engine.cache().sync_state("req-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn gap_fill_clears_fully_covered_gap() {
        let h = harness(
            vec![Ok(remotes("req-1", vec![1, 2, 7, 8])), Ok(remotes("req-1", 3..=6))],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        h.engine.sync_chat("req-1", SyncOptions::default()).await;
        let report = h.engine.fill_gaps("req-1").await;

        assert_eq!(report.attempted, 1);
        assert_eq!(report.filled, 1);
        assert_eq!(report.remaining, 0);

        let messages = h.engine.cache().messages("req-1").await.unwrap();
        assert_eq!(messages.len(), 8);
    }

    #[tokio::test]
    async fn partial_gap_fill_narrows_the_gap() {
        let h = harness(
            vec![
                Ok(remotes("req-1", vec![1, 2, 10])),
                // Server can only produce part of [3,9]; 6..9 are gone.
                Ok(remotes("req-1", 3..=5)),
            ],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        h.engine.sync_chat("req-1", SyncOptions::default()).await;
        let report = h.engine.fill_gaps("req-1").await;
        assert_eq!(report.filled, 1);
        assert_eq!(report.remaining, 1);

        let state = h.engine.cache().sync_state("req-1").await.unwrap().unwrap();
        let ranges: Vec<_> = state
            .known_gaps
            .iter()
            .map(|g| (g.start_seq, g.end_seq))
            .collect();
        assert_eq!(ranges, vec![(6, 9)]);
    }

    #[tokio::test]
    async fn empty_gap_fill_leaves_gap_recorded() {
        let h = harness(
            vec![Ok(remotes("req-1", vec![1, 5])), Ok(Vec::new())],
            FlakyExecutor::default(),
            SyncEngineConfig::default(),
        )
        .await;

        h.engine.sync_chat("req-1", SyncOptions::default()).await;
        let report = h.engine.fill_gaps("req-1").await;

        assert_eq!(report.filled, 0);
        assert_eq!(report.remaining, 1);
    }
}
