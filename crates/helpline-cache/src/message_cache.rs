//! CRUD and query layer over cached messages and per-conversation sync
//! metadata, with sequence-gap detection.
//!
//! All operations are asynchronous and safe to call concurrently; writes that
//! span several records run inside one store transaction. Read-modify-write
//! sync-state merges are *not* serialized here -- callers running sync must
//! hold the per-conversation lock owned by the sync engine.

use std::sync::Arc;

use chrono::{Duration, Utc};

use helpline_store::{
    CachedMessage, ChatSyncState, SequenceGap, SharedDatabase, SyncStateUpdate,
};

use crate::error::Result;
use crate::stats::CacheStats;

/// Async facade over the message and sync-state tables.
#[derive(Clone)]
pub struct MessageCache {
    db: SharedDatabase,
    stats: Arc<CacheStats>,
}

impl MessageCache {
    pub fn new(db: SharedDatabase, stats: Arc<CacheStats>) -> Self {
        Self { db, stats }
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    // -- point lookups ------------------------------------------------------

    pub async fn message(&self, id: &str) -> Result<Option<CachedMessage>> {
        let db = self.db.lock().await;
        Ok(db.get_message(id)?)
    }

    pub async fn message_by_temp_id(&self, temp_id: &str) -> Result<Option<CachedMessage>> {
        let db = self.db.lock().await;
        Ok(db.get_message_by_temp_id(temp_id)?)
    }

    // -- conversation reads -------------------------------------------------

    /// All messages for a conversation, ascending by sequence number.
    /// Records a cache hit (non-empty) or miss (empty) and refreshes the
    /// conversation's LRU timestamp.
    pub async fn messages(&self, request_id: &str) -> Result<Vec<CachedMessage>> {
        let messages = {
            let db = self.db.lock().await;
            let messages = db.get_messages_for_request(request_id)?;
            if let Some(mut state) = db.get_sync_state(request_id)? {
                state.last_accessed_at = Utc::now();
                db.put_sync_state(&state)?;
            }
            messages
        };

        if messages.is_empty() {
            self.stats.record_miss();
        } else {
            self.stats.record_hit();
        }
        Ok(messages)
    }

    pub async fn messages_paginated(
        &self,
        request_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<CachedMessage>> {
        let db = self.db.lock().await;
        Ok(db.get_messages_paginated(request_id, offset, limit)?)
    }

    pub async fn messages_in_range(
        &self,
        request_id: &str,
        start_seq: i64,
        end_seq: i64,
        limit: u32,
    ) -> Result<Vec<CachedMessage>> {
        let db = self.db.lock().await;
        Ok(db.get_messages_in_range(request_id, start_seq, end_seq, limit)?)
    }

    pub async fn newest_messages(&self, request_id: &str, limit: u32) -> Result<Vec<CachedMessage>> {
        let db = self.db.lock().await;
        Ok(db.get_newest_messages(request_id, limit)?)
    }

    pub async fn oldest_messages(&self, request_id: &str, limit: u32) -> Result<Vec<CachedMessage>> {
        let db = self.db.lock().await;
        Ok(db.get_oldest_messages(request_id, limit)?)
    }

    pub async fn message_count(&self, request_id: &str) -> Result<i64> {
        let db = self.db.lock().await;
        Ok(db.count_messages(request_id)?)
    }

    // -- writes -------------------------------------------------------------

    /// Idempotent upsert keyed by `id`.
    pub async fn add_message(&self, message: &CachedMessage) -> Result<()> {
        {
            let db = self.db.lock().await;
            db.upsert_message(message)?;
        }
        self.stats.record_write(message.content.len() as u64);
        Ok(())
    }

    /// Upsert a batch in one atomic transaction: readers see all or nothing.
    pub async fn add_messages_batch(&self, messages: &[CachedMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        {
            let mut db = self.db.lock().await;
            db.upsert_messages(messages)?;
        }
        for message in messages {
            self.stats.record_write(message.content.len() as u64);
        }
        Ok(())
    }

    /// Swap an optimistic record for its confirmed form as one logical unit.
    /// Idempotent under at-least-once confirmation delivery.
    pub async fn replace_optimistic_message(
        &self,
        temp_id: &str,
        confirmed: &CachedMessage,
    ) -> Result<()> {
        {
            let mut db = self.db.lock().await;
            db.replace_optimistic(temp_id, confirmed)?;
        }
        self.stats.record_write(confirmed.content.len() as u64);
        Ok(())
    }

    // -- sync state ---------------------------------------------------------

    pub async fn sync_state(&self, request_id: &str) -> Result<Option<ChatSyncState>> {
        let db = self.db.lock().await;
        Ok(db.get_sync_state(request_id)?)
    }

    /// Read-modify-write merge against a zeroed default. `known_gaps` is
    /// only replaced when the update explicitly carries it, and the
    /// high-water mark never moves backwards.
    pub async fn update_sync_state(
        &self,
        request_id: &str,
        update: SyncStateUpdate,
    ) -> Result<ChatSyncState> {
        let db = self.db.lock().await;
        let mut state = db
            .get_sync_state(request_id)?
            .unwrap_or_else(|| ChatSyncState::new(request_id));

        if let Some(seq) = update.last_synced_sequence {
            state.last_synced_sequence = state.last_synced_sequence.max(seq);
        }
        if let Some(at) = update.last_synced_at {
            state.last_synced_at = Some(at);
        }
        if let Some(total) = update.total_message_count {
            state.total_message_count = total;
        }
        if let Some(count) = update.message_count {
            state.message_count = count;
        }
        if let Some(gaps) = update.known_gaps {
            state.known_gaps = gaps;
        }
        if let Some(unread) = update.unread_count {
            state.unread_count = unread;
        }
        if let Some(seq) = update.last_read_sequence {
            state.last_read_sequence = seq;
        }
        if let Some(at) = update.last_read_at {
            state.last_read_at = Some(at);
        }
        if let Some(size) = update.media_size {
            state.media_size = size;
        }
        if let Some(at) = update.last_accessed_at {
            state.last_accessed_at = at;
        }
        if let Some(rev) = update.server_revision {
            state.server_revision = Some(rev);
        }

        db.put_sync_state(&state)?;
        Ok(state)
    }

    /// Record a read position: updates `last_read_sequence`/`last_read_at`
    /// and recomputes the unread count from the cached rows.
    pub async fn mark_read(&self, request_id: &str, sequence: i64) -> Result<ChatSyncState> {
        let unread = {
            let db = self.db.lock().await;
            db.confirmed_sequences(request_id)?
                .iter()
                .filter(|&&s| s > sequence)
                .count() as i64
        };

        self.update_sync_state(
            request_id,
            SyncStateUpdate {
                last_read_sequence: Some(sequence),
                last_read_at: Some(Utc::now()),
                unread_count: Some(unread),
                ..Default::default()
            },
        )
        .await
    }

    // -- gap bookkeeping ----------------------------------------------------

    /// Intervals strictly between consecutive cached sequence numbers.
    ///
    /// Local inference only: a gap before the oldest or after the newest
    /// cached message cannot be proven here and is inferred by the sync
    /// engine from server-reported bounds.
    pub async fn detect_gaps(&self, request_id: &str) -> Result<Vec<SequenceGap>> {
        let sequences = {
            let db = self.db.lock().await;
            db.confirmed_sequences(request_id)?
        };
        Ok(gaps_between(&sequences))
    }

    /// Append a gap unless an identical `(start_seq, end_seq)` interval is
    /// already recorded.
    pub async fn record_gap(&self, request_id: &str, gap: SequenceGap) -> Result<()> {
        let db = self.db.lock().await;
        let mut state = db
            .get_sync_state(request_id)?
            .unwrap_or_else(|| ChatSyncState::new(request_id));

        if !state.known_gaps.iter().any(|g| g.same_range(&gap)) {
            tracing::debug!(
                request = request_id,
                start = gap.start_seq,
                end = gap.end_seq,
                "recording sequence gap"
            );
            state.known_gaps.push(gap);
            db.put_sync_state(&state)?;
        }
        Ok(())
    }

    /// Remove only the exact matching interval.
    pub async fn clear_gap(&self, request_id: &str, gap: &SequenceGap) -> Result<()> {
        let db = self.db.lock().await;
        let Some(mut state) = db.get_sync_state(request_id)? else {
            return Ok(());
        };

        let before = state.known_gaps.len();
        state.known_gaps.retain(|g| !g.same_range(gap));
        if state.known_gaps.len() != before {
            db.put_sync_state(&state)?;
        }
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Delete all messages for the conversation plus its sync-state record,
    /// atomically.
    pub async fn clear_chat(&self, request_id: &str) -> Result<()> {
        let mut db = self.db.lock().await;
        db.clear_request(request_id)?;
        tracing::info!(request = request_id, "cleared conversation cache");
        Ok(())
    }

    /// Delete every message cached longer ago than `max_age_days`. Returns
    /// the number of rows removed.
    pub async fn cleanup_expired(&self, max_age_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(max_age_days);
        let removed = {
            let db = self.db.lock().await;
            db.delete_expired_messages(cutoff)?
        };
        if removed > 0 {
            tracing::info!(removed, max_age_days, "expired cached messages");
        }
        Ok(removed)
    }

    /// Whole-conversation LRU eviction: delete least-recently-used
    /// conversations (messages, media, sync state) until `bytes_to_free` of
    /// media estimate is reclaimed or no conversations remain. Returns the
    /// estimated bytes freed.
    pub async fn evict_oldest_chats(&self, bytes_to_free: u64) -> Result<u64> {
        let mut freed: u64 = 0;

        let states = {
            let db = self.db.lock().await;
            db.sync_states_by_last_access()?
        };

        for state in states {
            if freed >= bytes_to_free {
                break;
            }

            let request_id = state.request_id.clone();
            {
                let mut db = self.db.lock().await;
                let media_freed = db.delete_media_for_request(&request_id)?;
                db.clear_request(&request_id)?;
                // The media_size column is an estimate; prefer the measured
                // blob bytes when they disagree.
                freed += state.media_size.max(media_freed) as u64;
            }
            self.stats.record_eviction();
            tracing::info!(
                request = %request_id,
                freed,
                target = bytes_to_free,
                "evicted least-recently-used conversation"
            );
        }

        Ok(freed)
    }
}

/// Every interval strictly between two consecutive cached sequence numbers.
/// Fewer than two sequences cannot prove a gap.
fn gaps_between(sorted_sequences: &[i64]) -> Vec<SequenceGap> {
    let mut gaps = Vec::new();
    for pair in sorted_sequences.windows(2) {
        if pair[1] - pair[0] > 1 {
            gaps.push(SequenceGap::new(pair[0] + 1, pair[1] - 1));
        }
    }
    gaps
}
