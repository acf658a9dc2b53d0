//! Durable offline operation queue processing.
//!
//! Operations move `pending -> syncing -> (confirmed | pending-with-backoff
//! | failed)`. A crash mid-execution leaves `syncing` rows; engine startup
//! resets them to `pending` so the next drain retries them. `failed` is
//! terminal: only [`SyncEngine::retry_failed_operation`] or
//! [`SyncEngine::discard_failed_operation`] touch it again.

use std::sync::atomic::Ordering;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use helpline_store::{OfflineOperation, OperationKind, OperationStatus};

use crate::backoff::retry_delay;
use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};

/// Outcome of one queue drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDrainReport {
    /// Operations confirmed and removed.
    pub confirmed: usize,
    /// Operations pushed back to `pending` with a backoff hold.
    pub deferred: usize,
    /// Operations that exhausted their retry budget this drain.
    pub failed: usize,
}

impl SyncEngine {
    /// Persist a new operation for later execution.
    pub async fn queue_operation(
        &self,
        kind: OperationKind,
        payload: Value,
    ) -> Result<OfflineOperation> {
        let op = OfflineOperation::new(kind, payload, self.config.default_max_retries);
        {
            let db = self.cache.database().lock().await;
            db.enqueue_operation(&op)?;
        }
        self.queue_size.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(op = %op.id, kind = kind.as_str(), "queued offline operation");
        Ok(op)
    }

    /// Cheap in-memory view of operations awaiting confirmation.
    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::Relaxed)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Consume a connectivity transition. Going offline only flips the flag;
    /// going online triggers one queue drain. Redundant online events are
    /// tolerated: a drain already in flight absorbs them.
    pub async fn handle_connectivity(&self, online: bool) -> Option<QueueDrainReport> {
        let was_online = self.online.swap(online, Ordering::Relaxed);
        if online && !was_online {
            tracing::info!("network online; draining offline queue");
            return Some(self.process_offline_queue().await);
        }
        None
    }

    /// Execute every due pending operation once. Idempotent: operations are
    /// individually durable, so re-running after a crash or a redundant
    /// online event only re-attempts what is still unconfirmed.
    pub async fn process_offline_queue(&self) -> QueueDrainReport {
        // One drain at a time; concurrent triggers are no-ops.
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return QueueDrainReport::default();
        }

        let report = self.drain_due_operations().await;

        self.draining.store(false, Ordering::Release);
        if report != QueueDrainReport::default() {
            tracing::info!(
                confirmed = report.confirmed,
                deferred = report.deferred,
                failed = report.failed,
                "offline queue drained"
            );
        }
        report
    }

    async fn drain_due_operations(&self) -> QueueDrainReport {
        let mut report = QueueDrainReport::default();

        let due = {
            let db = self.cache.database().lock().await;
            match db.due_operations(Utc::now()) {
                Ok(due) => due,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to scan offline queue");
                    return report;
                }
            }
        };

        for mut op in due {
            // Mark as in-flight before executing so a crash here is visible
            // as "was being attempted" on the next drain.
            op.status = OperationStatus::Syncing;
            if let Err(e) = self.persist_operation(&op).await {
                tracing::warn!(op = %op.id, error = %e, "failed to mark operation syncing");
                continue;
            }

            match self.executor.execute(&op).await {
                Ok(()) => {
                    if let Err(e) = self.remove_operation(op.id).await {
                        tracing::warn!(op = %op.id, error = %e, "confirmed operation not removed");
                        continue;
                    }
                    self.queue_size.fetch_sub(1, Ordering::Relaxed);
                    report.confirmed += 1;
                }
                Err(e) => {
                    // Backoff doubles from 1s: the delay after the n-th
                    // failure is 2^(n-1) seconds, capped at 60s.
                    let delay = retry_delay(op.retry_count);
                    op.retry_count += 1;
                    op.last_error = Some(e.to_string());
                    if op.retry_count >= op.max_retries {
                        op.status = OperationStatus::Failed;
                        op.next_retry_at = None;
                        self.queue_size.fetch_sub(1, Ordering::Relaxed);
                        report.failed += 1;
                        tracing::warn!(
                            op = %op.id,
                            retries = op.retry_count,
                            error = %e,
                            "operation failed permanently"
                        );
                    } else {
                        op.status = OperationStatus::Pending;
                        op.next_retry_at = Some(
                            Utc::now()
                                + chrono::Duration::milliseconds(delay.as_millis() as i64),
                        );
                        report.deferred += 1;
                        tracing::debug!(
                            op = %op.id,
                            retries = op.retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "operation deferred with backoff"
                        );
                    }
                    if let Err(persist_err) = self.persist_operation(&op).await {
                        tracing::warn!(op = %op.id, error = %persist_err, "failed to persist retry state");
                    }
                }
            }
        }

        report
    }

    /// Reset a terminally failed operation to `pending` with a fresh retry
    /// budget. The explicit caller intervention `failed` requires.
    pub async fn retry_failed_operation(&self, id: Uuid) -> Result<()> {
        let db = self.cache.database().lock().await;
        let mut op = db.get_operation(id)?.ok_or(SyncError::NotFound)?;
        if op.status != OperationStatus::Failed {
            return Ok(());
        }
        op.status = OperationStatus::Pending;
        op.retry_count = 0;
        op.next_retry_at = None;
        op.last_error = None;
        db.update_operation(&op)?;
        self.queue_size.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop a terminally failed operation.
    pub async fn discard_failed_operation(&self, id: Uuid) -> Result<()> {
        let db = self.cache.database().lock().await;
        let op = db.get_operation(id)?.ok_or(SyncError::NotFound)?;
        if op.status != OperationStatus::Failed {
            return Err(SyncError::InvalidOperationState(
                op.status.as_str().to_string(),
            ));
        }
        db.delete_operation(id)?;
        Ok(())
    }

    async fn persist_operation(&self, op: &OfflineOperation) -> Result<()> {
        let db = self.cache.database().lock().await;
        db.update_operation(op)?;
        Ok(())
    }

    async fn remove_operation(&self, id: Uuid) -> Result<()> {
        let db = self.cache.database().lock().await;
        db.delete_operation(id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncEngineConfig;
    use crate::testutil::{harness, FlakyExecutor, Harness};
    use serde_json::json;

    async fn make_due(h: &Harness, id: Uuid) {
        let db = h.db.lock().await;
        let mut op = db.get_operation(id).unwrap().unwrap();
        op.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        db.update_operation(&op).unwrap();
    }

    #[tokio::test]
    async fn drain_confirms_and_removes_executed_operations() {
        let h = harness(vec![], FlakyExecutor::default(), SyncEngineConfig::default()).await;

        let op = h
            .engine
            .queue_operation(OperationKind::SendMessage, json!({"content": "hi"}))
            .await
            .unwrap();
        assert_eq!(h.engine.queue_size(), 1);

        let report = h.engine.process_offline_queue().await;
        assert_eq!(report.confirmed, 1);
        assert_eq!(h.engine.queue_size(), 0);
        assert_eq!(*h.executor.executed.lock().unwrap(), vec![op.id]);

        let db = h.db.lock().await;
        assert!(db.get_operation(op.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_defers_with_doubling_backoff() {
        let h = harness(vec![], FlakyExecutor::failing(), SyncEngineConfig::default()).await;

        let op = h
            .engine
            .queue_operation(OperationKind::SendMessage, json!({"content": "hi"}))
            .await
            .unwrap();

        let report = h.engine.process_offline_queue().await;
        assert_eq!(report.deferred, 1);

        let first_hold;
        {
            let db = h.db.lock().await;
            let stored = db.get_operation(op.id).unwrap().unwrap();
            assert_eq!(stored.status, OperationStatus::Pending);
            assert_eq!(stored.retry_count, 1);
            first_hold = stored.next_retry_at.unwrap() - Utc::now();
            // First failure holds for ~1s.
            assert!(first_hold <= chrono::Duration::seconds(1));
            assert!(first_hold > chrono::Duration::milliseconds(500));
        }

        // Not yet due: a drain in the hold window skips it.
        let report = h.engine.process_offline_queue().await;
        assert_eq!(report, QueueDrainReport::default());

        make_due(&h, op.id).await;
        let report = h.engine.process_offline_queue().await;
        assert_eq!(report.deferred, 1);

        let db = h.db.lock().await;
        let stored = db.get_operation(op.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
        // Second failure holds for ~2s.
        let second_hold = stored.next_retry_at.unwrap() - Utc::now();
        assert!(second_hold > first_hold);
        assert!(second_hold <= chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn exhausted_retries_park_the_operation_as_failed() {
        let mut config = SyncEngineConfig::default();
        config.default_max_retries = 2;
        let h = harness(vec![], FlakyExecutor::failing(), config).await;

        let op = h
            .engine
            .queue_operation(OperationKind::MarkRead, json!({"request_id": "req-1"}))
            .await
            .unwrap();

        let report = h.engine.process_offline_queue().await;
        assert_eq!(report.deferred, 1);

        make_due(&h, op.id).await;
        let report = h.engine.process_offline_queue().await;
        assert_eq!(report.failed, 1);
        assert_eq!(h.engine.queue_size(), 0);

        {
            let db = h.db.lock().await;
            let stored = db.get_operation(op.id).unwrap().unwrap();
            assert_eq!(stored.status, OperationStatus::Failed);
            assert!(stored.next_retry_at.is_none());
            assert!(stored.last_error.is_some());
        }

        // Terminal: further drains never touch it.
        let report = h.engine.process_offline_queue().await;
        assert_eq!(report, QueueDrainReport::default());
    }

    #[tokio::test]
    async fn retry_failed_operation_restores_a_fresh_budget() {
        let mut config = SyncEngineConfig::default();
        config.default_max_retries = 1;
        let h = harness(vec![], FlakyExecutor::failing(), config).await;

        let op = h
            .engine
            .queue_operation(OperationKind::SendMessage, json!({"content": "hi"}))
            .await
            .unwrap();
        let report = h.engine.process_offline_queue().await;
        assert_eq!(report.failed, 1);

        h.engine.retry_failed_operation(op.id).await.unwrap();
        assert_eq!(h.engine.queue_size(), 1);

        // Executor recovers; the resurrected operation confirms.
        h.executor.fail.store(false, std::sync::atomic::Ordering::Relaxed);
        let report = h.engine.process_offline_queue().await;
        assert_eq!(report.confirmed, 1);
    }

    #[tokio::test]
    async fn discard_only_applies_to_failed_operations() {
        let mut config = SyncEngineConfig::default();
        config.default_max_retries = 1;
        let h = harness(vec![], FlakyExecutor::failing(), config).await;

        let op = h
            .engine
            .queue_operation(OperationKind::SendMessage, json!({"content": "hi"}))
            .await
            .unwrap();

        let err = h.engine.discard_failed_operation(op.id).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperationState(_)));

        h.engine.process_offline_queue().await;
        h.engine.discard_failed_operation(op.id).await.unwrap();

        let db = h.db.lock().await;
        assert!(db.get_operation(op.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn connectivity_transition_drains_exactly_once() {
        let h = harness(vec![], FlakyExecutor::default(), SyncEngineConfig::default()).await;

        h.engine
            .queue_operation(OperationKind::SendMessage, json!({"content": "hi"}))
            .await
            .unwrap();

        assert!(h.engine.handle_connectivity(false).await.is_none());
        assert!(!h.engine.is_online());

        let report = h.engine.handle_connectivity(true).await.unwrap();
        assert_eq!(report.confirmed, 1);

        // Redundant online events do not trigger another drain.
        assert!(h.engine.handle_connectivity(true).await.is_none());
    }

    #[tokio::test]
    async fn startup_recovers_operations_stuck_in_syncing() {
        let h = harness(vec![], FlakyExecutor::default(), SyncEngineConfig::default()).await;

        let op = h
            .engine
            .queue_operation(OperationKind::SendMessage, json!({"content": "hi"}))
            .await
            .unwrap();
        {
            let db = h.db.lock().await;
            let mut stored = db.get_operation(op.id).unwrap().unwrap();
            stored.status = OperationStatus::Syncing;
            db.update_operation(&stored).unwrap();
        }

        // A second engine over the same store simulates restart after a
        // crash mid-execution.
        let cache = helpline_cache::MessageCache::new(
            h.db.clone(),
            std::sync::Arc::new(helpline_cache::CacheStats::new()),
        );
        let engine = SyncEngine::new(cache, h.fetcher.clone(), h.executor.clone(), SyncEngineConfig::default())
            .await
            .unwrap();
        assert_eq!(engine.queue_size(), 1);

        let db = h.db.lock().await;
        let stored = db.get_operation(op.id).unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
    }
}
