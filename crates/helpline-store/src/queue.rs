//! Typed CRUD for the durable offline operation queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::Result;
use crate::models::{OfflineOperation, OperationKind, OperationStatus};

const QUEUE_COLUMNS: &str =
    "id, kind, payload, status, retry_count, max_retries, next_retry_at, last_error, created_at";

impl Database {
    pub fn enqueue_operation(&self, op: &OfflineOperation) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO offline_queue
                 (id, kind, payload, status, retry_count, max_retries, next_retry_at, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                op.id.to_string(),
                op.kind.as_str(),
                serde_json::to_string(&op.payload)?,
                op.status.as_str(),
                op.retry_count,
                op.max_retries,
                op.next_retry_at.map(|t| t.to_rfc3339()),
                op.last_error,
                op.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Persist updated retry/status bookkeeping for one operation.
    pub fn update_operation(&self, op: &OfflineOperation) -> Result<()> {
        self.conn().execute(
            "UPDATE offline_queue
             SET status = ?2, retry_count = ?3, next_retry_at = ?4, last_error = ?5
             WHERE id = ?1",
            params![
                op.id.to_string(),
                op.status.as_str(),
                op.retry_count,
                op.next_retry_at.map(|t| t.to_rfc3339()),
                op.last_error,
            ],
        )?;
        Ok(())
    }

    pub fn get_operation(&self, id: Uuid) -> Result<Option<OfflineOperation>> {
        let op = self
            .conn()
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM offline_queue WHERE id = ?1"),
                params![id.to_string()],
                row_to_operation,
            )
            .optional()?;
        Ok(op)
    }

    /// Operations eligible for processing: `pending`, with no retry hold or
    /// one that has already passed. Oldest first.
    pub fn due_operations(&self, now: DateTime<Utc>) -> Result<Vec<OfflineOperation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM offline_queue
             WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY created_at ASC"
        ))?;

        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_operation)?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(row?);
        }
        Ok(ops)
    }

    pub fn delete_operation(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM offline_queue WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Durable count of operations still awaiting confirmation.
    pub fn count_unconfirmed_operations(&self) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM offline_queue WHERE status IN ('pending', 'syncing')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Operations abandoned mid-execution by a crash. The processor resets
    /// these to `pending` on startup so they are retried.
    pub fn stuck_syncing_operations(&self) -> Result<Vec<OfflineOperation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM offline_queue
             WHERE status = 'syncing'
             ORDER BY created_at ASC"
        ))?;

        let rows = stmt.query_map([], row_to_operation)?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(row?);
        }
        Ok(ops)
    }
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<OfflineOperation> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let payload_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let next_retry_str: Option<String> = row.get(6)?;
    let created_str: String = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let kind = OperationKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown operation kind: {kind_str}").into(),
        )
    })?;
    let payload = serde_json::from_str(&payload_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status = OperationStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown operation status: {status_str}").into(),
        )
    })?;
    let next_retry_at = next_retry_str
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        6,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
        })
        .transpose()?;
    let created_at = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(OfflineOperation {
        id,
        kind,
        payload,
        status,
        retry_count: row.get(4)?,
        max_retries: row.get(5)?,
        next_retry_at,
        last_error: row.get(7)?,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn due_scan_skips_future_retries_and_failed() {
        let (_dir, db) = open_temp();

        let ready = OfflineOperation::new(OperationKind::SendMessage, json!({"n": 1}), 5);
        let mut held = OfflineOperation::new(OperationKind::SendMessage, json!({"n": 2}), 5);
        held.next_retry_at = Some(Utc::now() + chrono::Duration::minutes(5));
        let mut failed = OfflineOperation::new(OperationKind::MarkRead, json!({"n": 3}), 5);
        failed.status = OperationStatus::Failed;

        db.enqueue_operation(&ready).unwrap();
        db.enqueue_operation(&held).unwrap();
        db.enqueue_operation(&failed).unwrap();

        let due = db.due_operations(Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, ready.id);
    }

    #[test]
    fn update_round_trips_status_and_error() {
        let (_dir, db) = open_temp();

        let mut op = OfflineOperation::new(OperationKind::SendMessage, json!({}), 3);
        db.enqueue_operation(&op).unwrap();

        op.status = OperationStatus::Failed;
        op.retry_count = 3;
        op.last_error = Some("connection refused".into());
        db.update_operation(&op).unwrap();

        let got = db.get_operation(op.id).unwrap().unwrap();
        assert_eq!(got.status, OperationStatus::Failed);
        assert_eq!(got.retry_count, 3);
        assert_eq!(got.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn stuck_syncing_operations_are_visible() {
        let (_dir, db) = open_temp();

        let mut op = OfflineOperation::new(OperationKind::SendMessage, json!({}), 3);
        op.status = OperationStatus::Syncing;
        db.enqueue_operation(&op).unwrap();

        let stuck = db.stuck_syncing_operations().unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(db.count_unconfirmed_operations().unwrap(), 1);
    }
}
