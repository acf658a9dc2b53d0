//! Typed CRUD for cached messages.
//!
//! All writes are idempotent upserts keyed by `id`: `INSERT OR REPLACE` also
//! displaces any row that would collide on the unique
//! `(request_id, sequence_number)` index, which is what keeps the
//! no-duplicate-sequence invariant across re-delivery.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::CachedMessage;

const MESSAGE_COLUMNS: &str =
    "id, temp_id, request_id, sequence_number, content, sender_id, sender_name, sent_at, cached_at";

impl Database {
    /// Insert or overwrite one message. Re-adding an existing `id` produces
    /// no duplicate.
    pub fn upsert_message(&self, message: &CachedMessage) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO messages
                 (id, temp_id, request_id, sequence_number, content, sender_id, sender_name, sent_at, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id,
                message.temp_id,
                message.request_id,
                message.sequence_number,
                message.content,
                message.sender_id,
                message.sender_name,
                message.sent_at.to_rfc3339(),
                message.cached_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Insert a batch inside one transaction: readers observe either all of
    /// the batch or none of it.
    pub fn upsert_messages(&mut self, messages: &[CachedMessage]) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO messages
                     (id, temp_id, request_id, sequence_number, content, sender_id, sender_name, sent_at, cached_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for message in messages {
                stmt.execute(params![
                    message.id,
                    message.temp_id,
                    message.request_id,
                    message.sequence_number,
                    message.content,
                    message.sender_id,
                    message.sender_name,
                    message.sent_at.to_rfc3339(),
                    message.cached_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<CachedMessage>> {
        let message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    pub fn get_message_by_temp_id(&self, temp_id: &str) -> Result<Option<CachedMessage>> {
        let message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE temp_id = ?1 LIMIT 1"),
                params![temp_id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// All messages for a conversation, ascending by sequence number.
    /// Optimistic (unsequenced) messages sort after confirmed ones.
    pub fn get_messages_for_request(&self, request_id: &str) -> Result<Vec<CachedMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE request_id = ?1
             ORDER BY sequence_number IS NULL, sequence_number ASC, sent_at ASC"
        ))?;

        let rows = stmt.query_map(params![request_id], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Page of the same ascending order.
    pub fn get_messages_paginated(
        &self,
        request_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<CachedMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE request_id = ?1
             ORDER BY sequence_number IS NULL, sequence_number ASC, sent_at ASC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(params![request_id, limit, offset], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Confirmed messages with `start_seq <= sequence_number <= end_seq`,
    /// ascending. Served by the `(request_id, sequence_number)` index.
    pub fn get_messages_in_range(
        &self,
        request_id: &str,
        start_seq: i64,
        end_seq: i64,
        limit: u32,
    ) -> Result<Vec<CachedMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE request_id = ?1 AND sequence_number BETWEEN ?2 AND ?3
             ORDER BY sequence_number ASC
             LIMIT ?4"
        ))?;

        let rows = stmt.query_map(params![request_id, start_seq, end_seq, limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// The `limit` newest confirmed messages, returned ascending.
    pub fn get_newest_messages(&self, request_id: &str, limit: u32) -> Result<Vec<CachedMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE request_id = ?1 AND sequence_number IS NOT NULL
             ORDER BY sequence_number DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![request_id, limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// The `limit` oldest confirmed messages, ascending.
    pub fn get_oldest_messages(&self, request_id: &str, limit: u32) -> Result<Vec<CachedMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE request_id = ?1 AND sequence_number IS NOT NULL
             ORDER BY sequence_number ASC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![request_id, limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn count_messages(&self, request_id: &str) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE request_id = ?1",
            params![request_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Sorted confirmed sequence numbers for one conversation, for gap
    /// detection.
    pub fn confirmed_sequences(&self, request_id: &str) -> Result<Vec<i64>> {
        let mut stmt = self.conn().prepare(
            "SELECT sequence_number FROM messages
             WHERE request_id = ?1 AND sequence_number IS NOT NULL
             ORDER BY sequence_number ASC",
        )?;

        let rows = stmt.query_map(params![request_id], |row| row.get(0))?;

        let mut sequences = Vec::new();
        for row in rows {
            sequences.push(row?);
        }
        Ok(sequences)
    }

    /// Delete the optimistic record for `temp_id` (if still present) and
    /// insert the confirmed message, as one transaction. Idempotent under
    /// at-least-once confirmation delivery.
    pub fn replace_optimistic(&mut self, temp_id: &str, confirmed: &CachedMessage) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        // The optimistic row may be keyed by the temp id directly or carry it
        // in temp_id; either way it must not survive alongside the confirmed
        // row. The confirmed row itself (same id) is excluded so a duplicate
        // confirmation cannot delete what it just inserted.
        tx.execute(
            "DELETE FROM messages WHERE (id = ?1 OR temp_id = ?1) AND id != ?2",
            params![temp_id, confirmed.id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO messages
                 (id, temp_id, request_id, sequence_number, content, sender_id, sender_name, sent_at, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                confirmed.id,
                confirmed.temp_id,
                confirmed.request_id,
                confirmed.sequence_number,
                confirmed.content,
                confirmed.sender_id,
                confirmed.sender_name,
                confirmed.sent_at.to_rfc3339(),
                confirmed.cached_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a conversation's messages and its sync-state row in one
    /// transaction.
    pub fn clear_request(&mut self, request_id: &str) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE request_id = ?1",
            params![request_id],
        )?;
        tx.execute(
            "DELETE FROM chat_sync_state WHERE request_id = ?1",
            params![request_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_messages_for_request(&self, request_id: &str) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE request_id = ?1",
            params![request_id],
        )?;
        Ok(affected)
    }

    /// Delete every message cached before `cutoff`. Served by the
    /// `cached_at` index. Returns the number of rows removed.
    pub fn delete_expired_messages(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE cached_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedMessage> {
    let sent_str: String = row.get(7)?;
    let cached_str: String = row.get(8)?;

    let sent_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&sent_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let cached_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&cached_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(CachedMessage {
        id: row.get(0)?,
        temp_id: row.get(1)?,
        request_id: row.get(2)?,
        sequence_number: row.get(3)?,
        content: row.get(4)?,
        sender_id: row.get(5)?,
        sender_name: row.get(6)?,
        sent_at,
        cached_at,
    })
}
