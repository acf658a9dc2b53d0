//! Typed CRUD for per-conversation sync state.
//!
//! `known_gaps` is persisted as a JSON array column; it is small (bounded by
//! the gap-saturation threshold) and only ever read or written whole.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::{ChatSyncState, SequenceGap};

const STATE_COLUMNS: &str = "request_id, last_synced_sequence, last_synced_at, \
     total_message_count, message_count, known_gaps, unread_count, \
     last_read_sequence, last_read_at, media_size, last_accessed_at, server_revision";

impl Database {
    pub fn get_sync_state(&self, request_id: &str) -> Result<Option<ChatSyncState>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {STATE_COLUMNS} FROM chat_sync_state WHERE request_id = ?1"),
                params![request_id],
                row_to_raw_state,
            )
            .optional()?;

        match row {
            Some(raw) => Ok(Some(raw.try_into_state()?)),
            None => Ok(None),
        }
    }

    pub fn put_sync_state(&self, state: &ChatSyncState) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO chat_sync_state
                 (request_id, last_synced_sequence, last_synced_at, total_message_count,
                  message_count, known_gaps, unread_count, last_read_sequence, last_read_at,
                  media_size, last_accessed_at, server_revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                state.request_id,
                state.last_synced_sequence,
                state.last_synced_at.map(|t| t.to_rfc3339()),
                state.total_message_count,
                state.message_count,
                serde_json::to_string(&state.known_gaps)?,
                state.unread_count,
                state.last_read_sequence,
                state.last_read_at.map(|t| t.to_rfc3339()),
                state.media_size,
                state.last_accessed_at.to_rfc3339(),
                state.server_revision,
            ],
        )?;
        Ok(())
    }

    pub fn delete_sync_state(&self, request_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM chat_sync_state WHERE request_id = ?1",
            params![request_id],
        )?;
        Ok(affected > 0)
    }

    /// All sync states ordered least-recently-accessed first, for
    /// whole-conversation LRU eviction.
    pub fn sync_states_by_last_access(&self) -> Result<Vec<ChatSyncState>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM chat_sync_state ORDER BY last_accessed_at ASC"
        ))?;

        let rows = stmt.query_map([], row_to_raw_state)?;

        let mut states = Vec::new();
        for row in rows {
            states.push(row?.try_into_state()?);
        }
        Ok(states)
    }
}

/// Intermediate row form: timestamp/JSON parsing happens outside the rusqlite
/// mapper so parse failures surface as store errors, not column errors.
struct RawState {
    request_id: String,
    last_synced_sequence: i64,
    last_synced_at: Option<String>,
    total_message_count: i64,
    message_count: i64,
    known_gaps: String,
    unread_count: i64,
    last_read_sequence: i64,
    last_read_at: Option<String>,
    media_size: i64,
    last_accessed_at: String,
    server_revision: Option<String>,
}

impl RawState {
    fn try_into_state(self) -> Result<ChatSyncState> {
        let known_gaps: Vec<SequenceGap> = serde_json::from_str(&self.known_gaps)?;
        Ok(ChatSyncState {
            request_id: self.request_id,
            last_synced_sequence: self.last_synced_sequence,
            last_synced_at: parse_opt_ts(self.last_synced_at)?,
            total_message_count: self.total_message_count,
            message_count: self.message_count,
            known_gaps,
            unread_count: self.unread_count,
            last_read_sequence: self.last_read_sequence,
            last_read_at: parse_opt_ts(self.last_read_at)?,
            media_size: self.media_size,
            last_accessed_at: parse_ts(&self.last_accessed_at)?,
            server_revision: self.server_revision,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn row_to_raw_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawState> {
    Ok(RawState {
        request_id: row.get(0)?,
        last_synced_sequence: row.get(1)?,
        last_synced_at: row.get(2)?,
        total_message_count: row.get(3)?,
        message_count: row.get(4)?,
        known_gaps: row.get(5)?,
        unread_count: row.get(6)?,
        last_read_sequence: row.get(7)?,
        last_read_at: row.get(8)?,
        media_size: row.get(9)?,
        last_accessed_at: row.get(10)?,
        server_revision: row.get(11)?,
    })
}
