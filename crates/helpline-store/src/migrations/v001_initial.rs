//! v001 -- Initial schema creation.
//!
//! Creates the six core tables: `messages`, `chat_sync_state`, `media_meta`,
//! `media_blobs`, `offline_queue`, and `meta_kv`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Cached messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- server id, or temp id while optimistic
    temp_id         TEXT,                       -- client-generated id, kept after confirmation
    request_id      TEXT NOT NULL,              -- owning conversation
    sequence_number INTEGER,                    -- server ordering authority; NULL while optimistic
    content         TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    sender_name     TEXT NOT NULL,
    sent_at         TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    cached_at       TEXT NOT NULL               -- local write time, drives TTL expiry
);

CREATE INDEX IF NOT EXISTS idx_messages_request ON messages(request_id);

-- No two confirmed messages in one conversation may share a sequence number.
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_request_seq
    ON messages(request_id, sequence_number)
    WHERE sequence_number IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_messages_temp_id ON messages(temp_id);
CREATE INDEX IF NOT EXISTS idx_messages_cached_at ON messages(cached_at);

-- ----------------------------------------------------------------
-- Per-conversation sync state
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_sync_state (
    request_id           TEXT PRIMARY KEY NOT NULL,
    last_synced_sequence INTEGER NOT NULL DEFAULT 0,
    last_synced_at       TEXT,
    total_message_count  INTEGER NOT NULL DEFAULT 0,
    message_count        INTEGER NOT NULL DEFAULT 0,
    known_gaps           TEXT NOT NULL DEFAULT '[]',  -- JSON array of {startSeq,endSeq,detectedAt}
    unread_count         INTEGER NOT NULL DEFAULT 0,
    last_read_sequence   INTEGER NOT NULL DEFAULT 0,
    last_read_at         TEXT,
    media_size           INTEGER NOT NULL DEFAULT 0,
    last_accessed_at     TEXT NOT NULL,
    server_revision      TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_state_accessed ON chat_sync_state(last_accessed_at);

-- ----------------------------------------------------------------
-- Media metadata
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS media_meta (
    request_id        TEXT NOT NULL,
    file_name         TEXT NOT NULL,
    download_status   TEXT NOT NULL,             -- pending | completed | failed
    download_progress INTEGER NOT NULL DEFAULT 0,
    file_size         INTEGER NOT NULL DEFAULT 0,
    mime_type         TEXT NOT NULL DEFAULT '',
    sha256_hash       TEXT,                      -- expected digest, hex
    is_verified       INTEGER NOT NULL DEFAULT 0,
    blob_key          TEXT,                      -- FK-by-convention -> media_blobs(blob_key)
    last_accessed_at  TEXT NOT NULL,
    is_pinned         INTEGER NOT NULL DEFAULT 0,
    priority          INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (request_id, file_name)
);

CREATE INDEX IF NOT EXISTS idx_media_meta_request ON media_meta(request_id);
CREATE INDEX IF NOT EXISTS idx_media_meta_accessed ON media_meta(last_accessed_at);
CREATE INDEX IF NOT EXISTS idx_media_meta_status ON media_meta(download_status);

-- ----------------------------------------------------------------
-- Media blobs
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS media_blobs (
    blob_key         TEXT PRIMARY KEY NOT NULL,  -- request_id:file_name
    data             BLOB NOT NULL,
    last_accessed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_media_blobs_accessed ON media_blobs(last_accessed_at);

-- ----------------------------------------------------------------
-- Offline operation queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS offline_queue (
    id            TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    kind          TEXT NOT NULL,                 -- send_message | mark_read
    payload       TEXT NOT NULL,                 -- JSON, opaque to the store
    status        TEXT NOT NULL,                 -- pending | syncing | failed
    retry_count   INTEGER NOT NULL DEFAULT 0,
    max_retries   INTEGER NOT NULL DEFAULT 5,
    next_retry_at TEXT,
    last_error    TEXT,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_status ON offline_queue(status);
CREATE INDEX IF NOT EXISTS idx_queue_created ON offline_queue(created_at);
CREATE INDEX IF NOT EXISTS idx_queue_retry ON offline_queue(next_retry_at);

-- ----------------------------------------------------------------
-- Small key-value records (statistics snapshot, markers)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS meta_kv (
    key   TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
