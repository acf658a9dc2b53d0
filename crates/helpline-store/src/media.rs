//! Typed CRUD for cached media metadata and blobs.
//!
//! A meta row with `download_status = completed` owns exactly one blob row
//! via `blob_key`; the pair is written and destroyed together in one
//! transaction. Total cache size is computed by scanning blob lengths on
//! demand so it can never drift from the stored bytes.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::{CachedMedia, DownloadStatus};

const MEDIA_COLUMNS: &str = "request_id, file_name, download_status, download_progress, \
     file_size, mime_type, sha256_hash, is_verified, blob_key, last_accessed_at, is_pinned, priority";

impl Database {
    pub fn upsert_media_meta(&self, meta: &CachedMedia) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO media_meta
                 (request_id, file_name, download_status, download_progress, file_size,
                  mime_type, sha256_hash, is_verified, blob_key, last_accessed_at, is_pinned, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                meta.request_id,
                meta.file_name,
                meta.download_status.as_str(),
                meta.download_progress,
                meta.file_size,
                meta.mime_type,
                meta.sha256_hash,
                meta.is_verified as i32,
                meta.blob_key,
                meta.last_accessed_at.to_rfc3339(),
                meta.is_pinned as i32,
                meta.priority,
            ],
        )?;
        Ok(())
    }

    pub fn get_media_meta(&self, request_id: &str, file_name: &str) -> Result<Option<CachedMedia>> {
        let meta = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MEDIA_COLUMNS} FROM media_meta
                     WHERE request_id = ?1 AND file_name = ?2"
                ),
                params![request_id, file_name],
                row_to_media,
            )
            .optional()?;
        Ok(meta)
    }

    /// Persist metadata and payload as one transaction.
    pub fn put_media(&mut self, meta: &CachedMedia, data: &[u8]) -> Result<()> {
        let blob_key = meta
            .blob_key
            .clone()
            .unwrap_or_else(|| CachedMedia::blob_key_for(&meta.request_id, &meta.file_name));

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO media_meta
                 (request_id, file_name, download_status, download_progress, file_size,
                  mime_type, sha256_hash, is_verified, blob_key, last_accessed_at, is_pinned, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                meta.request_id,
                meta.file_name,
                meta.download_status.as_str(),
                meta.download_progress,
                meta.file_size,
                meta.mime_type,
                meta.sha256_hash,
                meta.is_verified as i32,
                blob_key,
                meta.last_accessed_at.to_rfc3339(),
                meta.is_pinned as i32,
                meta.priority,
            ],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO media_blobs (blob_key, data, last_accessed_at)
             VALUES (?1, ?2, ?3)",
            params![blob_key, data, meta.last_accessed_at.to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_blob(&self, blob_key: &str) -> Result<Option<Vec<u8>>> {
        let data = self
            .conn()
            .query_row(
                "SELECT data FROM media_blobs WHERE blob_key = ?1",
                params![blob_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    /// Refresh the LRU timestamp on both the meta and blob rows.
    pub fn touch_media(&self, request_id: &str, file_name: &str, at: DateTime<Utc>) -> Result<()> {
        let ts = at.to_rfc3339();
        self.conn().execute(
            "UPDATE media_meta SET last_accessed_at = ?3
             WHERE request_id = ?1 AND file_name = ?2",
            params![request_id, file_name, ts],
        )?;
        self.conn().execute(
            "UPDATE media_blobs SET last_accessed_at = ?2 WHERE blob_key = ?1",
            params![CachedMedia::blob_key_for(request_id, file_name), ts],
        )?;
        Ok(())
    }

    pub fn set_media_pinned(&self, request_id: &str, file_name: &str, pinned: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE media_meta SET is_pinned = ?3
             WHERE request_id = ?1 AND file_name = ?2",
            params![request_id, file_name, pinned as i32],
        )?;
        Ok(affected > 0)
    }

    pub fn set_media_verified(
        &self,
        request_id: &str,
        file_name: &str,
        verified: bool,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE media_meta SET is_verified = ?3
             WHERE request_id = ?1 AND file_name = ?2",
            params![request_id, file_name, verified as i32],
        )?;
        Ok(affected > 0)
    }

    /// Remove one meta+blob pair. Returns the blob bytes freed, or `None`
    /// when no such media was cached.
    pub fn delete_media(&mut self, request_id: &str, file_name: &str) -> Result<Option<i64>> {
        let blob_key = CachedMedia::blob_key_for(request_id, file_name);
        let size: Option<i64> = self
            .conn()
            .query_row(
                "SELECT LENGTH(data) FROM media_blobs WHERE blob_key = ?1",
                params![blob_key],
                |row| row.get(0),
            )
            .optional()?;

        let tx = self.conn_mut().transaction()?;
        let meta_deleted = tx.execute(
            "DELETE FROM media_meta WHERE request_id = ?1 AND file_name = ?2",
            params![request_id, file_name],
        )?;
        tx.execute(
            "DELETE FROM media_blobs WHERE blob_key = ?1",
            params![blob_key],
        )?;
        tx.commit()?;

        if meta_deleted == 0 && size.is_none() {
            return Ok(None);
        }
        Ok(Some(size.unwrap_or(0)))
    }

    /// Remove all media for one conversation. Returns the blob bytes freed.
    pub fn delete_media_for_request(&mut self, request_id: &str) -> Result<i64> {
        let freed: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(LENGTH(b.data)), 0)
             FROM media_blobs b
             JOIN media_meta m ON m.blob_key = b.blob_key
             WHERE m.request_id = ?1",
            params![request_id],
            |row| row.get(0),
        )?;

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM media_blobs WHERE blob_key IN
                 (SELECT blob_key FROM media_meta WHERE request_id = ?1 AND blob_key IS NOT NULL)",
            params![request_id],
        )?;
        tx.execute(
            "DELETE FROM media_meta WHERE request_id = ?1",
            params![request_id],
        )?;
        tx.commit()?;

        Ok(freed)
    }

    /// Total bytes held in blob rows. An O(n) scan by design: always
    /// consistent with what is actually stored.
    pub fn total_media_size(&self) -> Result<i64> {
        let size = self.conn().query_row(
            "SELECT COALESCE(SUM(LENGTH(data)), 0) FROM media_blobs",
            [],
            |row| row.get(0),
        )?;
        Ok(size)
    }

    /// Completed, unpinned media ordered least-recently-accessed first.
    pub fn eviction_candidates(&self) -> Result<Vec<CachedMedia>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media_meta
             WHERE is_pinned = 0 AND download_status = 'completed'
             ORDER BY last_accessed_at ASC"
        ))?;

        let rows = stmt.query_map([], row_to_media)?;

        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }
        Ok(candidates)
    }
}

fn row_to_media(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedMedia> {
    let status_str: String = row.get(2)?;
    let accessed_str: String = row.get(9)?;
    let is_verified_int: i32 = row.get(7)?;
    let is_pinned_int: i32 = row.get(10)?;

    let download_status = DownloadStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown download status: {status_str}").into(),
        )
    })?;
    let last_accessed_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&accessed_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(CachedMedia {
        request_id: row.get(0)?,
        file_name: row.get(1)?,
        download_status,
        download_progress: row.get(3)?,
        file_size: row.get(4)?,
        mime_type: row.get(5)?,
        sha256_hash: row.get(6)?,
        is_verified: is_verified_int != 0,
        blob_key: row.get(8)?,
        last_accessed_at,
        is_pinned: is_pinned_int != 0,
        priority: row.get(11)?,
    })
}
