//! Size-bounded local cache for binary attachments.
//!
//! The cache holds at most `max_cache_bytes`; once a download would push the
//! total past 90% of that ceiling, least-recently-used unpinned blobs are
//! evicted down to 80% so many downloads share the cost of one eviction
//! pass. Integrity is SHA-256 against the digest recorded at download time.
//!
//! Download failures are reported as a structured [`MediaDownloadResult`],
//! never as an error: callers check the `success` flag.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};

use helpline_store::{CachedMedia, DownloadStatus, SharedDatabase};

use crate::error::{CacheError, Result};
use crate::stats::CacheStats;

/// Default hard ceiling for cached media bytes.
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 512 * 1024 * 1024;

/// Fraction of the ceiling at which a download triggers eviction.
const EVICTION_TRIGGER_RATIO: f64 = 0.9;
/// Fraction of the ceiling eviction frees down to.
const EVICTION_TARGET_RATIO: f64 = 0.8;

/// Media cache sizing.
#[derive(Debug, Clone, Copy)]
pub struct MediaManagerConfig {
    pub max_cache_bytes: u64,
}

impl Default for MediaManagerConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
        }
    }
}

impl MediaManagerConfig {
    fn eviction_trigger(&self) -> u64 {
        (self.max_cache_bytes as f64 * EVICTION_TRIGGER_RATIO) as u64
    }

    fn eviction_target(&self) -> u64 {
        (self.max_cache_bytes as f64 * EVICTION_TARGET_RATIO) as u64
    }
}

/// Binary payload returned by the transport.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub data: Bytes,
    pub mime_type: String,
}

/// Binary-fetch-by-URL primitive. Implemented by the HTTP transport; any
/// rejection is surfaced in the download result.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedMedia>;
}

/// One attachment download.
#[derive(Debug, Clone)]
pub struct MediaDownloadRequest {
    pub request_id: String,
    pub file_name: String,
    pub url: String,
    /// Expected SHA-256 digest (hex), when the server advertises one.
    pub expected_sha256: Option<String>,
    pub priority: i64,
}

/// Structured outcome of [`MediaManager::download_media`].
#[derive(Debug, Clone)]
pub struct MediaDownloadResult {
    pub success: bool,
    pub from_cache: bool,
    pub file_size: u64,
    pub error: Option<String>,
}

/// A cached payload handed to the UI.
#[derive(Debug, Clone)]
pub struct MediaHandle {
    pub data: Bytes,
    pub mime_type: String,
    pub file_size: u64,
}

/// The attachment cache.
#[derive(Clone)]
pub struct MediaManager {
    db: SharedDatabase,
    stats: Arc<CacheStats>,
    fetcher: Arc<dyn MediaFetcher>,
    config: MediaManagerConfig,
}

impl MediaManager {
    pub fn new(
        db: SharedDatabase,
        stats: Arc<CacheStats>,
        fetcher: Arc<dyn MediaFetcher>,
        config: MediaManagerConfig,
    ) -> Self {
        Self {
            db,
            stats,
            fetcher,
            config,
        }
    }

    /// Fetch and cache one attachment, or return the cached copy.
    pub async fn download_media(&self, request: &MediaDownloadRequest) -> MediaDownloadResult {
        match self.download_media_inner(request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    request = %request.request_id,
                    file = %request.file_name,
                    error = %e,
                    "media download failed"
                );
                MediaDownloadResult {
                    success: false,
                    from_cache: false,
                    file_size: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn download_media_inner(
        &self,
        request: &MediaDownloadRequest,
    ) -> std::result::Result<MediaDownloadResult, anyhow::Error> {
        let file_name = sanitize_file_name(&request.file_name);

        // Already fully cached: refresh LRU and hand it straight back.
        {
            let db = self.db.lock().await;
            if let Some(meta) = db.get_media_meta(&request.request_id, &file_name)? {
                if meta.download_status == DownloadStatus::Completed {
                    if let Some(blob_key) = meta.blob_key.as_deref() {
                        if db.get_blob(blob_key)?.is_some() {
                            db.touch_media(&request.request_id, &file_name, Utc::now())?;
                            return Ok(MediaDownloadResult {
                                success: true,
                                from_cache: true,
                                file_size: meta.file_size as u64,
                                error: None,
                            });
                        }
                    }
                    // Meta without blob is an integrity violation, treated
                    // as not cached: fall through to a fresh download.
                }
            }
        }

        let fetched = match self.fetcher.fetch(&request.url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.record_failed_download(request, &file_name, &e.to_string())
                    .await;
                return Ok(MediaDownloadResult {
                    success: false,
                    from_cache: false,
                    file_size: 0,
                    error: Some(e.to_string()),
                });
            }
        };

        let size = fetched.data.len() as u64;
        let digest = hex::encode(Sha256::digest(&fetched.data));
        let is_verified = match request.expected_sha256.as_deref() {
            Some(expected) => expected.eq_ignore_ascii_case(&digest),
            // No expected hash: nothing to falsify.
            None => true,
        };
        if !is_verified {
            tracing::warn!(
                request = %request.request_id,
                file = %file_name,
                "downloaded media does not match expected hash"
            );
        }

        self.evict_for_incoming(size).await?;

        let meta = CachedMedia {
            request_id: request.request_id.clone(),
            file_name: file_name.clone(),
            download_status: DownloadStatus::Completed,
            download_progress: 100,
            file_size: size as i64,
            mime_type: fetched.mime_type.clone(),
            sha256_hash: request.expected_sha256.clone(),
            is_verified,
            blob_key: Some(CachedMedia::blob_key_for(&request.request_id, &file_name)),
            last_accessed_at: Utc::now(),
            is_pinned: false,
            priority: request.priority,
        };

        {
            let mut db = self.db.lock().await;
            db.put_media(&meta, &fetched.data)?;
        }
        self.adjust_request_media_size(&request.request_id, size as i64)
            .await;

        tracing::debug!(
            request = %request.request_id,
            file = %file_name,
            size,
            "cached media download"
        );

        Ok(MediaDownloadResult {
            success: true,
            from_cache: false,
            file_size: size,
            error: None,
        })
    }

    /// Return the cached payload, or `None` when not (fully) cached. A meta
    /// record whose blob is missing counts as not cached, never as an error.
    pub async fn media(&self, request_id: &str, file_name: &str) -> Result<Option<MediaHandle>> {
        let file_name = sanitize_file_name(file_name);

        let handle = {
            let db = self.db.lock().await;
            let Some(meta) = db.get_media_meta(request_id, &file_name)? else {
                return Ok(None);
            };
            if meta.download_status != DownloadStatus::Completed {
                return Ok(None);
            }
            let Some(blob_key) = meta.blob_key.as_deref() else {
                return Ok(None);
            };
            let Some(data) = db.get_blob(blob_key)? else {
                tracing::warn!(request = request_id, file = %file_name, "media blob missing for completed meta");
                return Ok(None);
            };
            MediaHandle {
                file_size: data.len() as u64,
                data: Bytes::from(data),
                mime_type: meta.mime_type,
            }
        };

        // LRU refresh must not delay the read.
        let db = self.db.clone();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            let db = db.lock().await;
            if let Err(e) = db.touch_media(&request_id, &file_name, Utc::now()) {
                tracing::debug!(error = %e, "failed to refresh media access time");
            }
        });

        Ok(Some(handle))
    }

    /// Exempt one attachment from automatic eviction.
    pub async fn pin_media(&self, request_id: &str, file_name: &str) -> Result<bool> {
        let db = self.db.lock().await;
        Ok(db.set_media_pinned(request_id, &sanitize_file_name(file_name), true)?)
    }

    pub async fn unpin_media(&self, request_id: &str, file_name: &str) -> Result<bool> {
        let db = self.db.lock().await;
        Ok(db.set_media_pinned(request_id, &sanitize_file_name(file_name), false)?)
    }

    /// Recompute the stored blob's SHA-256 and compare with the digest
    /// recorded at download time. A mismatch is recorded on the metadata but
    /// the blob is left in place; corruption handling is the caller's call.
    pub async fn verify_integrity(&self, request_id: &str, file_name: &str) -> Result<bool> {
        let file_name = sanitize_file_name(file_name);
        let db = self.db.lock().await;

        let meta = db
            .get_media_meta(request_id, &file_name)?
            .ok_or(CacheError::NotFound)?;

        let Some(expected) = meta.sha256_hash.as_deref() else {
            // No recorded digest: no claim can be falsified.
            db.set_media_verified(request_id, &file_name, true)?;
            return Ok(true);
        };

        let blob = meta
            .blob_key
            .as_deref()
            .map(|key| db.get_blob(key))
            .transpose()?
            .flatten();
        let Some(data) = blob else {
            db.set_media_verified(request_id, &file_name, false)?;
            return Ok(false);
        };

        let actual = hex::encode(Sha256::digest(&data));
        let valid = expected.eq_ignore_ascii_case(&actual);
        db.set_media_verified(request_id, &file_name, valid)?;
        if !valid {
            tracing::warn!(request = request_id, file = %file_name, "media integrity check failed");
        }
        Ok(valid)
    }

    /// Explicit single-item removal, independent of LRU policy.
    pub async fn evict_media(&self, request_id: &str, file_name: &str) -> Result<bool> {
        let file_name = sanitize_file_name(file_name);
        let freed = {
            let mut db = self.db.lock().await;
            db.delete_media(request_id, &file_name)?
        };
        match freed {
            Some(bytes) => {
                self.adjust_request_media_size(request_id, -bytes).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Total cached bytes, measured by scanning blob rows.
    pub async fn cache_size(&self) -> Result<u64> {
        let db = self.db.lock().await;
        Ok(db.total_media_size()? as u64)
    }

    /// Evict unpinned completed blobs strictly oldest-access-first until at
    /// least `bytes_to_free` is reclaimed or no candidates remain. Pinned
    /// media is never touched, so the freed total may fall short.
    pub async fn evict_oldest(&self, bytes_to_free: u64) -> Result<u64> {
        let candidates = {
            let db = self.db.lock().await;
            db.eviction_candidates()?
        };

        let mut freed: u64 = 0;
        for candidate in candidates {
            if freed >= bytes_to_free {
                break;
            }
            let removed = {
                let mut db = self.db.lock().await;
                db.delete_media(&candidate.request_id, &candidate.file_name)?
            };
            if let Some(bytes) = removed {
                freed += bytes as u64;
                self.adjust_request_media_size(&candidate.request_id, -bytes)
                    .await;
                self.stats.record_eviction();
                tracing::debug!(
                    request = %candidate.request_id,
                    file = %candidate.file_name,
                    bytes,
                    "evicted media"
                );
            }
        }

        if freed < bytes_to_free {
            tracing::info!(
                freed,
                requested = bytes_to_free,
                "eviction fell short; remaining media is pinned or absent"
            );
        }
        Ok(freed)
    }

    /// Free space ahead of persisting `incoming_size` new bytes, if the
    /// write would cross the eviction trigger.
    async fn evict_for_incoming(&self, incoming_size: u64) -> Result<()> {
        let current = self.cache_size().await?;
        let trigger = self.config.eviction_trigger();
        if current + incoming_size <= trigger {
            return Ok(());
        }

        let target = self.config.eviction_target();
        let to_free = (current + incoming_size).saturating_sub(target);
        tracing::info!(
            current,
            incoming_size,
            trigger,
            to_free,
            "media cache over trigger; evicting"
        );
        self.evict_oldest(to_free).await?;
        Ok(())
    }

    /// Keep the per-conversation `media_size` estimate roughly current. The
    /// blob scan stays authoritative; this only feeds eviction scoring.
    async fn adjust_request_media_size(&self, request_id: &str, delta: i64) {
        let db = self.db.lock().await;
        let result = (|| -> std::result::Result<(), helpline_store::StoreError> {
            if let Some(mut state) = db.get_sync_state(request_id)? {
                state.media_size = (state.media_size + delta).max(0);
                db.put_sync_state(&state)?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            tracing::debug!(error = %e, "failed to update media size estimate");
        }
    }

    async fn record_failed_download(
        &self,
        request: &MediaDownloadRequest,
        file_name: &str,
        _error: &str,
    ) {
        let meta = CachedMedia {
            request_id: request.request_id.clone(),
            file_name: file_name.to_string(),
            download_status: DownloadStatus::Failed,
            download_progress: 0,
            file_size: 0,
            mime_type: String::new(),
            sha256_hash: request.expected_sha256.clone(),
            is_verified: false,
            blob_key: None,
            last_accessed_at: Utc::now(),
            is_pinned: false,
            priority: request.priority,
        };
        let db = self.db.lock().await;
        if let Err(e) = db.upsert_media_meta(&meta) {
            tracing::debug!(error = %e, "failed to record failed download");
        }
    }
}

/// Replace filesystem- and key-hostile characters. Attachment names come
/// from remote senders and end up in compound keys.
fn sanitize_file_name(file_name: &str) -> String {
    file_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use helpline_store::Database;

    /// Serves `size` bytes for any URL, or rejects everything.
    struct FakeFetcher {
        size: usize,
        fail: bool,
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<FetchedMedia> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            let _ = url;
            Ok(FetchedMedia {
                data: Bytes::from(vec![0xAB; self.size]),
                mime_type: "image/png".into(),
            })
        }
    }

    fn manager(size: usize, fail: bool, max_bytes: u64) -> (tempfile::TempDir, MediaManager) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        let shared: SharedDatabase = Arc::new(tokio::sync::Mutex::new(db));
        let manager = MediaManager::new(
            shared,
            Arc::new(CacheStats::new()),
            Arc::new(FakeFetcher { size, fail }),
            MediaManagerConfig {
                max_cache_bytes: max_bytes,
            },
        );
        (dir, manager)
    }

    fn req(request_id: &str, file_name: &str) -> MediaDownloadRequest {
        MediaDownloadRequest {
            request_id: request_id.into(),
            file_name: file_name.into(),
            url: format!("https://files.example/{request_id}/{file_name}"),
            expected_sha256: None,
            priority: 0,
        }
    }

    #[tokio::test]
    async fn second_download_comes_from_cache() {
        let (_dir, manager) = manager(64, false, 1_000_000);

        let first = manager.download_media(&req("req-1", "a.png")).await;
        assert!(first.success);
        assert!(!first.from_cache);
        assert_eq!(first.file_size, 64);

        let second = manager.download_media(&req("req-1", "a.png")).await;
        assert!(second.success);
        assert!(second.from_cache);
    }

    #[tokio::test]
    async fn fetch_failure_is_a_structured_result() {
        let (_dir, manager) = manager(0, true, 1_000_000);

        let result = manager.download_media(&req("req-1", "a.png")).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("connection refused"));

        // Failure is retryable: nothing cached, status recorded as failed.
        assert!(manager.media("req-1", "a.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eviction_respects_pinning() {
        let (_dir, manager) = manager(100, false, 1_000_000);

        // A is pinned and least-recently-used; B is unpinned and newer.
        manager.download_media(&req("req-1", "a.png")).await;
        manager.pin_media("req-1", "a.png").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.download_media(&req("req-1", "b.png")).await;

        let freed = manager.evict_oldest(100).await.unwrap();
        assert_eq!(freed, 100);
        assert!(manager.media("req-1", "a.png").await.unwrap().is_some());
        assert!(manager.media("req-1", "b.png").await.unwrap().is_none());

        // Only pinned media left: eviction falls short rather than touch it.
        let freed = manager.evict_oldest(100).await.unwrap();
        assert_eq!(freed, 0);
        assert!(manager.media("req-1", "a.png").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn small_budget_still_evicts_whole_oldest_item() {
        let (_dir, manager) = manager(100, false, 1_000_000);
        manager.download_media(&req("req-1", "a.png")).await;

        // Requesting 10 bytes evicts the full 100-byte item.
        let freed = manager.evict_oldest(10).await.unwrap();
        assert_eq!(freed, 100);
        assert_eq!(manager.cache_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn verify_integrity_records_mismatch_without_evicting() {
        let (_dir, manager) = manager(32, false, 1_000_000);

        let mut request = req("req-1", "a.png");
        request.expected_sha256 = Some("00".repeat(32));
        let result = manager.download_media(&request).await;
        assert!(result.success);

        assert!(!manager.verify_integrity("req-1", "a.png").await.unwrap());
        // Corrupt media stays cached; handling is the caller's decision.
        assert!(manager.media("req-1", "a.png").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_expected_hash_is_trivially_valid() {
        let (_dir, manager) = manager(32, false, 1_000_000);
        manager.download_media(&req("req-1", "a.png")).await;
        assert!(manager.verify_integrity("req-1", "a.png").await.unwrap());
    }

    #[tokio::test]
    async fn crossing_trigger_evicts_down_to_target() {
        // Ceiling 1000: trigger at 900, target at 800.
        let (_dir, manager) = manager(300, false, 1_000);

        manager.download_media(&req("req-1", "a.png")).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.download_media(&req("req-1", "b.png")).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.download_media(&req("req-1", "c.png")).await;
        assert_eq!(manager.cache_size().await.unwrap(), 900);

        // 900 + 300 > 900 triggers eviction of 1200 - 800 = 400 bytes, i.e.
        // the two oldest items.
        manager.download_media(&req("req-1", "d.png")).await;
        assert_eq!(manager.cache_size().await.unwrap(), 600);
        assert!(manager.media("req-1", "a.png").await.unwrap().is_none());
        assert!(manager.media("req-1", "b.png").await.unwrap().is_none());
        assert!(manager.media("req-1", "c.png").await.unwrap().is_some());
        assert!(manager.media("req-1", "d.png").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn explicit_evict_and_sanitized_names() {
        let (_dir, manager) = manager(16, false, 1_000_000);
        manager.download_media(&req("req-1", "weird:name?.png")).await;

        assert!(manager.media("req-1", "weird:name?.png").await.unwrap().is_some());
        assert!(manager.evict_media("req-1", "weird:name?.png").await.unwrap());
        assert!(!manager.evict_media("req-1", "weird:name?.png").await.unwrap());
    }
}
