//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer over IPC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// CachedMessage
// ---------------------------------------------------------------------------

/// A single chat message as persisted locally.
///
/// A message is either *confirmed* (server-assigned `id` and
/// `sequence_number`) or *optimistic* (created by a local send, keyed by its
/// `temp_id`, no sequence number yet). On confirmation the optimistic record
/// is deleted and replaced by the confirmed one in a single transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedMessage {
    /// Message identifier. Server-assigned and stable once confirmed; for an
    /// optimistic record this equals the client-generated temp id.
    pub id: String,
    /// Client-generated identifier carried until the server confirms.
    pub temp_id: Option<String>,
    /// The support conversation this message belongs to.
    pub request_id: String,
    /// Server-assigned ordering authority. Strictly increasing and unique
    /// per `request_id`. `None` while the message is optimistic.
    pub sequence_number: Option<i64>,
    /// Message body.
    pub content: String,
    /// Identifier of the sender.
    pub sender_id: String,
    /// Display name of the sender at send time.
    pub sender_name: String,
    /// When the message was sent (as reported by the server or sender).
    pub sent_at: DateTime<Utc>,
    /// When this record was written locally. Drives TTL expiry.
    pub cached_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SequenceGap / ChatSyncState
// ---------------------------------------------------------------------------

/// A closed integer interval `[start_seq, end_seq]` of sequence numbers known
/// to be missing from the local cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceGap {
    pub start_seq: i64,
    pub end_seq: i64,
    pub detected_at: DateTime<Utc>,
}

impl SequenceGap {
    pub fn new(start_seq: i64, end_seq: i64) -> Self {
        Self {
            start_seq,
            end_seq,
            detected_at: Utc::now(),
        }
    }

    /// Two gaps are the same interval regardless of when they were detected.
    pub fn same_range(&self, other: &SequenceGap) -> bool {
        self.start_seq == other.start_seq && self.end_seq == other.end_seq
    }
}

/// Per-conversation synchronization bookkeeping. One row per `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatSyncState {
    pub request_id: String,
    /// High-water mark of confirmed contiguous sync. Only ever increases.
    pub last_synced_sequence: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Server-reported total message count for the conversation.
    pub total_message_count: i64,
    /// Number of messages cached locally.
    pub message_count: i64,
    /// Disjoint, non-overlapping missing ranges below `last_synced_sequence`.
    pub known_gaps: Vec<SequenceGap>,
    pub unread_count: i64,
    pub last_read_sequence: i64,
    pub last_read_at: Option<DateTime<Utc>>,
    /// Bytes of cached media attributable to this conversation. A cached
    /// estimate used for whole-conversation eviction scoring; the blob scan
    /// in the media layer is authoritative for the byte budget.
    pub media_size: i64,
    /// LRU key for whole-conversation eviction.
    pub last_accessed_at: DateTime<Utc>,
    pub server_revision: Option<String>,
}

impl ChatSyncState {
    /// A zeroed sync state for a conversation seen for the first time.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            last_synced_sequence: 0,
            last_synced_at: None,
            total_message_count: 0,
            message_count: 0,
            known_gaps: Vec::new(),
            unread_count: 0,
            last_read_sequence: 0,
            last_read_at: None,
            media_size: 0,
            last_accessed_at: Utc::now(),
            server_revision: None,
        }
    }
}

/// Partial update applied to a [`ChatSyncState`] via read-modify-write merge.
///
/// Fields left `None` keep their current value; in particular `known_gaps`
/// is never cleared unless explicitly included.
#[derive(Debug, Clone, Default)]
pub struct SyncStateUpdate {
    pub last_synced_sequence: Option<i64>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub total_message_count: Option<i64>,
    pub message_count: Option<i64>,
    pub known_gaps: Option<Vec<SequenceGap>>,
    pub unread_count: Option<i64>,
    pub last_read_sequence: Option<i64>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub media_size: Option<i64>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub server_revision: Option<String>,
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Download lifecycle of a cached attachment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Metadata for one cached attachment, keyed by `(request_id, file_name)`.
///
/// The binary payload lives in a separate blob row referenced by `blob_key`;
/// the meta record exclusively owns that reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedMedia {
    pub request_id: String,
    pub file_name: String,
    pub download_status: DownloadStatus,
    /// 0-100.
    pub download_progress: i64,
    pub file_size: i64,
    pub mime_type: String,
    /// Expected SHA-256 digest (hex), recorded at download time if known.
    pub sha256_hash: Option<String>,
    pub is_verified: bool,
    /// Key of the owned blob row, `request_id:file_name`. `None` until the
    /// payload has been persisted.
    pub blob_key: Option<String>,
    /// LRU key for per-blob eviction.
    pub last_accessed_at: DateTime<Utc>,
    /// Pinned media is exempt from automatic eviction.
    pub is_pinned: bool,
    pub priority: i64,
}

impl CachedMedia {
    /// Canonical blob key for a conversation/filename pair.
    pub fn blob_key_for(request_id: &str, file_name: &str) -> String {
        format!("{request_id}:{file_name}")
    }
}

// ---------------------------------------------------------------------------
// Offline queue
// ---------------------------------------------------------------------------

/// Kind of queued side effect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    SendMessage,
    MarkRead,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::MarkRead => "mark_read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "send_message" => Some(Self::SendMessage),
            "mark_read" => Some(Self::MarkRead),
            _ => None,
        }
    }
}

/// Processing state of a queued operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Eligible for processing once `next_retry_at` has passed.
    Pending,
    /// Picked up by the processor; a crash mid-execution leaves this visible.
    Syncing,
    /// Retries exhausted. Terminal until explicit caller intervention.
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "syncing" => Some(Self::Syncing),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A queued, not-yet-confirmed side effect (send, mark-read).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OfflineOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    /// Operation-specific payload handed verbatim to the executor.
    pub payload: Value,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest time the processor may pick this operation up again.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OfflineOperation {
    /// A fresh pending operation with zero retries.
    pub fn new(kind: OperationKind, payload: Value, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}
