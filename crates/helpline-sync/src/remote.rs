//! External collaborator seams.
//!
//! The engine consumes a fetch-based source of truth and an operation
//! executor; both are implemented by the HTTP transport layer, not here.
//! Implementors reject on failure -- the engine treats any rejection as
//! retryable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use helpline_store::{CachedMessage, OfflineOperation};

/// Bounds for one message fetch. All fields optional; an empty window means
/// "the most recent messages up to `limit`".
#[derive(Debug, Clone, Default)]
pub struct FetchWindow {
    /// Exclusive lower bound: only messages with a greater sequence number.
    pub since_sequence: Option<i64>,
    /// Inclusive range bounds for gap filling.
    pub start_sequence: Option<i64>,
    pub end_sequence: Option<i64>,
    pub limit: Option<u32>,
}

impl FetchWindow {
    pub fn since(sequence: i64, limit: u32) -> Self {
        Self {
            since_sequence: Some(sequence),
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn range(start_sequence: i64, end_sequence: i64) -> Self {
        Self {
            start_sequence: Some(start_sequence),
            end_sequence: Some(end_sequence),
            ..Default::default()
        }
    }

    pub fn newest(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }
}

/// A server-confirmed message as returned by the fetch collaborator. Always
/// carries a sequence number; optimistic records never come from the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: String,
    pub temp_id: Option<String>,
    pub request_id: String,
    pub sequence_number: i64,
    pub content: String,
    pub sender_id: String,
    pub sender_name: String,
    pub sent_at: DateTime<Utc>,
}

impl RemoteMessage {
    /// Local cache form, stamped with the local write time.
    pub fn into_cached(self) -> CachedMessage {
        CachedMessage {
            id: self.id,
            temp_id: self.temp_id,
            request_id: self.request_id,
            sequence_number: Some(self.sequence_number),
            content: self.content,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            sent_at: self.sent_at,
            cached_at: Utc::now(),
        }
    }
}

/// Fetch messages for one conversation within a window. Results may come
/// back unsorted; the engine re-sorts.
#[async_trait]
pub trait MessageFetcher: Send + Sync {
    async fn fetch_messages(
        &self,
        request_id: &str,
        window: &FetchWindow,
    ) -> anyhow::Result<Vec<RemoteMessage>>;
}

/// Execute one queued offline operation against the server. Rejection means
/// "retry later"; resolution means the side effect is confirmed.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &OfflineOperation) -> anyhow::Result<()>;
}
