use thiserror::Error;

/// Errors produced by the sync engine.
///
/// Sync entry points (`sync_chat`, `full_resync`, queue draining) catch these
/// at the operation boundary and convert them into structured reports; they
/// surface directly only from bookkeeping calls such as `queue_operation`.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Underlying storage failure.
    #[error("Store error: {0}")]
    Store(#[from] helpline_store::StoreError),

    /// Cache layer failure.
    #[error("Cache error: {0}")]
    Cache(#[from] helpline_cache::CacheError),

    /// The remote fetch collaborator rejected a request.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// A referenced record does not exist.
    #[error("Record not found")]
    NotFound,

    /// A queue operation was in a state the requested action does not apply
    /// to (e.g. discarding an operation that is not `failed`).
    #[error("Operation is {0}; action only applies to failed operations")]
    InvalidOperationState(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
