use thiserror::Error;

/// Errors produced by the cache layer.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Underlying storage failure.
    #[error("Store error: {0}")]
    Store(#[from] helpline_store::StoreError),

    /// A referenced record does not exist.
    #[error("Record not found")]
    NotFound,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
