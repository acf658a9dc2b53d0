//! # helpline-cache
//!
//! Asynchronous cache layer over [`helpline_store`]: the message cache (CRUD,
//! queries, gap detection, eviction, TTL expiry), the media manager
//! (size-bounded attachment cache with LRU eviction, pinning, and integrity
//! verification), and passive cache statistics.
//!
//! Everything here goes through a [`SharedDatabase`] handle; the lock is held
//! only for the duration of one synchronous storage operation, never across
//! an await on the network.
//!
//! [`SharedDatabase`]: helpline_store::SharedDatabase

pub mod media_manager;
pub mod message_cache;
pub mod stats;

mod error;

pub use error::CacheError;
pub use media_manager::{
    FetchedMedia, MediaDownloadRequest, MediaDownloadResult, MediaFetcher, MediaHandle,
    MediaManager, MediaManagerConfig,
};
pub use message_cache::MessageCache;
pub use stats::{CacheStats, StatsSnapshot};
