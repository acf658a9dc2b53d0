//! # helpline-sync
//!
//! The synchronization engine: reconciles the server's append-only,
//! sequence-ordered message history with the local cache. Orchestrates delta
//! sync, full resync, and gap filling per conversation, and drains a durable
//! offline operation queue with exponential backoff when connectivity
//! returns.
//!
//! The engine consumes -- but does not implement -- the remote transport:
//! see the [`remote`] traits. `sync_chat`, `full_resync`, and queue
//! processing never propagate transport or storage errors to the caller;
//! outcomes are structured reports with a `success` flag.

pub mod backoff;
pub mod engine;
pub mod queue;
pub mod remote;

mod error;

#[cfg(test)]
mod testutil;

pub use engine::{GapFillReport, SyncEngine, SyncEngineConfig, SyncMode, SyncOptions, SyncReport};
pub use error::SyncError;
pub use queue::QueueDrainReport;
pub use remote::{FetchWindow, MessageFetcher, OperationExecutor, RemoteMessage};
