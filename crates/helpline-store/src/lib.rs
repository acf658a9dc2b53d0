//! # helpline-store
//!
//! Local persistence for the Helpline support-chat client, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every persisted
//! collection: cached messages, per-conversation sync state, media metadata
//! and blobs, the offline operation queue, and a small key-value table.
//!
//! Higher layers (`helpline-cache`, `helpline-sync`) never touch SQL
//! directly; this crate is the only seam allowed to change the physical
//! representation.

pub mod database;
pub mod kv;
pub mod media;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod queue;
pub mod registry;
pub mod sync_state;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
pub use registry::{SharedDatabase, StoreRegistry};
