//! Keyed registry of shared database handles.
//!
//! At most one live connection may exist per logical database, otherwise a
//! schema upgrade in one handle deadlocks against the other. The registry
//! owns that guarantee: [`StoreRegistry::open`] returns the same
//! [`SharedDatabase`] for the same user until [`StoreRegistry::close`] drops
//! it (user switch, or before a destructive rebuild).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::database::Database;
use crate::error::Result;

/// A process-wide shareable database handle. The async layers lock it for
/// the duration of one synchronous storage operation, never across an await.
pub type SharedDatabase = Arc<tokio::sync::Mutex<Database>>;

/// Lifecycle-managed cache of per-user database handles.
#[derive(Default)]
pub struct StoreRegistry {
    handles: Mutex<HashMap<String, SharedDatabase>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the database for `user_id`, or return the already-open handle.
    pub fn open(&self, user_id: &str) -> Result<SharedDatabase> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = handles.get(user_id) {
            tracing::debug!(user = user_id, "reusing open database handle");
            return Ok(existing.clone());
        }

        let db = Database::open_for_user(user_id)?;
        let shared: SharedDatabase = Arc::new(tokio::sync::Mutex::new(db));
        handles.insert(user_id.to_string(), shared.clone());
        Ok(shared)
    }

    /// Drop the registry's handle for `user_id`.
    ///
    /// The connection closes once every clone of the `Arc` is gone; callers
    /// performing a destructive rebuild must close before deleting the file.
    pub fn close(&self, user_id: &str) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if handles.remove(user_id).is_some() {
            tracing::info!(user = user_id, "released database handle");
        }
    }

    /// Number of currently registered handles.
    pub fn open_count(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
