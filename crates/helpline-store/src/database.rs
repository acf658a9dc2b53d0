//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees
//! that migrations are run before any other operation. Each user gets their
//! own database file so that switching accounts never mixes cached history.
//!
//! Schema-version skew (an on-disk database written by a *newer* build) is
//! handled by destructive rebuild: [`Database::rebuild_if_incompatible`]
//! deletes the file and the caller reinitializes from the server. An *older*
//! on-disk version is the normal upgrade path and is migrated in place.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::{Connection, OpenFlags};

use crate::error::{Result, StoreError};
use crate::migrations;

/// How long a connection waits on a lock held by another handle before
/// surfacing SQLITE_BUSY. Open contention logs and waits rather than failing.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database for one user.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/helpline/cache-{user}.db`
    /// - macOS:   `~/Library/Application Support/com.helpline.helpline/cache-{user}.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\helpline\helpline\data\cache-{user}.db`
    pub fn open_for_user(user_id: &str) -> Result<Self> {
        let db_path = Self::path_for_user(user_id)?;

        tracing::info!(user = user_id, path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    ///
    /// This is useful for tests and for embedding the store inside custom
    /// directory layouts.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Recommended SQLite settings. The busy timeout makes an open that is
        // blocked by another process handle wait instead of erroring out.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Resolve the database file path for one user without opening it.
    pub fn path_for_user(user_id: &str) -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "helpline", "helpline").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        Ok(data_dir.join(format!("cache-{user_id}.db")))
    }

    /// Compare the on-disk schema version against this build's expected
    /// version without mutating any data.
    ///
    /// Returns `Ok(())` when the versions are compatible (equal, or on-disk
    /// older -- the normal upgrade path), and [`StoreError::SchemaMismatch`]
    /// when the on-disk database was written by a newer build.
    pub fn check_schema_version(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        // Read-only open so the check itself can never migrate or rebuild.
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        drop(conn);

        if found > migrations::CURRENT_VERSION {
            tracing::warn!(
                found,
                expected = migrations::CURRENT_VERSION,
                path = %path.display(),
                "on-disk schema is newer than this build"
            );
            return Err(StoreError::SchemaMismatch {
                found,
                expected: migrations::CURRENT_VERSION,
            });
        }

        Ok(())
    }

    /// Delete the database file if its schema version is incompatible.
    ///
    /// Fail-safe for genuine version skew only: a normal version bump (older
    /// on-disk version) is migrated in place by [`Database::open_at`] and
    /// never reaches the destructive branch. Returns `true` when a rebuild
    /// happened and the caller must reinitialize.
    ///
    /// Deletion blocked by another open handle surfaces as an I/O error; the
    /// caller must close all handles (see [`StoreRegistry::close`]) and retry.
    ///
    /// [`StoreRegistry::close`]: crate::registry::StoreRegistry::close
    pub fn rebuild_if_incompatible(path: &Path) -> Result<bool> {
        match Self::check_schema_version(path) {
            Ok(()) => Ok(false),
            Err(StoreError::SchemaMismatch { found, expected }) => {
                tracing::warn!(
                    found,
                    expected,
                    path = %path.display(),
                    "rebuilding incompatible local cache"
                );
                std::fs::remove_file(path)?;
                // WAL sidecar files are recreated on next open; remove them
                // so a stale WAL cannot resurrect old pages.
                let _ = std::fs::remove_file(path.with_extension("db-wal"));
                let _ = std::fs::remove_file(path.with_extension("db-shm"));
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    ///
    /// Callers should prefer the typed CRUD helpers, but direct access is
    /// occasionally needed for transactions or ad-hoc queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return a mutable reference to the underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}
