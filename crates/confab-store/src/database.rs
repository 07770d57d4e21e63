//! The SQLite handle shared by every store component.
//!
//! Opening a [`Database`] brings the schema up to date, so a handle that
//! exists is always safe to query.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};

use crate::error::{Result, StoreError};
use crate::groups::GroupDirectory;
use crate::messages::MessageStore;
use crate::migrations;
use crate::rooms::RoomDirectory;
use crate::unread::UnreadTracker;

/// How long a writer waits for another connection's lock before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One connection to the message store.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open `confab.db` in the platform data directory, creating it on first use:
    /// - Linux:   `~/.local/share/confab/confab.db`
    /// - macOS:   `~/Library/Application Support/com.confab.confab/confab.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\confab\confab\data\confab.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "confab", "confab").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("confab.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open `path`, creating the file and its parent directory if needed.
    ///
    /// Several handles may open the same file; writers serialize on SQLite's
    /// lock and wait up to [`DEFAULT_BUSY_TIMEOUT`] for it.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Open an existing, already migrated file for reads only.
    ///
    /// In WAL mode these handles read a committed snapshot and never wait on
    /// a writer. Any write through one fails with a storage error.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    /// Open a private in-memory database. Used by tests and tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Raw connection for ad-hoc queries. Prefer the component accessors.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// `None` for in-memory databases.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().filter(|p| !p.is_empty()).map(PathBuf::from)
    }

    /// Run `f` inside an immediate write transaction.
    ///
    /// The write lock is taken up front, so two connections racing on the
    /// same rows queue behind each other instead of failing at commit. If
    /// `f` returns an error the transaction is rolled back and none of its
    /// writes are observable.
    pub fn write<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn messages(&self) -> MessageStore<'_> {
        MessageStore::new(&self.conn)
    }

    pub fn rooms(&self) -> RoomDirectory<'_> {
        RoomDirectory::new(&self.conn)
    }

    pub fn groups(&self) -> GroupDirectory<'_> {
        GroupDirectory::new(&self.conn)
    }

    pub fn unread(&self) -> UnreadTracker<'_> {
        UnreadTracker::new(&self.conn)
    }
}
