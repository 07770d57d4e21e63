//! Schema migrations.
//!
//! Every open checks `user_version` and applies the missing steps in order.
//! Steps never change once released; schema changes get a new module.

pub mod v001_initial;
pub mod v002_client_tokens;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::{Result, StoreError};

/// Schema version written to `user_version` once every step below has run.
pub(crate) const CURRENT_VERSION: u32 = 2;

fn user_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Apply every step newer than the stored `user_version`.
///
/// The steps and the version bump share one immediate transaction, and the
/// version is read again once the write lock is held. Handles opening a fresh
/// file at the same time therefore apply each step exactly once; the others
/// wait on the lock and find nothing left to do.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    if user_version(conn)? >= CURRENT_VERSION {
        return Ok(());
    }

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let current = user_version(&tx)?;

    tracing::info!(
        current_version = current,
        target_version = CURRENT_VERSION,
        "schema check"
    );

    if current < 1 {
        tracing::info!("applying migration v001_initial");
        v001_initial::up(&tx).map_err(|e| StoreError::Migration(e.to_string()))?;
        tx.pragma_update(None, "user_version", 1)?;
    }

    if current < 2 {
        tracing::info!("applying migration v002_client_tokens");
        v002_client_tokens::up(&tx).map_err(|e| StoreError::Migration(e.to_string()))?;
        tx.pragma_update(None, "user_version", 2)?;
    }

    tx.commit()?;
    Ok(())
}
