//! # confab-store
//!
//! SQLite persistence for the confab messaging core.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection`. Components (`MessageStore`, `RoomDirectory`,
//! `GroupDirectory`, `UnreadTracker`) borrow a connection explicitly, so the
//! same code runs against the bare connection or inside a transaction opened
//! with [`Database::write`]. No component caches room or unread state outside
//! of what the database holds.

pub mod database;
pub mod groups;
pub mod maintenance;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod rooms;
pub mod unread;

mod convert;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use groups::{GroupDirectory, MemberAdded};
pub use maintenance::{ConsistencyReport, PurgeReport};
pub use messages::{validate_body, Appended, MessagePages, MessageStore};
pub use models::*;
pub use rooms::RoomDirectory;
pub use unread::UnreadTracker;

// Re-export the transaction type so callers can compose components atomically
pub use rusqlite::{Connection, Transaction};
