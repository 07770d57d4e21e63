//! Consistency checks and administrative purges.
//!
//! These cover the failure modes the message tables have historically
//! shown: an id sequence that fell behind the highest issued id, unread
//! counters drifting from the message log, and rows left behind after a
//! conversation disappeared.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::database::Database;
use crate::error::Result;
use crate::unread::UnreadTracker;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub rooms_checked: usize,
    pub counters_repaired: usize,
    /// The message id sequence lagged the highest stored id and was advanced.
    pub sequence_repaired: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub rooms: usize,
    pub groups: usize,
    pub messages: usize,
}

impl Database {
    /// Startup / on-demand consistency check. Runs in one write transaction.
    pub fn check_consistency(&mut self) -> Result<ConsistencyReport> {
        let report = self.write(|tx| {
            let sequence_repaired = repair_message_sequence(tx)?;
            let (rooms_checked, counters_repaired) = UnreadTracker::new(tx).recompute_all()?;
            Ok(ConsistencyReport {
                rooms_checked,
                counters_repaired,
                sequence_repaired,
            })
        })?;

        tracing::info!(
            rooms_checked = report.rooms_checked,
            counters_repaired = report.counters_repaired,
            sequence_repaired = report.sequence_repaired,
            "consistency check finished"
        );
        Ok(report)
    }

    /// Hard-delete soft-deleted rooms and groups together with their
    /// messages. Memberships and read cursors go with their group.
    pub fn purge_deleted(&mut self) -> Result<PurgeReport> {
        let report = self.write(|tx| {
            let mut messages = tx.execute(
                "DELETE FROM messages WHERE conversation_kind = 'direct'
                   AND conversation_id IN (SELECT room_id FROM rooms WHERE is_deleted = 1)",
                [],
            )?;
            messages += tx.execute(
                "DELETE FROM messages WHERE conversation_kind = 'group'
                   AND conversation_id IN (SELECT group_id FROM chat_groups WHERE is_deleted = 1)",
                [],
            )?;
            let rooms = tx.execute("DELETE FROM rooms WHERE is_deleted = 1", [])?;
            let groups = tx.execute("DELETE FROM chat_groups WHERE is_deleted = 1", [])?;
            Ok(PurgeReport {
                rooms,
                groups,
                messages,
            })
        })?;

        tracing::info!(
            rooms = report.rooms,
            groups = report.groups,
            messages = report.messages,
            "purged deleted conversations"
        );
        Ok(report)
    }

    /// Delete messages whose room or group no longer exists.
    pub fn purge_orphaned_messages(&mut self) -> Result<usize> {
        let removed = self.write(|tx| {
            let removed = tx.execute(
                "DELETE FROM messages
                 WHERE (conversation_kind = 'direct'
                        AND conversation_id NOT IN (SELECT room_id FROM rooms))
                    OR (conversation_kind = 'group'
                        AND conversation_id NOT IN (SELECT group_id FROM chat_groups))",
                [],
            )?;
            Ok(removed)
        })?;

        if removed > 0 {
            tracing::warn!(removed, "purged orphaned messages");
        }
        Ok(removed)
    }
}

/// Make sure the next id handed out is above every stored id.
fn repair_message_sequence(conn: &Connection) -> Result<bool> {
    let max_id: i64 = conn.query_row(
        "SELECT COALESCE(MAX(message_id), 0) FROM messages",
        [],
        |row| row.get(0),
    )?;
    let seq: Option<i64> = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = 'messages'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match seq {
        Some(seq) if seq >= max_id => Ok(false),
        None if max_id == 0 => Ok(false),
        Some(seq) => {
            tracing::warn!(seq, max_id, "message id sequence behind stored ids, advancing");
            conn.execute(
                "UPDATE sqlite_sequence SET seq = ?1 WHERE name = 'messages'",
                params![max_id],
            )?;
            Ok(true)
        }
        None => {
            tracing::warn!(max_id, "message id sequence missing, recreating");
            conn.execute(
                "INSERT INTO sqlite_sequence (name, seq) VALUES ('messages', ?1)",
                params![max_id],
            )?;
            Ok(true)
        }
    }
}
