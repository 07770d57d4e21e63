//! Direct rooms, one per unordered pair of users.

use chrono::{DateTime, Utc};
use confab_shared::{ConversationRef, RoomId, UserId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::convert::{count_from_sql, opt_ts_from_sql, parse_col, ts_from_sql, ts_to_sql};
use crate::error::{Result, StoreError};
use crate::messages::MessageStore;
use crate::models::{preview_of, Room};

const ROOM_COLUMNS: &str = "room_id, participant_a, participant_b, last_message_preview, \
                            last_message_at, unread_count_a, unread_count_b, is_deleted, \
                            created_at, updated_at";

pub struct RoomDirectory<'c> {
    conn: &'c Connection,
}

impl<'c> RoomDirectory<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // ------------------------------------------------------------------
    // Create / revive
    // ------------------------------------------------------------------

    /// Return the active room for `(a, b)`, creating or reviving it.
    ///
    /// The insert is keyed on the canonical room id, so concurrent first
    /// contact from both sides lands on the same row. A soft-deleted room is
    /// revived in place with both counters reset, and the messages from
    /// before the deletion stop counting as unread. Which of the two
    /// happened is decided by the affected-row counts, never by timestamps.
    pub fn get_or_create(&self, a: UserId, b: UserId) -> Result<Room> {
        let room_id = RoomId::derive(a, b)?;
        let (low, high) = room_id.participants();
        let now = ts_to_sql(&Utc::now());

        let created = self.conn.execute(
            "INSERT INTO rooms
                (room_id, participant_a, participant_b, unread_count_a, unread_count_b,
                 is_deleted, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, 0, 0, ?4, ?4)
             ON CONFLICT(room_id) DO NOTHING",
            params![room_id.as_str(), low.0, high.0, now],
        )?;

        if created > 0 {
            tracing::debug!(room_id = %room_id, "room created");
            return self.get(&room_id);
        }

        let revived = self.conn.execute(
            "UPDATE rooms SET
                is_deleted = 0,
                unread_count_a = 0,
                unread_count_b = 0,
                updated_at = ?2
             WHERE room_id = ?1 AND is_deleted = 1",
            params![room_id.as_str(), now],
        )?;

        if revived > 0 {
            let settled = self.conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_kind = 'direct' AND conversation_id = ?1 AND is_read = 0",
                params![room_id.as_str()],
            )?;
            tracing::info!(room_id = %room_id, settled, "room revived");
        }

        self.get(&room_id)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a room regardless of its deletion state.
    pub fn get(&self, room_id: &RoomId) -> Result<Room> {
        self.find(room_id)?
            .ok_or_else(|| StoreError::NotFound(format!("room {room_id}")))
    }

    pub fn find(&self, room_id: &RoomId) -> Result<Option<Room>> {
        let sql = format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE room_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![room_id.as_str()], row_to_room)
            .optional()?)
    }

    /// Active rooms of `user`, most recent activity first.
    pub fn list_for(&self, user: UserId) -> Result<Vec<Room>> {
        let sql = format!(
            "SELECT {ROOM_COLUMNS} FROM rooms
             WHERE (participant_a = ?1 OR participant_b = ?1) AND is_deleted = 0
             ORDER BY COALESCE(last_message_at, created_at) DESC, room_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user.0], row_to_room)?;

        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row?);
        }
        Ok(rooms)
    }

    pub fn list_all_ids(&self) -> Result<Vec<RoomId>> {
        let mut stmt = self.conn.prepare("SELECT room_id FROM rooms ORDER BY room_id")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            parse_col::<RoomId>(0, &id)
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Refresh the preview and bump the recipient's unread counter by one.
    ///
    /// Must run in the same transaction as the `MessageStore::append` it
    /// describes. Deleted rooms accept no messages.
    pub fn record_message(
        &self,
        room_id: &RoomId,
        sender: UserId,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE rooms SET
                last_message_preview = ?2,
                last_message_at = ?3,
                updated_at = ?3,
                unread_count_a = unread_count_a + (participant_a != ?4),
                unread_count_b = unread_count_b + (participant_b != ?4)
             WHERE room_id = ?1 AND is_deleted = 0
               AND (participant_a = ?4 OR participant_b = ?4)",
            params![room_id.as_str(), preview, ts_to_sql(&at), sender.0],
        )?;

        if changed == 0 {
            let room = self.get(room_id)?;
            if room.is_deleted {
                return Err(StoreError::Conflict(format!("room {room_id} is deleted")));
            }
            return Err(StoreError::Forbidden(format!(
                "user {sender} is not a participant of room {room_id}"
            )));
        }
        Ok(())
    }

    /// Bring `reader`'s counter in line with what is still unread after a
    /// `MessageStore::mark_read`. Reading up to the newest message leaves 0.
    pub fn reset_unread(&self, room_id: &RoomId, reader: UserId) -> Result<u32> {
        let room = self.get(room_id)?;
        if !room.is_participant(reader) {
            return Err(StoreError::Forbidden(format!(
                "user {reader} is not a participant of room {room_id}"
            )));
        }

        let remaining = MessageStore::new(self.conn)
            .count_unread_direct(&ConversationRef::Direct(room_id.clone()), reader)?;
        let column = if reader == room.participant_a {
            "unread_count_a"
        } else {
            "unread_count_b"
        };
        self.conn.execute(
            &format!("UPDATE rooms SET {column} = ?2 WHERE room_id = ?1 AND {column} != ?2"),
            params![room_id.as_str(), remaining],
        )?;
        Ok(remaining)
    }

    /// Overwrite both counters. Used by the unread tracker's recount.
    pub(crate) fn set_unread(&self, room_id: &RoomId, count_a: u32, count_b: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE rooms SET unread_count_a = ?2, unread_count_b = ?3 WHERE room_id = ?1",
            params![room_id.as_str(), count_a, count_b],
        )?;
        Ok(())
    }

    /// Recompute the cached preview from the newest visible message.
    pub fn rebuild_preview(&self, room_id: &RoomId, preview_chars: usize) -> Result<()> {
        let latest = MessageStore::new(self.conn)
            .latest_visible(&ConversationRef::Direct(room_id.clone()))?;
        let (preview, at) = match latest {
            Some(m) => (
                Some(preview_of(&m.body, m.kind, preview_chars)),
                Some(ts_to_sql(&m.created_at)),
            ),
            None => (None, None),
        };
        self.conn.execute(
            "UPDATE rooms SET last_message_preview = ?2, last_message_at = ?3 WHERE room_id = ?1",
            params![room_id.as_str(), preview, at],
        )?;
        Ok(())
    }

    /// Soft-delete a room. Returns `false` if it was already deleted.
    pub fn soft_delete(&self, room_id: &RoomId, actor: UserId) -> Result<bool> {
        let room = self.get(room_id)?;
        if !room.is_participant(actor) {
            return Err(StoreError::Forbidden(format!(
                "user {actor} is not a participant of room {room_id}"
            )));
        }

        let changed = self.conn.execute(
            "UPDATE rooms SET is_deleted = 1, updated_at = ?2 WHERE room_id = ?1 AND is_deleted = 0",
            params![room_id.as_str(), ts_to_sql(&Utc::now())],
        )?;
        if changed > 0 {
            tracing::info!(room_id = %room_id, actor = %actor, "room soft-deleted");
        }
        Ok(changed > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    let room_id_str: String = row.get(0)?;
    let participant_a: i64 = row.get(1)?;
    let participant_b: i64 = row.get(2)?;
    let last_message_preview: Option<String> = row.get(3)?;
    let last_message_at: Option<String> = row.get(4)?;
    let unread_count_a: i64 = row.get(5)?;
    let unread_count_b: i64 = row.get(6)?;
    let is_deleted: bool = row.get(7)?;
    let created_str: String = row.get(8)?;
    let updated_str: String = row.get(9)?;

    Ok(Room {
        room_id: parse_col(0, &room_id_str)?,
        participant_a: UserId(participant_a),
        participant_b: UserId(participant_b),
        last_message_preview,
        last_message_at: opt_ts_from_sql(4, last_message_at)?,
        unread_count_a: count_from_sql(unread_count_a),
        unread_count_b: count_from_sql(unread_count_b),
        is_deleted,
        created_at: ts_from_sql(8, &created_str)?,
        updated_at: ts_from_sql(9, &updated_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use confab_shared::MessageKind;
    use std::sync::{Arc, Barrier};

    fn send(db: &Database, from: i64, to: i64, body: &str) -> confab_shared::MessageId {
        let room = db.rooms().get_or_create(UserId(from), UserId(to)).unwrap();
        let conv = ConversationRef::Direct(room.room_id.clone());
        let m = db
            .messages()
            .append(&conv, UserId(from), body, MessageKind::Text)
            .unwrap();
        db.rooms()
            .record_message(&room.room_id, UserId(from), body, m.created_at)
            .unwrap();
        m.message_id
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let first = db.rooms().get_or_create(UserId(7), UserId(3)).unwrap();
        assert_eq!(first.room_id.as_str(), "3_7");
        assert_eq!((first.participant_a, first.participant_b), (UserId(3), UserId(7)));
        assert_eq!((first.unread_count_a, first.unread_count_b), (0, 0));
        assert!(!first.is_deleted);

        let second = db.rooms().get_or_create(UserId(3), UserId(7)).unwrap();
        assert_eq!(first, second);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM rooms", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_self_room_rejected() {
        let db = Database::open_in_memory().unwrap();
        let err = db.rooms().get_or_create(UserId(5), UserId(5)).unwrap_err();
        assert!(matches!(err, StoreError::Identity(_)));
    }

    #[test]
    fn test_record_message_bumps_recipient_only() {
        let db = Database::open_in_memory().unwrap();
        send(&db, 3, 7, "hello");

        let room = db.rooms().get(&RoomId::derive(UserId(3), UserId(7)).unwrap()).unwrap();
        assert_eq!(room.last_message_preview.as_deref(), Some("hello"));
        assert!(room.last_message_at.is_some());
        assert_eq!(room.unread_for(UserId(7)), Some(1));
        assert_eq!(room.unread_for(UserId(3)), Some(0));
    }

    #[test]
    fn test_record_message_rejects_outsider_and_deleted_room() {
        let db = Database::open_in_memory().unwrap();
        let room = db.rooms().get_or_create(UserId(3), UserId(7)).unwrap();

        let err = db
            .rooms()
            .record_message(&room.room_id, UserId(9), "x", Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        db.rooms().soft_delete(&room.room_id, UserId(3)).unwrap();
        let err = db
            .rooms()
            .record_message(&room.room_id, UserId(3), "x", Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_reset_unread_keeps_messages_past_cursor() {
        let db = Database::open_in_memory().unwrap();
        let first = send(&db, 3, 7, "one");
        send(&db, 3, 7, "two");
        let room_id = RoomId::derive(UserId(3), UserId(7)).unwrap();
        let conv = ConversationRef::Direct(room_id.clone());

        db.messages().mark_read(&conv, UserId(7), first).unwrap();
        assert_eq!(db.rooms().reset_unread(&room_id, UserId(7)).unwrap(), 1);
        assert_eq!(db.rooms().get(&room_id).unwrap().unread_for(UserId(7)), Some(1));

        let err = db.rooms().reset_unread(&room_id, UserId(4)).unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
    }

    #[test]
    fn test_soft_delete_and_revive() {
        let db = Database::open_in_memory().unwrap();
        send(&db, 3, 7, "before");
        let room_id = RoomId::derive(UserId(3), UserId(7)).unwrap();

        let err = db.rooms().soft_delete(&room_id, UserId(8)).unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));

        assert!(db.rooms().soft_delete(&room_id, UserId(7)).unwrap());
        assert!(!db.rooms().soft_delete(&room_id, UserId(3)).unwrap());
        assert!(db.rooms().list_for(UserId(3)).unwrap().is_empty());

        let revived = db.rooms().get_or_create(UserId(7), UserId(3)).unwrap();
        assert!(!revived.is_deleted);
        assert_eq!((revived.unread_count_a, revived.unread_count_b), (0, 0));

        // Pre-deletion messages no longer count towards unread
        let conv = ConversationRef::Direct(room_id.clone());
        assert_eq!(db.messages().count_unread_direct(&conv, UserId(7)).unwrap(), 0);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM rooms", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_rapid_delete_revive_cycles_settle_messages() {
        let db = Database::open_in_memory().unwrap();
        let room_id = RoomId::derive(UserId(3), UserId(7)).unwrap();
        let conv = ConversationRef::Direct(room_id.clone());

        // Every cycle runs within the same clock tick as room creation, so
        // telling "created" from "revived" cannot rely on timestamps.
        for cycle in 0..20 {
            send(&db, 3, 7, &format!("msg {cycle}"));
            assert_eq!(db.messages().count_unread_direct(&conv, UserId(7)).unwrap(), 1);

            assert!(db.rooms().soft_delete(&room_id, UserId(3)).unwrap());
            let revived = db.rooms().get_or_create(UserId(3), UserId(7)).unwrap();

            assert!(!revived.is_deleted);
            assert_eq!((revived.unread_count_a, revived.unread_count_b), (0, 0));
            assert_eq!(db.messages().count_unread_direct(&conv, UserId(7)).unwrap(), 0);
        }
    }

    #[test]
    fn test_list_for_orders_by_activity() {
        let db = Database::open_in_memory().unwrap();
        send(&db, 1, 2, "old");
        send(&db, 1, 3, "newer");
        db.rooms().get_or_create(UserId(4), UserId(5)).unwrap();

        let rooms = db.rooms().list_for(UserId(1)).unwrap();
        let ids: Vec<_> = rooms.iter().map(|r| r.room_id.as_str().to_string()).collect();
        assert_eq!(ids, ["1_3", "1_2"]);
    }

    #[test]
    fn test_rebuild_preview_after_delete() {
        let db = Database::open_in_memory().unwrap();
        send(&db, 3, 7, "first");
        let last = send(&db, 3, 7, "second");
        let room_id = RoomId::derive(UserId(3), UserId(7)).unwrap();

        db.messages().soft_delete(last, UserId(3)).unwrap();
        db.rooms().rebuild_preview(&room_id, 100).unwrap();
        let room = db.rooms().get(&room_id).unwrap();
        assert_eq!(room.last_message_preview.as_deref(), Some("first"));
    }

    #[test]
    fn test_concurrent_first_contact_creates_one_room() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("rooms.db"));
        Database::open_at(&path).unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = Arc::clone(&path);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut db = Database::open_at(&path).unwrap();
                    barrier.wait();
                    let (a, b) = if i % 2 == 0 { (3, 7) } else { (7, 3) };
                    db.write(|tx| RoomDirectory::new(tx).get_or_create(UserId(a), UserId(b)))
                        .unwrap()
                })
            })
            .collect();

        let rooms: Vec<Room> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(rooms.iter().all(|r| r.room_id == rooms[0].room_id));

        let db = Database::open_at(&path).unwrap();
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM rooms WHERE is_deleted = 0", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
