//! Unread state for both conversation kinds.
//!
//! Direct rooms keep two counters on the room row for O(1) reads; they are
//! a derived quantity that [`UnreadTracker::recompute_unread`] can always
//! rebuild from the message log. Groups keep no counters at all: each member
//! has a forward-only read cursor, and the unread count is the number of
//! visible messages from other members past that cursor.

use chrono::Utc;
use confab_shared::{ConversationRef, GroupId, MessageId, RoomId, UserId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::convert::{count_from_sql, ts_to_sql};
use crate::error::{Result, StoreError};
use crate::groups::GroupDirectory;
use crate::messages::MessageStore;
use crate::rooms::RoomDirectory;

pub struct UnreadTracker<'c> {
    conn: &'c Connection,
}

impl<'c> UnreadTracker<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Move `user`'s read cursor forward to `upto` and return the stored
    /// cursor. Cursors never move backwards, and a cursor past the newest
    /// message in the group is clamped to it.
    pub fn mark_group_read(
        &self,
        group_id: &GroupId,
        user: UserId,
        upto: MessageId,
    ) -> Result<MessageId> {
        if GroupDirectory::new(self.conn)
            .active_membership(group_id, user)?
            .is_none()
        {
            return Err(StoreError::Forbidden(format!(
                "user {user} is not a member of group {group_id}"
            )));
        }

        let newest = MessageStore::new(self.conn).max_id(&ConversationRef::Group(group_id.clone()))?;
        let target = MessageId(upto.0.min(newest.0).max(0));
        self.advance_cursor(group_id, user, target)
    }

    /// Start a (re)joining member's cursor at the newest message so joining
    /// never creates a backlog.
    pub fn start_at_latest(&self, group_id: &GroupId, user: UserId) -> Result<MessageId> {
        let newest = MessageStore::new(self.conn).max_id(&ConversationRef::Group(group_id.clone()))?;
        self.advance_cursor(group_id, user, newest)
    }

    fn advance_cursor(&self, group_id: &GroupId, user: UserId, target: MessageId) -> Result<MessageId> {
        self.conn.execute(
            "INSERT INTO group_read_cursors (group_id, user_id, last_read_message_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(group_id, user_id) DO UPDATE SET
                last_read_message_id = MAX(last_read_message_id, excluded.last_read_message_id),
                updated_at = CASE
                    WHEN excluded.last_read_message_id > last_read_message_id
                    THEN excluded.updated_at
                    ELSE updated_at
                END",
            params![group_id.as_str(), user.0, target.0, ts_to_sql(&Utc::now())],
        )?;

        Ok(self.last_read(group_id, user)?.unwrap_or(MessageId::START))
    }

    pub fn last_read(&self, group_id: &GroupId, user: UserId) -> Result<Option<MessageId>> {
        let cursor: Option<i64> = self
            .conn
            .query_row(
                "SELECT last_read_message_id FROM group_read_cursors
                 WHERE group_id = ?1 AND user_id = ?2",
                params![group_id.as_str(), user.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.map(MessageId))
    }

    /// Messages from other members past `user`'s cursor. Zero for users
    /// without an active membership or without a cursor.
    pub fn unread_count(&self, group_id: &GroupId, user: UserId) -> Result<u32> {
        if GroupDirectory::new(self.conn)
            .active_membership(group_id, user)?
            .is_none()
        {
            return Ok(0);
        }
        let Some(cursor) = self.last_read(group_id, user)? else {
            return Ok(0);
        };

        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_kind = 'group' AND conversation_id = ?1
               AND message_id > ?2 AND sender != ?3 AND is_deleted = 0",
            params![group_id.as_str(), cursor.0, user.0],
            |row| row.get(0),
        )?;
        Ok(count_from_sql(n))
    }

    // ------------------------------------------------------------------
    // Direct rooms
    // ------------------------------------------------------------------

    /// Stored counter for `user` in a direct room.
    pub fn direct_unread(&self, room_id: &RoomId, user: UserId) -> Result<u32> {
        let room = RoomDirectory::new(self.conn).get(room_id)?;
        room.unread_for(user).ok_or_else(|| {
            StoreError::Forbidden(format!("user {user} is not a participant of room {room_id}"))
        })
    }

    /// Recount both counters from the message log: `(for_a, for_b)`.
    pub fn recount(&self, room_id: &RoomId) -> Result<(u32, u32)> {
        let (a, b) = room_id.participants();
        let messages = MessageStore::new(self.conn);
        let conversation = ConversationRef::Direct(room_id.clone());
        Ok((
            messages.count_unread_direct(&conversation, a)?,
            messages.count_unread_direct(&conversation, b)?,
        ))
    }

    /// Overwrite the stored counters with a recount after an expected change
    /// such as a message deletion.
    pub fn sync_direct(&self, room_id: &RoomId) -> Result<()> {
        let (count_a, count_b) = self.recount(room_id)?;
        RoomDirectory::new(self.conn).set_unread(room_id, count_a, count_b)
    }

    /// Verify a room's counters against the message log and repair them.
    ///
    /// Returns `true` if the stored counters diverged. Divergence is logged
    /// and fixed, never surfaced to users.
    pub fn recompute_unread(&self, room_id: &RoomId) -> Result<bool> {
        let rooms = RoomDirectory::new(self.conn);
        let room = rooms.get(room_id)?;
        let (count_a, count_b) = self.recount(room_id)?;

        if (count_a, count_b) == (room.unread_count_a, room.unread_count_b) {
            return Ok(false);
        }

        tracing::warn!(
            room_id = %room_id,
            stored_a = room.unread_count_a,
            stored_b = room.unread_count_b,
            recount_a = count_a,
            recount_b = count_b,
            "unread counters diverged from message log, repaired"
        );
        rooms.set_unread(room_id, count_a, count_b)?;
        Ok(true)
    }

    /// Run [`recompute_unread`](Self::recompute_unread) over every room.
    /// Returns `(rooms_checked, rooms_repaired)`.
    pub fn recompute_all(&self) -> Result<(usize, usize)> {
        let ids = RoomDirectory::new(self.conn).list_all_ids()?;
        let mut repaired = 0;
        for id in &ids {
            if self.recompute_unread(id)? {
                repaired += 1;
            }
        }
        Ok((ids.len(), repaired))
    }
}
