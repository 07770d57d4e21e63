//! Append-only message log shared by direct rooms and groups.
//!
//! Ids come from a single `AUTOINCREMENT` sequence across every conversation,
//! so they are positive, strictly increasing in append order and never
//! reused. Display order is `(created_at, message_id)`; `append` never
//! stamps a message earlier than the newest one already in its
//! conversation, so within a conversation that order agrees with id order.

use std::collections::VecDeque;

use chrono::Utc;
use confab_shared::constants::{MAX_BODY_BYTES, MAX_CLIENT_TOKEN_BYTES, MAX_PAGE_LIMIT};
use confab_shared::{ConversationRef, MessageId, MessageKind, UserId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::convert::{count_from_sql, parse_col, ts_from_sql, ts_to_sql};
use crate::error::{Result, StoreError};
use crate::models::Message;

const MESSAGE_COLUMNS: &str = "message_id, conversation_kind, conversation_id, sender, body, \
                               kind, is_read, is_deleted, client_token, created_at";

/// Outcome of an append that may carry a client idempotency token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appended {
    /// A new row was written.
    New(Message),
    /// The `(sender, client_token)` pair was seen before; nothing was written.
    Replayed(Message),
}

impl Appended {
    pub fn message(&self) -> &Message {
        match self {
            Appended::New(m) | Appended::Replayed(m) => m,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Appended::New(m) | Appended::Replayed(m) => m,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Appended::New(_))
    }
}

/// Reject bodies before anything touches the database.
pub fn validate_body(body: &str, kind: MessageKind) -> Result<()> {
    if body.trim().is_empty() {
        let what = if kind.is_attachment() {
            "attachment reference"
        } else {
            "message body"
        };
        return Err(StoreError::InvalidArgument(format!("{what} must not be empty")));
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(StoreError::InvalidArgument(format!(
            "message body is {} bytes (max {MAX_BODY_BYTES})",
            body.len()
        )));
    }
    Ok(())
}

fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() || token.len() > MAX_CLIENT_TOKEN_BYTES {
        return Err(StoreError::InvalidArgument(format!(
            "client token must be 1..={MAX_CLIENT_TOKEN_BYTES} bytes"
        )));
    }
    Ok(())
}

fn validate_limit(limit: u32) -> Result<()> {
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(StoreError::InvalidArgument(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}, got {limit}"
        )));
    }
    Ok(())
}

pub struct MessageStore<'c> {
    conn: &'c Connection,
}

impl<'c> MessageStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // ------------------------------------------------------------------
    // Append
    // ------------------------------------------------------------------

    pub fn append(
        &self,
        conversation: &ConversationRef,
        sender: UserId,
        body: &str,
        kind: MessageKind,
    ) -> Result<Message> {
        self.append_with_token(conversation, sender, body, kind, None)
            .map(Appended::into_message)
    }

    /// Append a message, or return the earlier one if `client_token` was
    /// already used by `sender`.
    ///
    /// A token replayed against a different conversation is a `Conflict`.
    pub fn append_with_token(
        &self,
        conversation: &ConversationRef,
        sender: UserId,
        body: &str,
        kind: MessageKind,
        client_token: Option<&str>,
    ) -> Result<Appended> {
        validate_body(body, kind)?;

        if let Some(token) = client_token {
            validate_token(token)?;
            if let Some(existing) = self.find_by_client_token(sender, token)? {
                if existing.conversation != *conversation {
                    return Err(StoreError::Conflict(format!(
                        "client token already used in {}",
                        existing.conversation
                    )));
                }
                tracing::debug!(
                    message_id = %existing.message_id,
                    sender = %sender,
                    "replayed send matched client token"
                );
                return Ok(Appended::Replayed(existing));
            }
        }

        let now = Utc::now();
        let newest: Option<String> = self.conn.query_row(
            "SELECT MAX(created_at) FROM messages
             WHERE conversation_kind = ?1 AND conversation_id = ?2",
            params![conversation.kind_str(), conversation.id_str()],
            |row| row.get(0),
        )?;
        let created_at = match newest {
            Some(ts) => {
                let floor = ts_from_sql(0, &ts)?;
                if floor > now {
                    floor
                } else {
                    now
                }
            }
            None => now,
        };

        self.conn.execute(
            "INSERT INTO messages
                (conversation_kind, conversation_id, sender, body, kind, client_token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation.kind_str(),
                conversation.id_str(),
                sender.0,
                body,
                kind.as_str(),
                client_token,
                ts_to_sql(&created_at),
            ],
        )?;

        let message_id = MessageId(self.conn.last_insert_rowid());

        tracing::debug!(
            message_id = %message_id,
            conversation = %conversation,
            sender = %sender,
            "message appended"
        );

        Ok(Appended::New(Message {
            message_id,
            conversation: conversation.clone(),
            sender,
            body: body.to_string(),
            kind,
            is_read: false,
            is_deleted: false,
            client_token: client_token.map(str::to_string),
            created_at,
        }))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get(&self, id: MessageId) -> Result<Message> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))
    }

    pub fn find(&self, id: MessageId) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id.0], row_to_message)
            .optional()?)
    }

    /// The message `sender` already sent under `token`, if any.
    pub fn find_by_client_token(&self, sender: UserId, token: &str) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE sender = ?1 AND client_token = ?2"
        );
        Ok(self
            .conn
            .query_row(&sql, params![sender.0, token], row_to_message)
            .optional()?)
    }

    /// One page of messages strictly after `cursor`, oldest first.
    ///
    /// `MessageId::START` reads from the beginning. A cursor naming a message
    /// that no longer exists falls back to plain id order.
    pub fn list_since(
        &self,
        conversation: &ConversationRef,
        cursor: MessageId,
        limit: u32,
        include_deleted: bool,
    ) -> Result<Vec<Message>> {
        validate_limit(limit)?;

        let cursor_ts: Option<String> = if cursor.0 > 0 {
            self.conn
                .query_row(
                    "SELECT created_at FROM messages WHERE message_id = ?1",
                    params![cursor.0],
                    |row| row.get(0),
                )
                .optional()?
        } else {
            None
        };

        let after = match cursor_ts {
            Some(_) => "(created_at > ?3 OR (created_at = ?3 AND message_id > ?4))",
            None => "(?3 IS NULL AND message_id > ?4)",
        };
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_kind = ?1 AND conversation_id = ?2
               AND {after}
               AND (?5 OR is_deleted = 0)
             ORDER BY created_at ASC, message_id ASC
             LIMIT ?6"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                conversation.kind_str(),
                conversation.id_str(),
                cursor_ts,
                cursor.0,
                include_deleted,
                limit,
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Lazily walk a conversation page by page, starting after `cursor`.
    pub fn iter_since(
        &self,
        conversation: &ConversationRef,
        cursor: MessageId,
        page_size: u32,
        include_deleted: bool,
    ) -> Result<MessagePages<'_, 'c>> {
        validate_limit(page_size)?;
        Ok(MessagePages {
            store: self,
            conversation: conversation.clone(),
            cursor,
            page_size,
            include_deleted,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    /// Newest non-deleted message, used to rebuild cached previews.
    pub fn latest_visible(&self, conversation: &ConversationRef) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_kind = ?1 AND conversation_id = ?2 AND is_deleted = 0
             ORDER BY created_at DESC, message_id DESC
             LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![conversation.kind_str(), conversation.id_str()],
                row_to_message,
            )
            .optional()?)
    }

    /// Highest id issued in a conversation, or `MessageId::START` if empty.
    pub fn max_id(&self, conversation: &ConversationRef) -> Result<MessageId> {
        let max: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(message_id), 0) FROM messages
             WHERE conversation_kind = ?1 AND conversation_id = ?2",
            params![conversation.kind_str(), conversation.id_str()],
            |row| row.get(0),
        )?;
        Ok(MessageId(max))
    }

    /// Visible messages in a direct room that `reader` received and has not read.
    pub fn count_unread_direct(&self, conversation: &ConversationRef, reader: UserId) -> Result<u32> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_kind = ?1 AND conversation_id = ?2
               AND sender != ?3 AND is_read = 0 AND is_deleted = 0",
            params![conversation.kind_str(), conversation.id_str(), reader.0],
            |row| row.get(0),
        )?;
        Ok(count_from_sql(n))
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Flip `is_read` on every message addressed to `reader` up to and
    /// including `upto`. Returns how many rows changed; repeating a call with
    /// the same or a smaller cursor changes nothing.
    ///
    /// Group read state lives in read cursors, so group conversations are a
    /// no-op here.
    pub fn mark_read(
        &self,
        conversation: &ConversationRef,
        reader: UserId,
        upto: MessageId,
    ) -> Result<usize> {
        let room = match conversation {
            ConversationRef::Direct(room) => room,
            ConversationRef::Group(_) => return Ok(0),
        };
        let (a, b) = room.participants();
        if reader != a && reader != b {
            return Err(StoreError::Forbidden(format!(
                "user {reader} is not a participant of room {room}"
            )));
        }

        let changed = self.conn.execute(
            "UPDATE messages SET is_read = 1
             WHERE conversation_kind = 'direct' AND conversation_id = ?1
               AND sender != ?2 AND message_id <= ?3 AND is_read = 0",
            params![room.as_str(), reader.0, upto.0],
        )?;
        Ok(changed)
    }

    /// Soft-delete a message. Returns `false` if it was already deleted.
    ///
    /// Only the sender may delete a direct message; group messages may also
    /// be deleted by an active group admin.
    pub fn soft_delete(&self, id: MessageId, actor: UserId) -> Result<bool> {
        let message = self.get(id)?;

        if message.sender != actor {
            let allowed = match &message.conversation {
                ConversationRef::Direct(_) => false,
                ConversationRef::Group(group) => {
                    let role: Option<String> = self
                        .conn
                        .query_row(
                            "SELECT role FROM group_memberships
                             WHERE group_id = ?1 AND user_id = ?2 AND is_active = 1",
                            params![group.as_str(), actor.0],
                            |row| row.get(0),
                        )
                        .optional()?;
                    role.as_deref() == Some("admin")
                }
            };
            if !allowed {
                return Err(StoreError::Forbidden(format!(
                    "user {actor} may not delete message {id}"
                )));
            }
        }

        let changed = self.conn.execute(
            "UPDATE messages SET is_deleted = 1 WHERE message_id = ?1 AND is_deleted = 0",
            params![id.0],
        )?;
        Ok(changed > 0)
    }
}

/// Restartable page-by-page walk over a conversation.
///
/// Each page is one bounded [`MessageStore::list_since`] query; the next page
/// starts after the last message yielded, so a consumer can stop, remember
/// that id and resume later with a fresh iterator.
pub struct MessagePages<'s, 'c> {
    store: &'s MessageStore<'c>,
    conversation: ConversationRef,
    cursor: MessageId,
    page_size: u32,
    include_deleted: bool,
    buffer: VecDeque<Message>,
    exhausted: bool,
}

impl MessagePages<'_, '_> {
    /// Id of the last message handed out.
    pub fn cursor(&self) -> MessageId {
        self.cursor
    }
}

impl Iterator for MessagePages<'_, '_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.list_since(
                &self.conversation,
                self.cursor,
                self.page_size,
                self.include_deleted,
            ) {
                Ok(page) => {
                    if page.len() < self.page_size as usize {
                        self.exhausted = true;
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let message = self.buffer.pop_front()?;
        self.cursor = message.message_id;
        Some(Ok(message))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let message_id: i64 = row.get(0)?;
    let conv_kind: String = row.get(1)?;
    let conv_id: String = row.get(2)?;
    let sender: i64 = row.get(3)?;
    let body: String = row.get(4)?;
    let kind_str: String = row.get(5)?;
    let is_read: bool = row.get(6)?;
    let is_deleted: bool = row.get(7)?;
    let client_token: Option<String> = row.get(8)?;
    let created_str: String = row.get(9)?;

    let conversation = ConversationRef::from_parts(&conv_kind, &conv_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Message {
        message_id: MessageId(message_id),
        conversation,
        sender: UserId(sender),
        body,
        kind: parse_col(5, &kind_str)?,
        is_read,
        is_deleted,
        client_token,
        created_at: ts_from_sql(9, &created_str)?,
    })
}
