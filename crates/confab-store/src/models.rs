//! Domain model structs persisted in the messaging database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to whatever transport the host wraps around the chat service.

use chrono::{DateTime, Utc};
use confab_shared::constants::{FILE_PREVIEW, IMAGE_PREVIEW};
use confab_shared::{ConversationRef, GroupId, GroupRole, MessageId, MessageKind, RoomId, UserId};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A direct conversation between exactly two users.
///
/// `participant_a` is always the lower user id, matching the order inside
/// `room_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub room_id: RoomId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    /// Cached preview of the newest visible message. Rebuildable from `messages`.
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Unread messages for `participant_a`.
    pub unread_count_a: u32,
    /// Unread messages for `participant_b`.
    pub unread_count_b: u32,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn is_participant(&self, user: UserId) -> bool {
        user == self.participant_a || user == self.participant_b
    }

    /// The other side of the conversation, or `None` for outsiders.
    pub fn other_participant(&self, user: UserId) -> Option<UserId> {
        if user == self.participant_a {
            Some(self.participant_b)
        } else if user == self.participant_b {
            Some(self.participant_a)
        } else {
            None
        }
    }

    pub fn unread_for(&self, user: UserId) -> Option<u32> {
        if user == self.participant_a {
            Some(self.unread_count_a)
        } else if user == self.participant_b {
            Some(self.unread_count_b)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub group_id: GroupId,
    pub name: String,
    pub description: Option<String>,
    pub owner: UserId,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMembership {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub role: GroupRole,
    pub joined_at: DateTime<Utc>,
    pub is_active: bool,
}

impl GroupMembership {
    pub fn is_active_admin(&self) -> bool {
        self.is_active && self.role == GroupRole::Admin
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message. Immutable after creation except for the
/// `is_read` and `is_deleted` flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub message_id: MessageId,
    pub conversation: ConversationRef,
    pub sender: UserId,
    /// Text for `text` messages, an opaque attachment reference otherwise.
    pub body: String,
    pub kind: MessageKind,
    /// Only meaningful for direct messages.
    pub is_read: bool,
    pub is_deleted: bool,
    pub client_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn preview(&self, max_chars: usize) -> String {
        preview_of(&self.body, self.kind, max_chars)
    }
}

/// Build the last-message preview for a conversation listing.
///
/// Attachment references are never shown; text is cut at `max_chars`
/// characters (not bytes) with a trailing ellipsis.
pub fn preview_of(body: &str, kind: MessageKind, max_chars: usize) -> String {
    match kind {
        MessageKind::Image => IMAGE_PREVIEW.to_string(),
        MessageKind::File => FILE_PREVIEW.to_string(),
        MessageKind::Text => {
            let trimmed = body.trim();
            if trimmed.chars().count() <= max_chars {
                trimmed.to_string()
            } else {
                let mut cut: String = trimmed.chars().take(max_chars).collect();
                cut.push('…');
                cut
            }
        }
    }
}
