use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdentityError;
use crate::identity;

// User identity is owned by the host system; messaging only stores the key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally monotonic message key. Never `0`, never reused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i64);

impl MessageId {
    /// Cursor value that sorts before every issued message.
    pub const START: MessageId = MessageId(0);
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical direct-room identifier, e.g. `"3_7"`.
///
/// Only obtainable through [`identity::derive`] or by parsing a string that
/// [`identity::participants_of`] accepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn derive(a: UserId, b: UserId) -> Result<Self, IdentityError> {
        identity::derive(a, b)
    }

    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        identity::participants_of(s)?;
        Ok(Self(s.to_string()))
    }

    pub(crate) fn from_canonical(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The two participants, lower id first.
    pub fn participants(&self) -> (UserId, UserId) {
        // Construction guarantees the canonical shape.
        identity::participants_of(&self.0).unwrap_or((UserId(0), UserId(0)))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        identity::participants_of(&s)?;
        Ok(Self(s))
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

/// Stable, externally visible group identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct GroupId(String);

impl GroupId {
    /// Allocate a fresh random group id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.len() != s.len() {
            return Err(IdentityError::InvalidArgument(format!(
                "invalid group id {s:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GroupId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for GroupId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<GroupId> for String {
    fn from(id: GroupId) -> Self {
        id.0
    }
}

/// Where a message lives: a direct room or a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum ConversationRef {
    Direct(RoomId),
    Group(GroupId),
}

impl ConversationRef {
    /// Discriminator persisted alongside the id.
    pub fn kind_str(&self) -> &'static str {
        match self {
            ConversationRef::Direct(_) => "direct",
            ConversationRef::Group(_) => "group",
        }
    }

    pub fn id_str(&self) -> &str {
        match self {
            ConversationRef::Direct(room) => room.as_str(),
            ConversationRef::Group(group) => group.as_str(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ConversationRef::Group(_))
    }

    /// Rebuild a reference from its persisted `(kind, id)` columns.
    pub fn from_parts(kind: &str, id: &str) -> Result<Self, IdentityError> {
        match kind {
            "direct" => Ok(ConversationRef::Direct(RoomId::parse(id)?)),
            "group" => Ok(ConversationRef::Group(GroupId::parse(id)?)),
            other => Err(IdentityError::InvalidArgument(format!(
                "unknown conversation kind {other:?}"
            ))),
        }
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind_str(), self.id_str())
    }
}

impl From<RoomId> for ConversationRef {
    fn from(room: RoomId) -> Self {
        ConversationRef::Direct(room)
    }
}

impl From<GroupId> for ConversationRef {
    fn from(group: GroupId) -> Self {
        ConversationRef::Group(group)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }

    /// `image` and `file` bodies are opaque attachment references.
    pub fn is_attachment(&self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

impl FromStr for MessageKind {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            other => Err(IdentityError::InvalidArgument(format!(
                "unknown message kind {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Admin,
    Member,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRole::Admin => "admin",
            GroupRole::Member => "member",
        }
    }
}

impl FromStr for GroupRole {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(GroupRole::Admin),
            "member" => Ok(GroupRole::Member),
            other => Err(IdentityError::InvalidArgument(format!(
                "unknown group role {other:?}"
            ))),
        }
    }
}
