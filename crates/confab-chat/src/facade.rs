//! The messaging entry point.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use confab_shared::{ConversationRef, GroupId, GroupRole, MessageId, MessageKind, RoomId, UserId};
use confab_store::{
    validate_body, Appended, ConsistencyReport, Database, Group, GroupDirectory, MemberAdded,
    Message, MessageStore, Room, RoomDirectory, StoreError, UnreadTracker,
};
use serde::{Deserialize, Serialize};

use crate::collaborators::{AllowAll, AnyUser, ContactPolicy, UserDirectory};
use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::notify::{NoopNotifier, NotificationPayload, NotificationSink};

/// A message as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Text, or an attachment reference for `image` / `file`.
    pub body: String,
    pub kind: MessageKind,
    /// Optional idempotency token. Resending with the same token returns
    /// the original message.
    #[serde(default)]
    pub client_token: Option<String>,
}

impl OutgoingMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            kind: MessageKind::Text,
            client_token: None,
        }
    }

    pub fn attachment(kind: MessageKind, reference: impl Into<String>) -> Self {
        Self {
            body: reference.into(),
            kind,
            client_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.client_token = Some(token.into());
        self
    }
}

/// Read-only connections for listings, so a reader never queues behind the
/// writer mutex. SQLite still admits one writer at a time; readers see the
/// last committed snapshot.
struct ReadPool {
    conns: Vec<Mutex<Database>>,
    next: AtomicUsize,
}

impl ReadPool {
    fn open(path: &Path, size: usize, busy_timeout: Duration) -> Result<Option<Self>> {
        if size == 0 {
            return Ok(None);
        }
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let db = Database::open_read_only(path)?;
            db.set_busy_timeout(busy_timeout)?;
            conns.push(Mutex::new(db));
        }
        tracing::debug!(path = %path.display(), size, "read pool opened");
        Ok(Some(Self {
            conns,
            next: AtomicUsize::new(0),
        }))
    }

    /// First idle connection, or wait on the next one in turn.
    fn acquire(&self) -> Result<MutexGuard<'_, Database>> {
        for conn in &self.conns {
            if let Ok(guard) = conn.try_lock() {
                return Ok(guard);
            }
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        self.conns[slot]
            .lock()
            .map_err(|_| ChatError::Internal("read connection mutex poisoned".into()))
    }
}

/// Composes the store components and enforces the cross-component rules.
///
/// Every mutating operation runs in a single immediate transaction on the
/// writer connection, so a message and the counter bump describing it are
/// committed together or not at all. Listings go through the read pool when
/// the store lives in a file. The facade keeps no chat state of its own.
pub struct ChatFacade {
    db: Mutex<Database>,
    readers: Option<ReadPool>,
    config: ChatConfig,
    users: Arc<dyn UserDirectory>,
    policy: Arc<dyn ContactPolicy>,
    notifier: Arc<dyn NotificationSink>,
}

impl ChatFacade {
    pub fn new(db: Database, config: ChatConfig) -> Self {
        Self {
            db: Mutex::new(db),
            readers: None,
            config,
            users: Arc::new(AnyUser),
            policy: Arc::new(AllowAll),
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Open the configured database and, if enabled, run the consistency
    /// check before serving anything.
    pub fn open(config: ChatConfig) -> Result<Self> {
        let mut db = match &config.database_path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        db.set_busy_timeout(config.busy_timeout)?;

        if config.check_on_start {
            db.check_consistency()?;
        }

        let readers = match db.path() {
            Some(path) => ReadPool::open(&path, config.read_connections, config.busy_timeout)?,
            None => None,
        };
        let mut facade = Self::new(db, config);
        facade.readers = readers;
        Ok(facade)
    }

    pub fn with_user_directory(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = users;
        self
    }

    pub fn with_contact_policy(mut self, policy: Arc<dyn ContactPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn db(&self) -> Result<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| ChatError::Internal("database mutex poisoned".into()))
    }

    /// Connection for read-only queries. Falls back to the writer when no
    /// pool is configured.
    fn reader(&self) -> Result<MutexGuard<'_, Database>> {
        match &self.readers {
            Some(pool) => pool.acquire(),
            None => self.db(),
        }
    }

    fn require_user(&self, user: UserId) -> Result<()> {
        if self.users.user_exists(user) {
            Ok(())
        } else {
            Err(ChatError::NotFound(format!("user {user}")))
        }
    }

    fn require_contact(&self, a: UserId, b: UserId) -> Result<()> {
        if self.policy.is_blocked(a, b) || self.policy.is_blocked(b, a) {
            tracing::debug!(a = %a, b = %b, "contact blocked by policy");
            return Err(ChatError::Forbidden(format!(
                "users {a} and {b} may not message each other"
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Open (or revive) the direct room between two users without sending.
    pub fn start_conversation(&self, user: UserId, other: UserId) -> Result<Room> {
        RoomId::derive(user, other)?;
        self.require_user(user)?;
        self.require_user(other)?;
        self.require_contact(user, other)?;

        let room = self.db()?.write(|tx| RoomDirectory::new(tx).get_or_create(user, other))?;
        Ok(room)
    }

    /// Send a direct message, creating or reviving the room on first contact.
    pub fn send_direct(
        &self,
        sender: UserId,
        recipient: UserId,
        message: &OutgoingMessage,
    ) -> Result<Message> {
        RoomId::derive(sender, recipient)?;
        validate_body(&message.body, message.kind)?;
        self.require_user(sender)?;
        self.require_user(recipient)?;
        self.require_contact(sender, recipient)?;

        let preview_chars = self.config.preview_chars;
        let appended = self.db()?.write(|tx| {
            // A replayed send must not revive a room deleted since the
            // original went out.
            if let Some(token) = message.client_token.as_deref() {
                let store = MessageStore::new(tx);
                if let Some(existing) = store.find_by_client_token(sender, token)? {
                    let expected = ConversationRef::Direct(RoomId::derive(sender, recipient)?);
                    if existing.conversation != expected {
                        return Err(StoreError::Conflict(format!(
                            "client token already used in {}",
                            existing.conversation
                        )));
                    }
                    return Ok(Appended::Replayed(existing));
                }
            }

            let rooms = RoomDirectory::new(tx);
            let room = rooms.get_or_create(sender, recipient)?;
            let conversation = ConversationRef::Direct(room.room_id.clone());

            let appended = MessageStore::new(tx).append_with_token(
                &conversation,
                sender,
                &message.body,
                message.kind,
                message.client_token.as_deref(),
            )?;
            if let Appended::New(m) = &appended {
                rooms.record_message(&room.room_id, sender, &m.preview(preview_chars), m.created_at)?;
            }
            Ok(appended)
        })?;

        tracing::debug!(
            sender = %sender,
            recipient = %recipient,
            message_id = %appended.message().message_id,
            new = appended.is_new(),
            "direct message"
        );

        if let Appended::New(m) = &appended {
            self.dispatch(&[recipient], m);
        }
        Ok(appended.into_message())
    }

    /// Send a message to a group. The sender needs an active membership.
    pub fn send_group(
        &self,
        sender: UserId,
        group_id: &GroupId,
        message: &OutgoingMessage,
    ) -> Result<Message> {
        validate_body(&message.body, message.kind)?;

        let preview_chars = self.config.preview_chars;
        let (appended, recipients) = self.db()?.write(|tx| {
            let groups = GroupDirectory::new(tx);
            groups.get_active(group_id)?;
            if groups.active_membership(group_id, sender)?.is_none() {
                return Err(StoreError::Forbidden(format!(
                    "user {sender} is not a member of group {group_id}"
                )));
            }

            let appended = MessageStore::new(tx).append_with_token(
                &ConversationRef::Group(group_id.clone()),
                sender,
                &message.body,
                message.kind,
                message.client_token.as_deref(),
            )?;

            let mut recipients = Vec::new();
            if let Appended::New(m) = &appended {
                groups.record_message(group_id, sender, &m.preview(preview_chars), m.created_at)?;
                recipients = groups
                    .members(group_id)?
                    .into_iter()
                    .map(|member| member.user_id)
                    .filter(|user| *user != sender)
                    .collect();
            }
            Ok((appended, recipients))
        })?;

        tracing::debug!(
            sender = %sender,
            group_id = %group_id,
            message_id = %appended.message().message_id,
            recipients = recipients.len(),
            "group message"
        );

        if let Appended::New(m) = &appended {
            self.dispatch(&recipients, m);
        }
        Ok(appended.into_message())
    }

    fn dispatch(&self, recipients: &[UserId], message: &Message) {
        let preview = message.preview(self.config.preview_chars);
        for recipient in recipients {
            self.notifier.notify(
                *recipient,
                NotificationPayload {
                    conversation: message.conversation.clone(),
                    message_id: message.message_id,
                    preview: preview.clone(),
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Acknowledge everything up to `upto` and return what is still unread.
    ///
    /// Repeating a call with the same cursor changes nothing.
    pub fn mark_conversation_read(
        &self,
        user: UserId,
        conversation: &ConversationRef,
        upto: MessageId,
    ) -> Result<u32> {
        let remaining = self.db()?.write(|tx| match conversation {
            ConversationRef::Direct(room_id) => {
                let rooms = RoomDirectory::new(tx);
                let room = rooms.get(room_id)?;
                if !room.is_participant(user) {
                    return Err(StoreError::Forbidden(format!(
                        "user {user} is not a participant of room {room_id}"
                    )));
                }
                MessageStore::new(tx).mark_read(conversation, user, upto)?;
                rooms.reset_unread(room_id, user)
            }
            ConversationRef::Group(group_id) => {
                let tracker = UnreadTracker::new(tx);
                tracker.mark_group_read(group_id, user, upto)?;
                tracker.unread_count(group_id, user)
            }
        })?;

        tracing::debug!(user = %user, conversation = %conversation, upto = %upto, remaining, "marked read");
        Ok(remaining)
    }

    /// One page of `conversation` strictly after `cursor`, oldest first.
    ///
    /// Only participants of a live room and active group members may read.
    pub fn list_messages(
        &self,
        viewer: UserId,
        conversation: &ConversationRef,
        cursor: MessageId,
        limit: u32,
    ) -> Result<Vec<Message>> {
        if limit == 0 || limit > self.config.page_limit_cap {
            return Err(ChatError::InvalidArgument(format!(
                "limit must be between 1 and {}",
                self.config.page_limit_cap
            )));
        }

        let db = self.reader()?;
        self.require_reader(&db, viewer, conversation)?;
        let page = db.messages().list_since(conversation, cursor, limit, false)?;
        Ok(page)
    }

    fn require_reader(&self, db: &Database, viewer: UserId, conversation: &ConversationRef) -> Result<()> {
        match conversation {
            ConversationRef::Direct(room_id) => {
                let room = db.rooms().get(room_id)?;
                if room.is_deleted {
                    return Err(ChatError::NotFound(format!("room {room_id}")));
                }
                if !room.is_participant(viewer) {
                    return Err(ChatError::Forbidden(format!(
                        "user {viewer} is not a participant of room {room_id}"
                    )));
                }
            }
            ConversationRef::Group(group_id) => {
                db.groups().get_active(group_id)?;
                if db.groups().active_membership(group_id, viewer)?.is_none() {
                    return Err(ChatError::Forbidden(format!(
                        "user {viewer} is not a member of group {group_id}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Live rooms of `user`, most recent activity first.
    pub fn list_rooms_for(&self, user: UserId) -> Result<Vec<Room>> {
        Ok(self.reader()?.rooms().list_for(user)?)
    }

    pub fn list_groups_for(&self, user: UserId) -> Result<Vec<Group>> {
        Ok(self.reader()?.groups().list_for(user)?)
    }

    /// Unread messages for `user` in one conversation.
    pub fn unread_count(&self, user: UserId, conversation: &ConversationRef) -> Result<u32> {
        let db = self.reader()?;
        let count = match conversation {
            ConversationRef::Direct(room_id) => db.unread().direct_unread(room_id, user)?,
            ConversationRef::Group(group_id) => db.unread().unread_count(group_id, user)?,
        };
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Create a group owned by `owner`, who joins as its first admin.
    ///
    /// With `group_id` the caller picks the identifier and a taken one is a
    /// `Conflict`; without it one is generated.
    pub fn create_group(
        &self,
        owner: UserId,
        group_id: Option<&GroupId>,
        name: &str,
        description: Option<&str>,
    ) -> Result<Group> {
        self.require_user(owner)?;
        let group = self.db()?.write(|tx| {
            let groups = GroupDirectory::new(tx);
            let group = match group_id {
                Some(id) => groups.create_with_id(id, name, owner, description)?,
                None => groups.create(name, owner, description)?,
            };
            UnreadTracker::new(tx).start_at_latest(&group.group_id, owner)?;
            Ok(group)
        })?;
        Ok(group)
    }

    /// Add `target` to a group. Joining starts the new member's read cursor
    /// at the newest message, so nothing sent earlier counts as unread.
    pub fn add_member(
        &self,
        group_id: &GroupId,
        actor: UserId,
        target: UserId,
        role: GroupRole,
    ) -> Result<MemberAdded> {
        self.require_user(target)?;
        let outcome = self.db()?.write(|tx| {
            let outcome = GroupDirectory::new(tx).add_member(group_id, actor, target, role)?;
            if outcome != MemberAdded::AlreadyMember {
                UnreadTracker::new(tx).start_at_latest(group_id, target)?;
            }
            Ok(outcome)
        })?;
        Ok(outcome)
    }

    pub fn remove_member(&self, group_id: &GroupId, actor: UserId, target: UserId) -> Result<()> {
        self.db()?
            .write(|tx| GroupDirectory::new(tx).remove_member(group_id, actor, target))?;
        Ok(())
    }

    pub fn delete_group(&self, group_id: &GroupId, actor: UserId) -> Result<bool> {
        Ok(self
            .db()?
            .write(|tx| GroupDirectory::new(tx).soft_delete(group_id, actor))?)
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Hide a room for both participants until one of them messages again.
    pub fn soft_delete_room(&self, room_id: &RoomId, actor: UserId) -> Result<bool> {
        Ok(self
            .db()?
            .write(|tx| RoomDirectory::new(tx).soft_delete(room_id, actor))?)
    }

    /// Hide a message. Counters and the conversation preview are recomputed
    /// in the same transaction.
    pub fn soft_delete_message(&self, message_id: MessageId, actor: UserId) -> Result<bool> {
        let preview_chars = self.config.preview_chars;
        let changed = self.db()?.write(|tx| {
            let store = MessageStore::new(tx);
            if !store.soft_delete(message_id, actor)? {
                return Ok(false);
            }
            match store.get(message_id)?.conversation {
                ConversationRef::Direct(room_id) => {
                    UnreadTracker::new(tx).sync_direct(&room_id)?;
                    RoomDirectory::new(tx).rebuild_preview(&room_id, preview_chars)?;
                }
                ConversationRef::Group(group_id) => {
                    GroupDirectory::new(tx).rebuild_preview(&group_id, preview_chars)?;
                }
            }
            Ok(true)
        })?;

        if changed {
            tracing::debug!(message_id = %message_id, actor = %actor, "message soft-deleted");
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Repair
    // ------------------------------------------------------------------

    /// Recount a room's unread counters from the message log. Returns
    /// `true` if they had drifted and were repaired.
    pub fn recompute_unread(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self
            .db()?
            .write(|tx| UnreadTracker::new(tx).recompute_unread(room_id))?)
    }

    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        Ok(self.db()?.check_consistency()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    fn facade() -> ChatFacade {
        ChatFacade::new(Database::open_in_memory().unwrap(), ChatConfig::default())
    }

    fn direct(a: i64, b: i64) -> ConversationRef {
        ConversationRef::Direct(RoomId::derive(UserId(a), UserId(b)).unwrap())
    }

    fn room_of(chat: &ChatFacade, user: i64) -> Room {
        chat.list_rooms_for(UserId(user)).unwrap().remove(0)
    }

    struct Blocks(UserId, UserId);

    impl ContactPolicy for Blocks {
        fn is_blocked(&self, blocker: UserId, other: UserId) -> bool {
            blocker == self.0 && other == self.1
        }
    }

    struct Known(HashSet<i64>);

    impl UserDirectory for Known {
        fn user_exists(&self, user: UserId) -> bool {
            self.0.contains(&user.0)
        }
    }

    #[test]
    fn test_first_contact_creates_one_room() {
        let chat = facade();
        let room = chat.start_conversation(UserId(7), UserId(3)).unwrap();
        assert_eq!(room.room_id.as_str(), "3_7");
        assert_eq!((room.unread_count_a, room.unread_count_b), (0, 0));
        assert_eq!(room.other_participant(UserId(7)), Some(UserId(3)));
        assert_eq!(room.other_participant(UserId(4)), None);

        let again = chat.start_conversation(UserId(3), UserId(7)).unwrap();
        assert_eq!(again.room_id, room.room_id);
        assert_eq!(chat.list_rooms_for(UserId(3)).unwrap().len(), 1);
    }

    #[test]
    fn test_send_and_read_direct() {
        let chat = facade();
        let sent = chat
            .send_direct(UserId(3), UserId(7), &OutgoingMessage::text("hello"))
            .unwrap();
        assert!(sent.message_id.0 > 0);

        let room = room_of(&chat, 7);
        assert_eq!(room.last_message_preview.as_deref(), Some("hello"));
        assert_eq!(room.unread_for(UserId(7)), Some(1));
        assert_eq!(room.unread_for(UserId(3)), Some(0));

        let conv = direct(3, 7);
        assert_eq!(chat.mark_conversation_read(UserId(7), &conv, sent.message_id).unwrap(), 0);
        let before = room_of(&chat, 7);
        assert_eq!(chat.mark_conversation_read(UserId(7), &conv, sent.message_id).unwrap(), 0);
        assert_eq!(room_of(&chat, 7), before);
        assert_eq!(chat.unread_count(UserId(7), &conv).unwrap(), 0);
    }

    #[test]
    fn test_unread_conservation() {
        let chat = facade();
        let mut from_three = Vec::new();
        for body in ["a", "b", "c"] {
            from_three.push(
                chat.send_direct(UserId(3), UserId(7), &OutgoingMessage::text(body))
                    .unwrap(),
            );
        }
        for body in ["x", "y"] {
            chat.send_direct(UserId(7), UserId(3), &OutgoingMessage::text(body))
                .unwrap();
        }

        let conv = direct(3, 7);
        let remaining = chat
            .mark_conversation_read(UserId(7), &conv, from_three[1].message_id)
            .unwrap();
        assert_eq!(remaining, 1);
        assert_eq!(chat.unread_count(UserId(7), &conv).unwrap(), 1);
        assert_eq!(chat.unread_count(UserId(3), &conv).unwrap(), 2);

        // Counters maintained by sends and reads need no repair
        assert!(!chat.recompute_unread(&RoomId::derive(UserId(3), UserId(7)).unwrap()).unwrap());
    }

    #[test]
    fn test_concurrent_first_contact_from_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChatConfig {
            database_path: Some(dir.path().join("confab.db")),
            ..ChatConfig::default()
        };
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [(3, 7), (7, 3)]
            .into_iter()
            .map(|(from, to)| {
                let barrier = barrier.clone();
                let config = config.clone();
                thread::spawn(move || {
                    let chat = ChatFacade::open(config).unwrap();
                    barrier.wait();
                    chat.send_direct(UserId(from), UserId(to), &OutgoingMessage::text("hi"))
                        .unwrap()
                })
            })
            .collect();
        let sent: Vec<Message> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(sent[0].conversation, sent[1].conversation);

        let chat = ChatFacade::open(config).unwrap();
        let rooms = chat.list_rooms_for(UserId(3)).unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].unread_for(UserId(3)), Some(1));
        assert_eq!(rooms[0].unread_for(UserId(7)), Some(1));
    }

    #[test]
    fn test_shared_facade_across_threads() {
        let chat = Arc::new(facade());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let chat = chat.clone();
                thread::spawn(move || {
                    let (from, to) = if i % 2 == 0 { (3, 7) } else { (7, 3) };
                    chat.send_direct(UserId(from), UserId(to), &OutgoingMessage::text(format!("m{i}")))
                        .unwrap()
                        .message_id
                })
            })
            .collect();
        let ids: HashSet<MessageId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 8);

        let room = room_of(&chat, 3);
        assert_eq!((room.unread_count_a, room.unread_count_b), (4, 4));
    }

    #[test]
    fn test_group_unread_for_new_members() {
        let chat = facade();
        let eng = GroupId::parse("eng-team").unwrap();
        let group = chat
            .create_group(UserId(1), Some(&eng), "Engineering", None)
            .unwrap();
        assert_eq!(group.group_id, eng);
        let id = group.group_id.clone();
        let conv = ConversationRef::Group(id.clone());
        assert_eq!(
            chat.add_member(&id, UserId(1), UserId(2), GroupRole::Member).unwrap(),
            MemberAdded::Added
        );

        let sent = chat
            .send_group(UserId(2), &id, &OutgoingMessage::text("standup in 5"))
            .unwrap();
        assert_eq!(chat.unread_count(UserId(1), &conv).unwrap(), 1);
        assert_eq!(chat.unread_count(UserId(2), &conv).unwrap(), 0);

        assert_eq!(chat.mark_conversation_read(UserId(1), &conv, sent.message_id).unwrap(), 0);
        assert_eq!(chat.unread_count(UserId(1), &conv).unwrap(), 0);

        chat.add_member(&id, UserId(1), UserId(4), GroupRole::Member).unwrap();
        assert_eq!(chat.unread_count(UserId(4), &conv).unwrap(), 0);

        let groups = chat.list_groups_for(UserId(4)).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].last_message_preview.as_deref(), Some("standup in 5"));
    }

    #[test]
    fn test_self_message_rejected() {
        let chat = facade();
        let err = chat
            .send_direct(UserId(5), UserId(5), &OutgoingMessage::text("me"))
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));
        assert!(matches!(
            chat.start_conversation(UserId(5), UserId(5)),
            Err(ChatError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejections_write_nothing() {
        let chat = facade()
            .with_contact_policy(Arc::new(Blocks(UserId(7), UserId(3))))
            .with_user_directory(Arc::new(Known([3, 7, 8].into_iter().collect())));

        let err = chat
            .send_direct(UserId(3), UserId(7), &OutgoingMessage::text(""))
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));

        let err = chat
            .send_direct(UserId(3), UserId(7), &OutgoingMessage::text("let me in"))
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let err = chat
            .send_direct(UserId(3), UserId(99), &OutgoingMessage::text("hello?"))
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        assert!(chat.list_rooms_for(UserId(3)).unwrap().is_empty());
        chat.send_direct(UserId(3), UserId(8), &OutgoingMessage::text("ok")).unwrap();
        assert_eq!(chat.list_rooms_for(UserId(3)).unwrap().len(), 1);
    }

    #[test]
    fn test_non_member_cannot_send_or_read_group() {
        let chat = facade();
        let group = chat.create_group(UserId(1), None, "eng-team", None).unwrap();
        let conv = ConversationRef::Group(group.group_id.clone());

        let err = chat
            .send_group(UserId(9), &group.group_id, &OutgoingMessage::text("hi"))
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        let err = chat
            .list_messages(UserId(9), &conv, MessageId::START, 10)
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        chat.add_member(&group.group_id, UserId(1), UserId(2), GroupRole::Member).unwrap();
        chat.send_group(UserId(2), &group.group_id, &OutgoingMessage::text("hi")).unwrap();
        chat.remove_member(&group.group_id, UserId(2), UserId(2)).unwrap();
        assert!(chat.list_messages(UserId(2), &conv, MessageId::START, 10).is_err());
        assert_eq!(chat.list_messages(UserId(1), &conv, MessageId::START, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_notifications_follow_commit() {
        let (sink, mut rx) = ChannelNotifier::new(16);
        let chat = facade().with_notifier(Arc::new(sink));

        let message = OutgoingMessage::text("ping").with_token("c-1");
        let first = chat.send_direct(UserId(3), UserId(7), &message).unwrap();
        let replay = chat.send_direct(UserId(3), UserId(7), &message).unwrap();
        assert_eq!(first.message_id, replay.message_id);

        let note = rx.try_recv().unwrap();
        assert_eq!(note.recipient, UserId(7));
        assert_eq!(note.payload.message_id, first.message_id);
        assert_eq!(note.payload.preview, "ping");
        // The replay neither notified nor bumped the counter
        assert!(rx.try_recv().is_err());
        assert_eq!(chat.unread_count(UserId(7), &direct(3, 7)).unwrap(), 1);

        let group = chat.create_group(UserId(1), None, "eng-team", None).unwrap();
        for user in [2, 3] {
            chat.add_member(&group.group_id, UserId(1), UserId(user), GroupRole::Member)
                .unwrap();
        }
        chat.send_group(UserId(2), &group.group_id, &OutgoingMessage::text("all hands"))
            .unwrap();
        let mut recipients = vec![rx.try_recv().unwrap().recipient, rx.try_recv().unwrap().recipient];
        recipients.sort();
        assert_eq!(recipients, vec![UserId(1), UserId(3)]);
    }

    #[test]
    fn test_attachment_preview_hides_reference() {
        let chat = facade();
        chat.send_direct(
            UserId(3),
            UserId(7),
            &OutgoingMessage::attachment(MessageKind::Image, "uploads/2024/cat.png"),
        )
        .unwrap();
        assert_eq!(room_of(&chat, 3).last_message_preview.as_deref(), Some("[image]"));
    }

    #[test]
    fn test_soft_delete_message_updates_counter_and_preview() {
        let chat = facade();
        let a = chat.send_direct(UserId(3), UserId(7), &OutgoingMessage::text("a")).unwrap();
        let b = chat.send_direct(UserId(3), UserId(7), &OutgoingMessage::text("b")).unwrap();

        let err = chat.soft_delete_message(b.message_id, UserId(7)).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        assert!(chat.soft_delete_message(b.message_id, UserId(3)).unwrap());
        assert!(!chat.soft_delete_message(b.message_id, UserId(3)).unwrap());

        let room = room_of(&chat, 7);
        assert_eq!(room.unread_for(UserId(7)), Some(1));
        assert_eq!(room.last_message_preview.as_deref(), Some("a"));

        let page = chat
            .list_messages(UserId(7), &direct(3, 7), MessageId::START, 10)
            .unwrap();
        assert_eq!(page.iter().map(|m| m.message_id).collect::<Vec<_>>(), vec![a.message_id]);
    }

    #[test]
    fn test_soft_delete_room_and_revive() {
        let chat = facade();
        chat.send_direct(UserId(3), UserId(7), &OutgoingMessage::text("old")).unwrap();
        let room_id = RoomId::derive(UserId(3), UserId(7)).unwrap();

        let err = chat.soft_delete_room(&room_id, UserId(9)).unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        assert!(chat.soft_delete_room(&room_id, UserId(7)).unwrap());
        assert!(chat.list_rooms_for(UserId(3)).unwrap().is_empty());
        assert!(matches!(
            chat.list_messages(UserId(3), &direct(3, 7), MessageId::START, 10),
            Err(ChatError::NotFound(_))
        ));

        chat.send_direct(UserId(3), UserId(7), &OutgoingMessage::text("new")).unwrap();
        let room = room_of(&chat, 7);
        assert_eq!(room.room_id, room_id);
        assert_eq!(room.unread_for(UserId(7)), Some(1));
    }

    #[test]
    fn test_list_messages_pages_without_duplicates() {
        let chat = facade();
        for i in 0..5 {
            chat.send_direct(UserId(3), UserId(7), &OutgoingMessage::text(format!("m{i}")))
                .unwrap();
        }
        let conv = direct(3, 7);

        assert!(matches!(
            chat.list_messages(UserId(3), &conv, MessageId::START, 0),
            Err(ChatError::InvalidArgument(_))
        ));
        assert!(matches!(
            chat.list_messages(UserId(3), &conv, MessageId::START, 201),
            Err(ChatError::InvalidArgument(_))
        ));
        assert!(matches!(
            chat.list_messages(UserId(4), &conv, MessageId::START, 10),
            Err(ChatError::Forbidden(_))
        ));

        let mut seen = Vec::new();
        let mut cursor = MessageId::START;
        loop {
            let page = chat.list_messages(UserId(7), &conv, cursor, 2).unwrap();
            let Some(last) = page.last() else { break };
            cursor = last.message_id;
            seen.extend(page.into_iter().map(|m| m.body));
        }
        assert_eq!(seen, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_create_group_with_taken_id_conflicts() {
        let chat = facade();
        let eng = GroupId::parse("eng-team").unwrap();
        chat.create_group(UserId(1), Some(&eng), "Engineering", None).unwrap();

        let err = chat
            .create_group(UserId(2), Some(&eng), "Imposters", None)
            .unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));
        assert!(chat.list_groups_for(UserId(2)).unwrap().is_empty());

        let generated = chat.create_group(UserId(2), None, "Other", None).unwrap();
        assert_ne!(generated.group_id, eng);
    }

    #[test]
    fn test_replayed_send_keeps_deleted_room_deleted() {
        let chat = facade();
        let first = chat
            .send_direct(UserId(3), UserId(7), &OutgoingMessage::text("hi").with_token("t1"))
            .unwrap();
        let room_id = RoomId::derive(UserId(3), UserId(7)).unwrap();
        assert!(chat.soft_delete_room(&room_id, UserId(3)).unwrap());

        let again = chat
            .send_direct(UserId(3), UserId(7), &OutgoingMessage::text("hi").with_token("t1"))
            .unwrap();
        assert_eq!(again.message_id, first.message_id);
        assert!(chat.list_rooms_for(UserId(3)).unwrap().is_empty());
        assert!(chat.list_rooms_for(UserId(7)).unwrap().is_empty());

        // The token belongs to the 3/7 room and cannot be reused elsewhere
        let err = chat
            .send_direct(UserId(3), UserId(9), &OutgoingMessage::text("hi").with_token("t1"))
            .unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));
        assert!(chat.list_rooms_for(UserId(9)).unwrap().is_empty());

        // A fresh send still revives the room
        chat.send_direct(UserId(3), UserId(7), &OutgoingMessage::text("back")).unwrap();
        assert_eq!(room_of(&chat, 7).unread_for(UserId(7)), Some(1));
    }

    #[test]
    fn test_start_conversation_requires_both_users() {
        let chat = facade().with_user_directory(Arc::new(Known([3, 7].into_iter().collect())));

        assert!(matches!(
            chat.start_conversation(UserId(42), UserId(3)),
            Err(ChatError::NotFound(_))
        ));
        assert!(matches!(
            chat.start_conversation(UserId(3), UserId(42)),
            Err(ChatError::NotFound(_))
        ));
        assert!(chat.list_rooms_for(UserId(3)).unwrap().is_empty());

        chat.start_conversation(UserId(3), UserId(7)).unwrap();
        assert_eq!(chat.list_rooms_for(UserId(3)).unwrap().len(), 1);
    }

    #[test]
    fn test_listings_do_not_wait_for_writer() {
        use std::sync::mpsc;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confab.db");
        let config = ChatConfig {
            database_path: Some(path.clone()),
            ..ChatConfig::default()
        };
        let chat = Arc::new(ChatFacade::open(config).unwrap());
        chat.send_direct(UserId(3), UserId(7), &OutgoingMessage::text("hello")).unwrap();

        // Hold the writer mutex, and let a second handle sit on SQLite's
        // write lock with an uncommitted change.
        let writer = chat.db().unwrap();
        let other = Database::open_at(&path).unwrap();
        other.conn().execute_batch("BEGIN IMMEDIATE").unwrap();
        other
            .conn()
            .execute(
                "UPDATE rooms SET last_message_preview = 'uncommitted' WHERE room_id = '3_7'",
                [],
            )
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let reader = chat.clone();
        thread::spawn(move || {
            let rooms = reader.list_rooms_for(UserId(3));
            let unread = reader.unread_count(UserId(7), &direct(3, 7));
            let page = reader.list_messages(UserId(7), &direct(3, 7), MessageId::START, 10);
            let _ = tx.send((rooms, unread, page));
        });

        let (rooms, unread, page) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("listings should not block on the writer");
        let rooms = rooms.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].last_message_preview.as_deref(), Some("hello"));
        assert_eq!(unread.unwrap(), 1);
        assert_eq!(page.unwrap().len(), 1);

        other.conn().execute_batch("ROLLBACK").unwrap();
        drop(writer);
    }

    #[test]
    fn test_delete_group_hides_it() {
        let chat = facade();
        let group = chat.create_group(UserId(1), None, "tmp", None).unwrap();
        assert!(chat.delete_group(&group.group_id, UserId(1)).unwrap());
        assert!(chat.list_groups_for(UserId(1)).unwrap().is_empty());
        assert!(matches!(
            chat.send_group(UserId(1), &group.group_id, &OutgoingMessage::text("anyone?")),
            Err(ChatError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_repairs_drifted_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confab.db");
        let config = ChatConfig {
            database_path: Some(path.clone()),
            ..ChatConfig::default()
        };

        let chat = ChatFacade::open(config.clone()).unwrap();
        chat.send_direct(UserId(3), UserId(7), &OutgoingMessage::text("hello")).unwrap();
        drop(chat);

        let db = Database::open_at(&path).unwrap();
        db.conn()
            .execute("UPDATE rooms SET unread_count_b = 9", [])
            .unwrap();
        drop(db);

        let chat = ChatFacade::open(config).unwrap();
        assert_eq!(chat.unread_count(UserId(7), &direct(3, 7)).unwrap(), 1);
        let report = chat.check_consistency().unwrap();
        assert_eq!(report.rooms_checked, 1);
        assert_eq!(report.counters_repaired, 0);
    }
}
