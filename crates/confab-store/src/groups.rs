//! Groups and their membership rolls.

use chrono::{DateTime, Utc};
use confab_shared::constants::MAX_GROUP_NAME_CHARS;
use confab_shared::{ConversationRef, GroupId, GroupRole, UserId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::convert::{count_from_sql, opt_ts_from_sql, parse_col, ts_from_sql, ts_to_sql};
use crate::error::{Result, StoreError};
use crate::messages::MessageStore;
use crate::models::{preview_of, Group, GroupMembership};

const GROUP_COLUMNS: &str = "g.group_id, g.name, g.description, g.owner, g.last_message_preview, \
                             g.last_message_at, g.is_deleted, g.created_at, g.updated_at";

const MEMBERSHIP_COLUMNS: &str = "group_id, user_id, role, joined_at, is_active";

/// Result of [`GroupDirectory::add_member`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAdded {
    /// A new membership row was inserted.
    Added,
    /// An inactive membership was reactivated.
    Rejoined,
    /// The target was already an active member with the requested role.
    AlreadyMember,
}

pub struct GroupDirectory<'c> {
    conn: &'c Connection,
}

impl<'c> GroupDirectory<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create a group under a freshly generated id. The owner becomes its
    /// first admin.
    pub fn create(&self, name: &str, owner: UserId, description: Option<&str>) -> Result<Group> {
        self.create_with_id(&GroupId::generate(), name, owner, description)
    }

    /// Create a group under an externally assigned id.
    pub fn create_with_id(
        &self,
        group_id: &GroupId,
        name: &str,
        owner: UserId,
        description: Option<&str>,
    ) -> Result<Group> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_GROUP_NAME_CHARS {
            return Err(StoreError::InvalidArgument(format!(
                "group name must be 1..={MAX_GROUP_NAME_CHARS} characters"
            )));
        }
        if owner.0 <= 0 {
            return Err(StoreError::InvalidArgument(format!("invalid owner id {owner}")));
        }

        let now = ts_to_sql(&Utc::now());
        let inserted = self.conn.execute(
            "INSERT INTO chat_groups (group_id, name, description, owner, is_deleted, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
             ON CONFLICT(group_id) DO NOTHING",
            params![group_id.as_str(), name, description, owner.0, now],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!("group {group_id} already exists")));
        }

        self.conn.execute(
            "INSERT INTO group_memberships (group_id, user_id, role, joined_at, is_active)
             VALUES (?1, ?2, 'admin', ?3, 1)",
            params![group_id.as_str(), owner.0, now],
        )?;

        tracing::info!(group_id = %group_id, owner = %owner, "group created");

        self.get(group_id)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a group regardless of its deletion state.
    pub fn get(&self, group_id: &GroupId) -> Result<Group> {
        self.find(group_id)?
            .ok_or_else(|| StoreError::NotFound(format!("group {group_id}")))
    }

    pub fn find(&self, group_id: &GroupId) -> Result<Option<Group>> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM chat_groups g WHERE g.group_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![group_id.as_str()], row_to_group)
            .optional()?)
    }

    /// Fetch a group that has not been deleted.
    pub fn get_active(&self, group_id: &GroupId) -> Result<Group> {
        let group = self.get(group_id)?;
        if group.is_deleted {
            return Err(StoreError::NotFound(format!("group {group_id}")));
        }
        Ok(group)
    }

    /// Non-deleted groups in which `user` holds an active membership.
    pub fn list_for(&self, user: UserId) -> Result<Vec<Group>> {
        let sql = format!(
            "SELECT {GROUP_COLUMNS} FROM chat_groups g
             JOIN group_memberships m ON m.group_id = g.group_id
             WHERE m.user_id = ?1 AND m.is_active = 1 AND g.is_deleted = 0
             ORDER BY COALESCE(g.last_message_at, g.created_at) DESC, g.group_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user.0], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Membership row for `user`, active or not.
    pub fn membership(&self, group_id: &GroupId, user: UserId) -> Result<Option<GroupMembership>> {
        let sql = format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM group_memberships WHERE group_id = ?1 AND user_id = ?2"
        );
        Ok(self
            .conn
            .query_row(&sql, params![group_id.as_str(), user.0], row_to_membership)
            .optional()?)
    }

    pub fn active_membership(
        &self,
        group_id: &GroupId,
        user: UserId,
    ) -> Result<Option<GroupMembership>> {
        Ok(self.membership(group_id, user)?.filter(|m| m.is_active))
    }

    /// Active members, admins first.
    pub fn members(&self, group_id: &GroupId) -> Result<Vec<GroupMembership>> {
        let sql = format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM group_memberships
             WHERE group_id = ?1 AND is_active = 1
             ORDER BY role ASC, user_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![group_id.as_str()], row_to_membership)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    fn active_admin_count(&self, group_id: &GroupId) -> Result<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM group_memberships
             WHERE group_id = ?1 AND role = 'admin' AND is_active = 1",
            params![group_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count_from_sql(count))
    }

    fn require_admin(&self, group_id: &GroupId, actor: UserId) -> Result<()> {
        match self.active_membership(group_id, actor)? {
            Some(m) if m.role == GroupRole::Admin => Ok(()),
            _ => Err(StoreError::Forbidden(format!(
                "user {actor} is not an admin of group {group_id}"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add `target` with `role`. Only active admins may add members.
    ///
    /// Re-adding an active member with the same role is reported as
    /// [`MemberAdded::AlreadyMember`]; asking for a different role is a
    /// `Conflict`. A former member is reactivated on the same row.
    pub fn add_member(
        &self,
        group_id: &GroupId,
        actor: UserId,
        target: UserId,
        role: GroupRole,
    ) -> Result<MemberAdded> {
        self.get_active(group_id)?;
        self.require_admin(group_id, actor)?;
        if target.0 <= 0 {
            return Err(StoreError::InvalidArgument(format!("invalid user id {target}")));
        }

        let now = ts_to_sql(&Utc::now());
        let outcome = match self.membership(group_id, target)? {
            Some(existing) if existing.is_active => {
                if existing.role == role {
                    MemberAdded::AlreadyMember
                } else {
                    return Err(StoreError::Conflict(format!(
                        "user {target} is already a {} of group {group_id}",
                        existing.role.as_str()
                    )));
                }
            }
            Some(_) => {
                self.conn.execute(
                    "UPDATE group_memberships SET role = ?3, joined_at = ?4, is_active = 1
                     WHERE group_id = ?1 AND user_id = ?2 AND is_active = 0",
                    params![group_id.as_str(), target.0, role.as_str(), now],
                )?;
                MemberAdded::Rejoined
            }
            None => {
                self.conn.execute(
                    "INSERT INTO group_memberships (group_id, user_id, role, joined_at, is_active)
                     VALUES (?1, ?2, ?3, ?4, 1)",
                    params![group_id.as_str(), target.0, role.as_str(), now],
                )?;
                MemberAdded::Added
            }
        };

        tracing::debug!(
            group_id = %group_id,
            actor = %actor,
            target = %target,
            role = role.as_str(),
            ?outcome,
            "add member"
        );
        Ok(outcome)
    }

    /// Deactivate `target`'s membership. Admins may remove any member, the
    /// owner included; every member may remove themselves. History is kept.
    ///
    /// The last active admin cannot go, since nobody could manage the group
    /// afterwards.
    pub fn remove_member(&self, group_id: &GroupId, actor: UserId, target: UserId) -> Result<()> {
        self.get_active(group_id)?;

        if actor != target {
            self.require_admin(group_id, actor)?;
        }

        if let Some(m) = self.active_membership(group_id, target)? {
            if m.role == GroupRole::Admin && self.active_admin_count(group_id)? <= 1 {
                return Err(StoreError::Conflict(format!(
                    "user {target} is the last admin of group {group_id}"
                )));
            }
        }

        let changed = self.conn.execute(
            "UPDATE group_memberships SET is_active = 0
             WHERE group_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![group_id.as_str(), target.0],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "user {target} is not a member of group {group_id}"
            )));
        }

        tracing::debug!(group_id = %group_id, actor = %actor, target = %target, "member removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Refresh the group's preview after a message was appended.
    ///
    /// Group unread state is not kept here; see `UnreadTracker`.
    pub fn record_message(
        &self,
        group_id: &GroupId,
        sender: UserId,
        preview: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.get_active(group_id)?;
        if self.active_membership(group_id, sender)?.is_none() {
            return Err(StoreError::Forbidden(format!(
                "user {sender} is not a member of group {group_id}"
            )));
        }

        self.conn.execute(
            "UPDATE chat_groups SET last_message_preview = ?2, last_message_at = ?3, updated_at = ?3
             WHERE group_id = ?1",
            params![group_id.as_str(), preview, ts_to_sql(&at)],
        )?;
        Ok(())
    }

    /// Recompute the cached preview from the newest visible message.
    pub fn rebuild_preview(&self, group_id: &GroupId, preview_chars: usize) -> Result<()> {
        let latest = MessageStore::new(self.conn)
            .latest_visible(&ConversationRef::Group(group_id.clone()))?;
        let (preview, at) = match latest {
            Some(m) => (
                Some(preview_of(&m.body, m.kind, preview_chars)),
                Some(ts_to_sql(&m.created_at)),
            ),
            None => (None, None),
        };
        self.conn.execute(
            "UPDATE chat_groups SET last_message_preview = ?2, last_message_at = ?3 WHERE group_id = ?1",
            params![group_id.as_str(), preview, at],
        )?;
        Ok(())
    }

    /// Soft-delete a group. Only the owner or an active admin may do this.
    pub fn soft_delete(&self, group_id: &GroupId, actor: UserId) -> Result<bool> {
        let group = self.get(group_id)?;
        if actor != group.owner {
            self.require_admin(group_id, actor)?;
        }

        let changed = self.conn.execute(
            "UPDATE chat_groups SET is_deleted = 1, updated_at = ?2 WHERE group_id = ?1 AND is_deleted = 0",
            params![group_id.as_str(), ts_to_sql(&Utc::now())],
        )?;
        if changed > 0 {
            tracing::info!(group_id = %group_id, actor = %actor, "group soft-deleted");
        }
        Ok(changed > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let group_id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let description: Option<String> = row.get(2)?;
    let owner: i64 = row.get(3)?;
    let last_message_preview: Option<String> = row.get(4)?;
    let last_message_at: Option<String> = row.get(5)?;
    let is_deleted: bool = row.get(6)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;

    Ok(Group {
        group_id: parse_col(0, &group_id_str)?,
        name,
        description,
        owner: UserId(owner),
        last_message_preview,
        last_message_at: opt_ts_from_sql(5, last_message_at)?,
        is_deleted,
        created_at: ts_from_sql(7, &created_str)?,
        updated_at: ts_from_sql(8, &updated_str)?,
    })
}

fn row_to_membership(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupMembership> {
    let group_id_str: String = row.get(0)?;
    let user_id: i64 = row.get(1)?;
    let role_str: String = row.get(2)?;
    let joined_str: String = row.get(3)?;
    let is_active: bool = row.get(4)?;

    Ok(GroupMembership {
        group_id: parse_col(0, &group_id_str)?,
        user_id: UserId(user_id),
        role: parse_col(2, &role_str)?,
        joined_at: ts_from_sql(3, &joined_str)?,
        is_active,
    })
}
