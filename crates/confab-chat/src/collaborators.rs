//! Interfaces to the systems that own users and contact rules.
//!
//! Messaging does not manage user lifecycles or block lists; the host plugs
//! its own implementations in through these traits.

use confab_shared::UserId;

/// Best-effort existence check against the host's identity system.
pub trait UserDirectory: Send + Sync {
    fn user_exists(&self, user: UserId) -> bool;
}

/// Decides whether two users may exchange direct messages.
pub trait ContactPolicy: Send + Sync {
    /// `true` if `blocker` has blocked `other`.
    fn is_blocked(&self, blocker: UserId, other: UserId) -> bool;
}

/// Treats every positive id as an existing user.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnyUser;

impl UserDirectory for AnyUser {
    fn user_exists(&self, user: UserId) -> bool {
        user.0 > 0
    }
}

/// Blocks nobody.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl ContactPolicy for AllowAll {
    fn is_blocked(&self, _blocker: UserId, _other: UserId) -> bool {
        false
    }
}
