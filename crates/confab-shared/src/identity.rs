//! Canonical room identity.
//!
//! A direct room is keyed by the unordered pair of its participants. The
//! pair is sorted ascending and joined with [`ROOM_ID_SEPARATOR`], so
//! `derive(7, 3)` and `derive(3, 7)` both produce `"3_7"`. Because the key is
//! a pure function of the pair, creating a room is an insert-if-absent on
//! this key rather than a lookup followed by an insert.

use crate::constants::ROOM_ID_SEPARATOR;
use crate::error::IdentityError;
use crate::types::{RoomId, UserId};

/// Derive the canonical room id for a pair of users.
///
/// Fails with [`IdentityError::InvalidArgument`] when both ids are the same
/// user or when either id is not a positive integer.
pub fn derive(a: UserId, b: UserId) -> Result<RoomId, IdentityError> {
    ensure_positive(a)?;
    ensure_positive(b)?;
    if a == b {
        return Err(IdentityError::InvalidArgument(format!(
            "user {a} cannot open a direct room with themselves"
        )));
    }

    let (low, high) = if a < b { (a, b) } else { (b, a) };
    Ok(RoomId::from_canonical(format!(
        "{}{}{}",
        low.0, ROOM_ID_SEPARATOR, high.0
    )))
}

/// Parse a room id back into its `(low, high)` participants.
///
/// Only the exact string [`derive`] would have produced is accepted: no sign
/// characters, no leading zeros, no whitespace, and the first id must be the
/// smaller one.
pub fn participants_of(room_id: &str) -> Result<(UserId, UserId), IdentityError> {
    let malformed = || IdentityError::MalformedRoomId(room_id.to_string());

    let (left, right) = room_id.split_once(ROOM_ID_SEPARATOR).ok_or_else(malformed)?;
    let low = parse_component(left).ok_or_else(malformed)?;
    let high = parse_component(right).ok_or_else(malformed)?;

    if low >= high {
        return Err(malformed());
    }

    Ok((UserId(low), UserId(high)))
}

fn parse_component(s: &str) -> Option<i64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) || s.starts_with('0') {
        return None;
    }
    s.parse::<i64>().ok().filter(|v| *v > 0)
}

fn ensure_positive(user: UserId) -> Result<(), IdentityError> {
    if user.0 <= 0 {
        return Err(IdentityError::InvalidArgument(format!(
            "user id must be positive, got {user}"
        )));
    }
    Ok(())
}
