//! Channel addressing.
//!
//! Two kinds of channel exist on the real-time socket:
//!
//! - **Pairing channels** carry everything scoped to one conversation. The
//!   name is derived from the two participants' ids, sorted as strings, so
//!   both sides compute the same name without coordinating.
//! - **Personal channels** reach every connection of a single user. The
//!   name is the user id itself.

use crate::constants::PAIRING_PREFIX;
use crate::types::UserId;

/// Deterministic pairing channel for a one-to-one conversation.
pub fn room_for(a: &UserId, b: &UserId) -> String {
    let (a, b) = (a.to_string(), b.to_string());
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{PAIRING_PREFIX}:{low}:{high}")
}

/// Personal notification channel of a user.
pub fn personal_channel(user: &UserId) -> String {
    user.to_string()
}
